//! Headless library implementing the multi-stage neuroimaging-article
//! ingestion pipeline: gather, download, extract, create_analyses, upload,
//! sync, each backed by an on-disk cache and a source-fallback scheduler.
//!
//! # Example
//!
//! ```rust,no_run
//! use ingest_core::{config::Settings, identifier::Identifiers, pipeline::{PipelineContext, PipelineDriver}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::default();
//!     let context = PipelineContext {
//!         cache_root: settings.cache_root.clone(),
//!         ..Default::default()
//!     };
//!     let driver = PipelineDriver::new(context);
//!     let summary = driver.run(&settings, Identifiers::new(), "run-1").await?;
//!     println!("{:?}", summary);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod identifier;
pub mod model;
pub mod network;
pub mod pipeline;
pub mod source;
pub mod stages;

pub use cancel::CancellationToken;
pub use config::Settings;
pub use error::{IngestError, Result};
pub use identifier::{Identifier, Identifiers};
pub use pipeline::{PipelineContext, PipelineDriver, RunSummary, StageSummary};
pub use source::{run_with_fallback, SourceBackend};
