//! Per-stage, per-source on-disk cache.
//!
//! Every `(stage namespace, source name)` pair owns a directory containing
//! a SQLite index (`index.sqlite`) and a sibling lock file (`index.lock`)
//! that serializes writes across processes. See [`CacheStore`] for the
//! slug-keyed envelope API and [`CacheStore::partition`] for the
//! idempotency primitive every stage scheduler relies on.

mod envelope;
mod lock;
mod store;

pub use envelope::CacheEnvelope;
pub use lock::FileLock;
pub use store::{CacheStore, IdentifierAliases};
