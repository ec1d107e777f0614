//! Thin CLI entry point for the ns-pond ingestion pipeline: parses
//! arguments, resolves `Settings`, initializes tracing, and delegates to
//! `ingest_core::pipeline::PipelineDriver`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ingest_core::cancel::CancellationToken;
use ingest_core::config::Settings;
use ingest_core::identifier::Identifiers;
use ingest_core::pipeline::{PipelineContext, PipelineDriver};
use ingest_core::stages::gather::GatherStage;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ingest-cli")]
#[command(about = "Runs the neuroimaging-article ingestion pipeline")]
struct Args {
    /// YAML config file, layered between environment variables and these flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stage subset to run, in any order (canonical order is still enforced).
    #[arg(long = "stage")]
    stages: Vec<String>,

    /// Seed identifier manifest (JSONL), used when the gather stage is skipped.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Label for this run's gather-stage manifest file.
    #[arg(long, default_value = "run")]
    label: String,

    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    cache_root: Option<PathBuf>,

    #[arg(long)]
    ns_pond_root: Option<PathBuf>,

    #[arg(long)]
    cache_only: bool,

    #[arg(long)]
    force_redownload: bool,

    #[arg(long)]
    force_reextract: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn resolve_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_yaml(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => Settings::default(),
    };
    settings = settings.apply_env_overrides();

    if !args.stages.is_empty() {
        settings.stages = args.stages.clone();
    }
    if let Some(path) = &args.data_root {
        settings.data_root = path.clone();
    }
    if let Some(path) = &args.cache_root {
        settings.cache_root = path.clone();
    }
    if let Some(path) = &args.ns_pond_root {
        settings.ns_pond_root = path.clone();
    }
    if args.cache_only {
        settings.cache_only_mode = true;
    }
    if args.force_redownload {
        settings.force_redownload = true;
    }
    if args.force_reextract {
        settings.force_reextract = true;
    }
    if args.dry_run {
        settings.dry_run = true;
    }
    if args.verbose {
        settings.verbose = true;
    }
    if let Some(path) = &args.manifest {
        settings.manifest_path = Some(path.clone());
    }

    Ok(settings)
}

fn init_tracing(settings: &Settings) {
    let level = if settings.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = resolve_settings(&args)?;
    init_tracing(&settings);

    info!(data_root = %settings.data_root.display(), cache_root = %settings.cache_root.display(), "starting ingestion run");
    settings.ensure_directories().context("creating configured root directories")?;

    let seeds = match &settings.manifest_path {
        Some(path) => GatherStage::load_manifest(path).with_context(|| format!("loading manifest {}", path.display()))?,
        None => Identifiers::new(),
    };

    if settings.dry_run {
        info!(stages = ?settings.stages, seed_count = seeds.len(), "dry run: not invoking the pipeline driver");
        return Ok(());
    }

    let cancellation = CancellationToken::new();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, draining in-flight work before stopping");
                cancellation.cancel();
            }
        }
    });

    // Concrete backends (download sources, metadata providers, the LLM
    // client, the relational store pool) are wired by the embedding
    // deployment, not by this thin entry point — their contracts are
    // abstract per the pipeline's component design. A stage selected here
    // without a corresponding backend construction fails fast with a
    // validation error naming the gap.
    let context = PipelineContext {
        cache_root: settings.cache_root.clone(),
        cancellation,
        ..Default::default()
    };
    let driver = PipelineDriver::new(context);

    let summary = driver.run(&settings, seeds, &args.label).await?;
    for stage in &summary.stages {
        info!(
            stage = stage.stage,
            attempted = stage.attempted,
            succeeded = stage.succeeded,
            failed = stage.failed,
            duration_ms = stage.duration.as_millis() as u64,
            "stage summary"
        );
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
