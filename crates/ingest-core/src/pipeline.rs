//! Pipeline driver: walks the six canonical stages in order, threading
//! each stage's output into the next, hydrating from cache when a stage
//! was skipped earlier in this invocation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::error::{IngestError, Result};
use crate::identifier::Identifiers;
use crate::model::{ArticleExtractionBundle, CreateAnalysesResult, DownloadResult, UploadOutcome};
use crate::stages::create_analyses::CreateAnalysesStage;
use crate::stages::download::DownloadStage;
use crate::stages::extract::ExtractStage;
use crate::stages::gather::GatherStage;
use crate::stages::sync::SyncStage;
use crate::stages::upload::{prepare_work_items, UploadStage};
use crate::stages::CANONICAL_STAGES;

/// Per-stage timing and item-count bookkeeping, returned to the caller for
/// reporting once the run completes.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub stages: Vec<StageSummary>,
}

/// Constructed stage objects and the cache root they share. Any field left
/// `None` means that stage is unconfigured; selecting it in `settings.stages`
/// without constructing it is a validation error caught at `run` time.
#[derive(Default)]
pub struct PipelineContext {
    pub cache_root: PathBuf,
    pub gather: Option<GatherStage>,
    pub download: Option<DownloadStage>,
    pub extract: Option<ExtractStage>,
    pub create_analyses: Option<CreateAnalysesStage>,
    pub upload: Option<UploadStage>,
    pub sync: Option<SyncStage>,
    /// Flipped by the embedding deployment's signal handler (the CLI wires
    /// `tokio::signal::ctrl_c`); stage constructors that take
    /// `with_cancellation` should be given a clone of this token.
    pub cancellation: CancellationToken,
}

/// Holds each stage's output in memory for the remainder of this run, so a
/// later stage never re-hydrates from cache when its upstream just ran.
#[derive(Default)]
struct RunState {
    identifiers: Option<Identifiers>,
    downloads: Option<Vec<DownloadResult>>,
    bundles: Option<Vec<ArticleExtractionBundle>>,
    analyses: Option<HashMap<String, Vec<CreateAnalysesResult>>>,
    outcomes: Option<Vec<UploadOutcome>>,
}

pub struct PipelineDriver {
    context: PipelineContext,
}

impl PipelineDriver {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }

    pub async fn run(&self, settings: &Settings, seeds: Identifiers, label: &str) -> Result<RunSummary> {
        let selected: Vec<&str> = CANONICAL_STAGES
            .iter()
            .copied()
            .filter(|s| settings.stages.iter().any(|selected| selected == s))
            .collect();

        let mut state = RunState::default();
        let mut summary = RunSummary::default();

        for stage in selected {
            if self.context.cancellation.is_cancelled() {
                tracing::info!(stage, "cancellation requested, stopping before this stage");
                break;
            }
            let started = Instant::now();
            let (attempted, succeeded, failed) = match stage {
                "gather" => self.run_gather(settings, &seeds, label, &mut state).await?,
                "download" => self.run_download(settings, &mut state).await?,
                "extract" => self.run_extract(settings, &mut state).await?,
                "create_analyses" => self.run_create_analyses(settings, &mut state).await?,
                "upload" => self.run_upload(settings, &mut state).await?,
                "sync" => self.run_sync(settings, &mut state).await?,
                other => return Err(IngestError::Validation {
                    field: "stages".into(),
                    message: format!("unknown stage {other}"),
                }),
            };

            let stage_summary = StageSummary {
                stage: stage.to_string(),
                attempted,
                succeeded,
                failed,
                duration: started.elapsed(),
            };
            tracing::info!(
                stage = stage_summary.stage,
                attempted,
                succeeded,
                failed,
                duration_ms = stage_summary.duration.as_millis() as u64,
                "stage complete"
            );
            summary.stages.push(stage_summary);
        }

        Ok(summary)
    }

    async fn run_gather(
        &self,
        settings: &Settings,
        seeds: &Identifiers,
        label: &str,
        state: &mut RunState,
    ) -> Result<(usize, usize, usize)> {
        let Some(gather) = &self.context.gather else {
            return Err(missing_stage("gather"));
        };
        let attempted = seeds.len();
        if attempted == 0 {
            state.identifiers = Some(Identifiers::new());
            return Ok((0, 0, 0));
        }
        let result = gather.run(settings, seeds.clone(), label).await?;
        let succeeded = result.len();
        state.identifiers = Some(result);
        Ok((attempted, succeeded, attempted.saturating_sub(succeeded)))
    }

    async fn run_download(&self, settings: &Settings, state: &mut RunState) -> Result<(usize, usize, usize)> {
        let Some(download) = &self.context.download else {
            return Err(missing_stage("download"));
        };
        let identifiers = match state.identifiers.take() {
            Some(i) => i,
            None if settings.use_cached_inputs => self.hydrate_identifiers()?,
            None => return Err(missing_upstream("download", "gather")),
        };
        let attempted = identifiers.len();
        if attempted == 0 {
            state.downloads = Some(Vec::new());
            return Ok((0, 0, 0));
        }
        let results = download.run(settings, &identifiers).await?;
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        state.downloads = Some(results);
        Ok((attempted, succeeded, failed))
    }

    async fn run_extract(&self, settings: &Settings, state: &mut RunState) -> Result<(usize, usize, usize)> {
        let Some(extract) = &self.context.extract else {
            return Err(missing_stage("extract"));
        };
        let downloads = match state.downloads.take() {
            Some(d) => d,
            None if settings.use_cached_inputs => self.hydrate_downloads()?,
            None => return Err(missing_upstream("extract", "download")),
        };
        let attempted = downloads.len();
        if attempted == 0 {
            state.bundles = Some(Vec::new());
            return Ok((0, 0, 0));
        }
        let bundles = extract.run(settings, &downloads).await?;
        let succeeded = bundles.iter().filter(|b| b.content.error_message.is_none()).count();
        let failed = bundles.len() - succeeded;
        state.bundles = Some(bundles);
        Ok((attempted, succeeded, failed))
    }

    async fn run_create_analyses(&self, settings: &Settings, state: &mut RunState) -> Result<(usize, usize, usize)> {
        let Some(create_analyses) = &self.context.create_analyses else {
            return Err(missing_stage("create_analyses"));
        };
        let bundles = match state.bundles.clone() {
            Some(b) => b,
            None if settings.use_cached_inputs => self.hydrate_bundles()?,
            None => return Err(missing_upstream("create_analyses", "extract")),
        };
        let attempted = bundles.iter().map(|b| b.content.tables.len()).sum();
        if attempted == 0 {
            state.analyses = Some(HashMap::new());
            return Ok((0, 0, 0));
        }
        let by_article = create_analyses.run(settings, &bundles).await?;
        let succeeded = by_article.values().flatten().filter(|r| r.error_message.is_none()).count();
        state.analyses = Some(by_article);
        Ok((attempted, succeeded, attempted.saturating_sub(succeeded)))
    }

    async fn run_upload(&self, settings: &Settings, state: &mut RunState) -> Result<(usize, usize, usize)> {
        let Some(upload) = &self.context.upload else {
            return Err(missing_stage("upload"));
        };
        let bundles = match state.bundles.clone() {
            Some(b) => b,
            None if settings.use_cached_inputs => self.hydrate_bundles()?,
            None => return Err(missing_upstream("upload", "extract")),
        };
        let analyses = match state.analyses.clone() {
            Some(a) => a,
            None if settings.use_cached_inputs => self.hydrate_analyses()?,
            None => return Err(missing_upstream("upload", "create_analyses")),
        };

        let items = prepare_work_items(&bundles, &analyses, settings.upload_metadata_mode);
        let attempted = items.len();
        if attempted == 0 {
            state.outcomes = Some(Vec::new());
            return Ok((0, 0, 0));
        }
        let outcomes = upload.run(settings, items).await?;
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let failed = outcomes.len() - succeeded;
        state.outcomes = Some(outcomes);
        Ok((attempted, succeeded, failed))
    }

    async fn run_sync(&self, settings: &Settings, state: &mut RunState) -> Result<(usize, usize, usize)> {
        let Some(sync) = &self.context.sync else {
            return Err(missing_stage("sync"));
        };
        let outcomes = match state.outcomes.clone() {
            Some(o) => o,
            None if settings.use_cached_inputs => return Err(missing_upstream("sync", "upload")),
            None => return Err(missing_upstream("sync", "upload")),
        };
        let attempted = outcomes.iter().filter(|o| o.success).count();
        if attempted == 0 {
            return Ok((0, 0, 0));
        }

        let bundles: HashMap<String, ArticleExtractionBundle> = state
            .bundles
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|b| (b.content.slug.clone(), b))
            .collect();
        let analyses = state.analyses.clone().unwrap_or_default();

        let succeeded = sync.run(settings, &outcomes, &bundles, &HashMap::new(), &analyses).await?;
        Ok((attempted, succeeded, attempted.saturating_sub(succeeded)))
    }

    fn hydrate_identifiers(&self) -> Result<Identifiers> {
        let dir = self.context.cache_root.join("gather").join("_expansions");
        if !dir.exists() {
            return Ok(Identifiers::new());
        }
        let store = crate::cache::CacheStore::open(dir)?;
        let mut collection = Identifiers::new();
        for envelope in store.iter_entries::<crate::identifier::IdentifierExpansion>()? {
            collection.push(envelope.payload.resolved);
        }
        Ok(collection)
    }

    fn hydrate_downloads(&self) -> Result<Vec<DownloadResult>> {
        self.hydrate_from_namespace("download")
    }

    fn hydrate_bundles(&self) -> Result<Vec<ArticleExtractionBundle>> {
        let contents: Vec<crate::model::ExtractedContent> = self.hydrate_from_namespace("extract")?;
        Ok(contents
            .into_iter()
            .map(|content| ArticleExtractionBundle {
                content,
                metadata: Default::default(),
            })
            .collect())
    }

    fn hydrate_analyses(&self) -> Result<HashMap<String, Vec<CreateAnalysesResult>>> {
        let results: Vec<CreateAnalysesResult> = self.hydrate_from_namespace("create_analyses")?;
        let mut by_article: HashMap<String, Vec<CreateAnalysesResult>> = HashMap::new();
        for result in results {
            by_article.entry(result.article_slug.clone()).or_default().push(result);
        }
        Ok(by_article)
    }

    /// Iterate every per-source cache under `cache_root/<namespace>/*` and
    /// decode each payload, skipping unreconstructable entries with a
    /// warning rather than failing the hydration.
    fn hydrate_from_namespace<T: serde::de::DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        let dir = self.context.cache_root.join(namespace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| IngestError::io_with_path(e, &dir))? {
            let entry = entry.map_err(|e| IngestError::io_with_path(e, &dir))?;
            if !entry.path().is_dir() {
                continue;
            }
            let store = crate::cache::CacheStore::open(entry.path())?;
            match store.iter_entries::<T>() {
                Ok(entries) => items.extend(entries.into_iter().map(|e| e.payload)),
                Err(e) => tracing::warn!("skipping unreconstructable cache source {:?}: {e}", entry.path()),
            }
        }
        Ok(items)
    }
}

fn missing_stage(stage: &str) -> IngestError {
    IngestError::Validation {
        field: "stages".into(),
        message: format!("{stage} is selected but was never constructed in the pipeline context"),
    }
}

fn missing_upstream(stage: &str, upstream: &str) -> IngestError {
    IngestError::Validation {
        field: "stages".into(),
        message: format!("{stage} has no input: {upstream} did not run this invocation and use_cached_inputs is false"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_summary_serializes() {
        let summary = RunSummary {
            stages: vec![StageSummary {
                stage: "gather".into(),
                attempted: 1,
                succeeded: 1,
                failed: 0,
                duration: Duration::from_millis(5),
            }],
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"gather\""));
    }
}
