//! Create-analyses stage: per-table LLM extraction of coordinates into
//! `AnalysisCollection`s, with per-table caching and a bounded worker pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::{CacheEnvelope, CacheStore};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::error::Result;
use crate::model::{
    Analysis, AnalysisCollection, ArticleExtractionBundle, Coordinate, CoordinateSpace, CreateAnalysesResult,
    StatisticType, sanitize_table_id,
};

/// An LLM client that turns one table's prompt into its raw JSON response
/// text. Provider wiring (model, endpoint, auth) is out of scope here.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Build the per-table prompt: article title, abstract, table metadata,
/// caption, footer, and the raw table text.
pub fn build_prompt(
    article_title: &str,
    article_abstract: &str,
    table_id: &str,
    table_number: Option<u32>,
    caption: &str,
    footer: &str,
    metadata: &HashMap<String, serde_json::Value>,
    raw_table_text: &str,
) -> String {
    format!(
        "You are extracting neuroimaging coordinate tables from a scientific article.\n\
         Article title: {article_title}\n\
         Article abstract: {article_abstract}\n\
         Table id: {table_id}\n\
         Table number: {table_number:?}\n\
         Table caption: {caption}\n\
         Table footer: {footer}\n\
         Table metadata: {metadata:?}\n\
         Raw table content:\n{raw_table_text}\n\n\
         Only emit coordinates that actually appear in the table's X/Y/Z columns. \
         Supply the coordinate space when it can be determined from the table or its caption. \
         Group coordinates by the analysis or contrast they are explicitly reported under; \
         never invent an analysis name — if no name can be determined, omit it. \
         Respond with JSON matching: {{\"analyses\": [{{\"name\": string|null, \"description\": string|null, \
         \"points\": [{{\"coordinates\": [x, y, z], \"space\": \"MNI\"|\"TAL\"|null, \
         \"values\": [{{\"value\": number|string|null, \"kind\": string|null}}]}}]}}]}}"
    )
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    analyses: Vec<RawAnalysis>,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    points: Vec<RawPoint>,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    coordinates: Vec<serde_json::Value>,
    space: Option<String>,
    #[serde(default)]
    values: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    value: serde_json::Value,
    kind: Option<String>,
}

fn coerce_space(raw: Option<&str>) -> Option<CoordinateSpace> {
    match raw.map(|s| s.to_uppercase()) {
        Some(s) if s == "MNI" => Some(CoordinateSpace::Mni),
        Some(s) if s == "TAL" => Some(CoordinateSpace::Tal),
        Some(_) => Some(CoordinateSpace::Other),
        None => None,
    }
}

fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce one raw point into a [`Coordinate`], dropping it (returning
/// `None`) if it is not a valid numeric triple.
fn coerce_point(raw: RawPoint) -> Option<Coordinate> {
    if raw.coordinates.len() != 3 {
        return None;
    }
    let mut numbers = raw.coordinates.iter().filter_map(coerce_number);
    let (x, y, z) = (numbers.next()?, numbers.next()?, numbers.next()?);

    let mut coordinate = Coordinate::new(x, y, z);
    coordinate.space = coerce_space(raw.space.as_deref());

    if let Some(first_value) = raw.values.into_iter().next() {
        let kind = match (&first_value.value, first_value.kind.as_deref()) {
            (_, Some(kind)) => StatisticType::from_heuristic(kind),
            (serde_json::Value::Number(_), None) => StatisticType::TStatistic,
            (serde_json::Value::String(s), None) if s.trim().parse::<f64>().is_ok() => StatisticType::TStatistic,
            _ => StatisticType::Other,
        };
        coordinate.statistic_value = coerce_number(&first_value.value);
        coordinate.statistic_type = Some(kind);
    }
    Some(coordinate)
}

/// Decode an LLM response for one table into its analyses. A whole-table
/// validation failure is logged and yields an empty list — never aborts
/// the stage.
pub fn parse_llm_response(body: &str, table_id: &str, table_number: Option<u32>, caption: Option<&str>, footer: Option<&str>) -> Vec<Analysis> {
    let parsed: RawResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("LLM response for table {table_id} failed schema validation: {e}");
            return Vec::new();
        }
    };

    parsed
        .analyses
        .into_iter()
        .map(|raw| Analysis {
            name: raw.name,
            description: raw.description,
            coordinates: raw.points.into_iter().filter_map(coerce_point).collect(),
            table_id: table_id.to_string(),
            table_number,
            table_caption: caption.map(str::to_string),
            table_footer: footer.map(str::to_string),
            metadata: HashMap::new(),
        })
        .collect()
}

#[derive(Serialize, Deserialize)]
struct Job {
    article_slug: String,
    table_id: String,
    sanitized_table_id: String,
    table_number: Option<u32>,
    caption: Option<String>,
    footer: Option<String>,
    prompt: String,
}

pub struct CreateAnalysesStage {
    llm: Arc<dyn LlmClient>,
    cache_root: PathBuf,
    cancellation: CancellationToken,
}

impl CreateAnalysesStage {
    pub fn new(llm: Arc<dyn LlmClient>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            llm,
            cache_root: cache_root.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the pipeline driver so a ctrl-c
    /// during this stage stops dispatching new jobs between work items.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub async fn run(
        &self,
        settings: &Settings,
        bundles: &[ArticleExtractionBundle],
    ) -> Result<HashMap<String, Vec<CreateAnalysesResult>>> {
        let store = CacheStore::open(self.cache_root.join("create_analyses").join("_default"))?;
        let artifacts_dir = self.cache_root.join("create_analyses").join("artifacts");
        std::fs::create_dir_all(&artifacts_dir).map_err(|e| crate::error::IngestError::io_with_path(e, &artifacts_dir))?;

        let mut results: HashMap<String, Vec<CreateAnalysesResult>> = HashMap::new();
        let mut jobs = Vec::new();

        for bundle in bundles {
            let article_slug = &bundle.content.slug;
            for (index, table) in bundle.content.tables.iter().enumerate() {
                if table.coordinates.is_empty() && !table.contains_coordinates() {
                    continue;
                }
                let sanitized = sanitize_table_id(&table.table_id, index);
                let cache_key = format!("{article_slug}::{sanitized}");

                if let Some(cached) = store.get::<CreateAnalysesResult>(&cache_key)? {
                    results.entry(article_slug.clone()).or_default().push(cached.payload);
                    continue;
                }

                let raw_table_text = table
                    .raw_content_path
                    .as_ref()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .unwrap_or_default();
                let prompt = build_prompt(
                    bundle.metadata.title.as_deref().unwrap_or(""),
                    bundle.metadata.r#abstract.as_deref().unwrap_or(""),
                    &table.table_id,
                    table.table_number,
                    table.caption.as_deref().unwrap_or(""),
                    table.footer.as_deref().unwrap_or(""),
                    &table.metadata,
                    &raw_table_text,
                );

                jobs.push(Job {
                    article_slug: article_slug.clone(),
                    table_id: table.table_id.clone(),
                    sanitized_table_id: sanitized,
                    table_number: table.table_number,
                    caption: table.caption.clone(),
                    footer: table.footer.clone(),
                    prompt,
                });
            }
        }

        if jobs.is_empty() {
            return Ok(results);
        }

        let semaphore = Arc::new(Semaphore::new(settings.n_llm_workers.max(1)));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.cancellation.is_cancelled() {
                tracing::info!("cancellation requested, not dispatching remaining create-analyses jobs");
                break;
            }
            let permit = semaphore.clone();
            let llm = self.llm.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let response = llm.generate(&job.prompt).await;
                (job, response)
            }));
        }

        let mut new_entries = Vec::new();
        for handle in handles {
            let (job, response) = handle.await.expect("create-analyses worker panicked");
            let analyses = match response {
                Ok(body) => parse_llm_response(&body, &job.table_id, job.table_number, job.caption.as_deref(), job.footer.as_deref()),
                Err(e) => {
                    tracing::warn!("LLM request failed for table {}: {e}", job.table_id);
                    Vec::new()
                }
            };

            let collection = AnalysisCollection {
                slug: job.article_slug.clone(),
                coordinate_space: analyses.iter().find_map(|a| a.coordinates.first().and_then(|c| c.space)),
                identifier: None,
                analyses,
            };

            let artifact_path = artifacts_dir.join(format!("{}.jsonl", job.sanitized_table_id));
            let mut file = std::fs::File::create(&artifact_path).map_err(|e| crate::error::IngestError::io_with_path(e, &artifact_path))?;
            writeln!(file, "{}", serde_json::to_string(&collection)?).map_err(|e| crate::error::IngestError::io_with_path(e, &artifact_path))?;

            let cache_key = format!("{}::{}", job.article_slug, job.sanitized_table_id);
            let result = CreateAnalysesResult {
                slug: cache_key.clone(),
                article_slug: job.article_slug.clone(),
                table_id: job.table_id.clone(),
                sanitized_table_id: job.sanitized_table_id.clone(),
                analysis_collection: collection,
                analysis_paths: vec![artifact_path],
                metadata: HashMap::new(),
                error_message: None,
            };

            new_entries.push((CacheEnvelope::new(cache_key, result.clone()), Default::default()));
            results.entry(job.article_slug).or_default().push(result);
        }

        store.add_entries(&new_entries)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_llm_response_drops_invalid_points() {
        let body = r#"{"analyses": [{"name": "main", "points": [
            {"coordinates": [1.0, 2.0, 3.0], "space": "MNI", "values": [{"value": 4.2, "kind": null}]},
            {"coordinates": [1.0, 2.0], "space": null, "values": []}
        ]}]}"#;
        let analyses = parse_llm_response(body, "t1", Some(1), None, None);
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].coordinates.len(), 1);
        assert_eq!(analyses[0].coordinates[0].statistic_type, Some(StatisticType::TStatistic));
    }

    #[test]
    fn parse_llm_response_returns_empty_on_schema_failure() {
        let analyses = parse_llm_response("not json", "t1", None, None, None);
        assert!(analyses.is_empty());
    }

    #[test]
    fn bare_numeric_string_value_is_coerced_as_t_statistic() {
        let body = r#"{"analyses": [{"points": [
            {"coordinates": [0, 0, 0], "values": [{"value": "3.1", "kind": null}]}
        ]}]}"#;
        let analyses = parse_llm_response(body, "t1", None, None, None);
        assert_eq!(analyses[0].coordinates[0].statistic_type, Some(StatisticType::TStatistic));
    }
}
