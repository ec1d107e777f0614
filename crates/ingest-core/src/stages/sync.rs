//! Sync stage: materializes the ns-pond mirror directory for every
//! successfully uploaded article, hydrating from the extract/download
//! caches when the bundle didn't survive in memory from an earlier stage.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cache::CacheStore;
use crate::config::Settings;
use crate::error::{IngestError, Result};
use crate::model::{ArticleExtractionBundle, CreateAnalysesResult, DownloadResult, UploadOutcome};

/// Write `bytes` to `path`, creating parent directories as needed.
/// `overwrite=false` and an existing file is a silent no-op, matching
/// `sync_overwrite`'s per-file replacement policy.
fn write_file(path: &Path, bytes: &[u8], overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IngestError::io_with_path(e, parent))?;
    }
    std::fs::write(path, bytes).map_err(|e| IngestError::io_with_path(e, path))
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
}

pub struct SyncStage {
    cache_root: PathBuf,
}

impl SyncStage {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    /// For every successful outcome with a `base_study_id`, materialize
    /// `ns_pond_root/<base_study_id>/`. Bundles/downloads supplied in-memory
    /// (from earlier stages this run) are preferred; anything missing is
    /// hydrated from the extract and download caches.
    pub async fn run(
        &self,
        settings: &Settings,
        outcomes: &[UploadOutcome],
        bundles: &HashMap<String, ArticleExtractionBundle>,
        downloads: &HashMap<String, Vec<DownloadResult>>,
        analyses: &HashMap<String, Vec<CreateAnalysesResult>>,
    ) -> Result<usize> {
        let mut synced = 0;
        for outcome in outcomes {
            if !outcome.success {
                continue;
            }
            let Some(base_study_id) = &outcome.base_study_id else { continue };

            let bundle = match bundles.get(&outcome.slug) {
                Some(b) => Some(b.clone()),
                None => self.hydrate_bundle(&outcome.slug)?,
            };
            let Some(bundle) = bundle else {
                tracing::warn!("sync: no extracted content available for {}, skipping", outcome.slug);
                continue;
            };

            let files = match downloads.get(&outcome.slug) {
                Some(d) => d.clone(),
                None => self.hydrate_downloads(&outcome.slug)?,
            };

            let article_root = settings.ns_pond_root.join(base_study_id);
            self.write_identifiers(&article_root, &bundle, settings.sync_overwrite)?;

            let source = bundle.content.source.clone();
            let table_analyses = analyses.get(&outcome.slug).cloned().unwrap_or_default();
            self.write_processed(&article_root, &source, &bundle, &table_analyses, settings.sync_overwrite)?;
            self.write_source(&article_root, &source, &files, &bundle, settings.sync_overwrite)?;

            synced += 1;
        }
        Ok(synced)
    }

    fn hydrate_bundle(&self, slug: &str) -> Result<Option<ArticleExtractionBundle>> {
        for source_dir in self.list_source_namespaces("extract")? {
            let store = CacheStore::open(self.cache_root.join("extract").join(&source_dir))?;
            if let Some(envelope) = store.get::<crate::model::ExtractedContent>(slug)? {
                // Metadata lives alongside content in the bundle produced by
                // the extract stage; without it in cache we degrade to an
                // empty default rather than fail the sync.
                return Ok(Some(ArticleExtractionBundle {
                    content: envelope.payload,
                    metadata: Default::default(),
                }));
            }
        }
        Ok(None)
    }

    fn hydrate_downloads(&self, slug: &str) -> Result<Vec<DownloadResult>> {
        let mut found = Vec::new();
        for source_dir in self.list_source_namespaces("download")? {
            let store = CacheStore::open(self.cache_root.join("download").join(&source_dir))?;
            if let Some(envelope) = store.get::<DownloadResult>(slug)? {
                found.push(envelope.payload);
            }
        }
        Ok(found)
    }

    fn list_source_namespaces(&self, stage: &str) -> Result<HashSet<String>> {
        let dir = self.cache_root.join(stage);
        let mut names = HashSet::new();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&dir).map_err(|e| IngestError::io_with_path(e, &dir))? {
            let entry = entry.map_err(|e| IngestError::io_with_path(e, &dir))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn write_identifiers(&self, article_root: &Path, bundle: &ArticleExtractionBundle, overwrite: bool) -> Result<()> {
        let identifier = bundle.content.identifier.clone().unwrap_or_default();
        let bytes = serde_json::to_vec_pretty(&identifier)?;
        write_file(&article_root.join("identifiers.json"), &bytes, overwrite)
    }

    fn write_processed(
        &self,
        article_root: &Path,
        source: &str,
        bundle: &ArticleExtractionBundle,
        table_analyses: &[CreateAnalysesResult],
        overwrite: bool,
    ) -> Result<()> {
        let processed_dir = article_root.join("processed").join(source);

        let metadata_bytes = serde_json::to_vec_pretty(&bundle.metadata)?;
        write_file(&processed_dir.join("metadata.json"), &metadata_bytes, overwrite)?;

        if let Some(full_text_path) = &bundle.content.full_text_path {
            if let Ok(text_bytes) = std::fs::read(full_text_path) {
                let ext = extension_of(full_text_path);
                write_file(&processed_dir.join(format!("text.{ext}")), &text_bytes, overwrite)?;
            }
        }

        let mut tables_jsonl = Vec::new();
        for table in &bundle.content.tables {
            writeln!(tables_jsonl, "{}", serde_json::to_string(table)?)
                .map_err(|e| IngestError::io_with_path(e, &processed_dir))?;
        }
        write_file(&processed_dir.join("tables.jsonl"), &tables_jsonl, overwrite)?;

        let mut analyses_jsonl = Vec::new();
        for result in table_analyses {
            for analysis in &result.analysis_collection.analyses {
                let augmented = serde_json::json!({
                    "analysis": analysis,
                    "table_id": result.table_id,
                    "coordinate_space": result.analysis_collection.coordinate_space,
                });
                writeln!(analyses_jsonl, "{}", serde_json::to_string(&augmented)?)
                    .map_err(|e| IngestError::io_with_path(e, &processed_dir))?;
            }
        }
        write_file(&processed_dir.join("analyses.jsonl"), &analyses_jsonl, overwrite)?;

        let coordinates_csv = render_coordinates_csv(table_analyses);
        write_file(&processed_dir.join("coordinates.csv"), coordinates_csv.as_bytes(), overwrite)?;

        Ok(())
    }

    fn write_source(
        &self,
        article_root: &Path,
        source: &str,
        files: &[DownloadResult],
        bundle: &ArticleExtractionBundle,
        overwrite: bool,
    ) -> Result<()> {
        let source_dir = article_root.join("source").join(source);
        for result in files.iter().filter(|r| r.source == source) {
            for downloaded in &result.files {
                if let Ok(bytes) = std::fs::read(&downloaded.path) {
                    let filename = downloaded.path.file_name().and_then(|n| n.to_str()).unwrap_or("download.bin");
                    write_file(&source_dir.join(filename), &bytes, overwrite)?;
                }
            }
        }

        for (index, table) in bundle.content.tables.iter().enumerate() {
            let Some(raw_path) = &table.raw_content_path else { continue };
            let Ok(bytes) = std::fs::read(raw_path) else { continue };
            let sanitized = crate::model::sanitize_table_id(&table.table_id, index);
            let ext = extension_of(raw_path);
            write_file(&source_dir.join("tables").join(format!("{sanitized}.{ext}")), &bytes, overwrite)?;
        }
        Ok(())
    }
}

/// Standard columns plus extra fields unioned from per-table coordinate
/// metadata, matching what individual tables' own CSVs would carry.
fn render_coordinates_csv(table_analyses: &[CreateAnalysesResult]) -> String {
    let mut extra_columns: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for result in table_analyses {
        for analysis in &result.analysis_collection.analyses {
            for (key, _) in &analysis.metadata {
                if seen.insert(key.clone()) {
                    extra_columns.push(key.clone());
                }
            }
        }
    }

    let mut header = vec![
        "table_id".to_string(),
        "analysis_name".to_string(),
        "x".to_string(),
        "y".to_string(),
        "z".to_string(),
        "space".to_string(),
        "statistic_type".to_string(),
        "statistic_value".to_string(),
    ];
    header.extend(extra_columns.iter().cloned());
    let mut out = header.join(",") + "\n";

    for result in table_analyses {
        for analysis in &result.analysis_collection.analyses {
            let name = analysis.name.as_deref().unwrap_or("");
            for coordinate in &analysis.coordinates {
                let mut row = vec![
                    result.table_id.clone(),
                    name.to_string(),
                    coordinate.x.to_string(),
                    coordinate.y.to_string(),
                    coordinate.z.to_string(),
                    coordinate.space.map(|s| format!("{s:?}")).unwrap_or_default(),
                    coordinate.statistic_type.map(|s| format!("{s:?}")).unwrap_or_default(),
                    coordinate.statistic_value.map(|v| v.to_string()).unwrap_or_default(),
                ];
                for column in &extra_columns {
                    row.push(analysis.metadata.get(column).map(|v| v.to_string()).unwrap_or_default());
                }
                out.push_str(&row.join(","));
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, AnalysisCollection, Coordinate, CoordinateSpace};

    #[test]
    fn render_coordinates_csv_includes_standard_columns() {
        let collection = AnalysisCollection {
            slug: "a1".into(),
            coordinate_space: Some(CoordinateSpace::Mni),
            identifier: None,
            analyses: vec![Analysis {
                name: Some("Contrast A".into()),
                description: None,
                coordinates: vec![Coordinate::new(1.0, 2.0, 3.0)],
                table_id: "table-1".into(),
                table_number: Some(1),
                table_caption: None,
                table_footer: None,
                metadata: HashMap::new(),
            }],
        };
        let result = CreateAnalysesResult {
            slug: "a1::table-1".into(),
            article_slug: "a1".into(),
            table_id: "table-1".into(),
            sanitized_table_id: "table-1".into(),
            analysis_collection: collection,
            analysis_paths: Vec::new(),
            metadata: HashMap::new(),
            error_message: None,
        };

        let csv = render_coordinates_csv(&[result]);
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), "table_id,analysis_name,x,y,z,space,statistic_type,statistic_value");
        assert_eq!(lines.next().unwrap(), "table-1,Contrast A,1,2,3,,,");
    }

    #[test]
    fn write_file_respects_overwrite_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_file(&path, b"first", false).unwrap();
        write_file(&path, b"second", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        write_file(&path, b"second", true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }
}
