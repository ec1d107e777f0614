//! Domain model shared across pipeline stages: downloads, extractions,
//! analyses, and upload payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::identifier::Identifier;

/// File type recognized by the download stage from a response's content
/// type and extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Pdf,
    Xml,
    Html,
    Text,
    Csv,
    Json,
    Binary,
}

/// One file written to disk by a download backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub file_type: FileType,
    pub content_type: Option<String>,
    pub source: String,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
    pub md5: String,
}

/// Output of one backend's attempt to download one identifier's article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub identifier: Identifier,
    pub source: String,
    pub success: bool,
    pub files: Vec<DownloadedFile>,
    pub error_message: Option<String>,
}

impl DownloadResult {
    pub fn failure(identifier: Identifier, source: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            identifier,
            source: source.into(),
            success: false,
            files: Vec::new(),
            error_message: Some(error_message.into()),
        }
    }
}

/// Coordinate space of a reported activation coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoordinateSpace {
    Mni,
    Tal,
    Other,
}

/// Statistical value kind attached to a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatisticType {
    ZStatistic,
    TStatistic,
    FStatistic,
    Correlation,
    PValue,
    Beta,
    Other,
}

impl StatisticType {
    /// Normalize a free-form kind string from an LLM response into the
    /// allowed set, falling back to `Other` for anything unrecognized.
    pub fn from_heuristic(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        if lowered.contains('z') {
            StatisticType::ZStatistic
        } else if lowered.contains('t') {
            StatisticType::TStatistic
        } else if lowered.contains('f') {
            StatisticType::FStatistic
        } else if lowered.contains("correl") {
            StatisticType::Correlation
        } else if lowered.contains('p') {
            StatisticType::PValue
        } else if lowered.contains("beta") {
            StatisticType::Beta
        } else {
            StatisticType::Other
        }
    }
}

/// One reported activation coordinate, with optional statistic annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub space: Option<CoordinateSpace>,
    pub statistic_value: Option<f64>,
    pub statistic_type: Option<StatisticType>,
    pub cluster_size: Option<f64>,
    #[serde(default)]
    pub is_subpeak: bool,
    #[serde(default)]
    pub is_deactivation: bool,
}

impl Coordinate {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            space: None,
            statistic_value: None,
            statistic_type: None,
            cluster_size: None,
            is_subpeak: false,
            is_deactivation: false,
        }
    }
}

/// One table extracted from an article's full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub table_id: String,
    pub raw_content_path: Option<PathBuf>,
    pub table_number: Option<u32>,
    pub caption: Option<String>,
    pub footer: Option<String>,
    pub coordinates: Vec<Coordinate>,
    pub space: Option<CoordinateSpace>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExtractedTable {
    pub fn contains_coordinates(&self) -> bool {
        !self.coordinates.is_empty()
    }
}

/// Result of extracting one article's content from its downloaded files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub slug: String,
    pub source: String,
    pub identifier: Option<Identifier>,
    pub full_text_path: Option<PathBuf>,
    pub tables: Vec<ExtractedTable>,
    pub has_coordinates: bool,
    pub extracted_at: chrono::DateTime<chrono::Utc>,
    pub error_message: Option<String>,
}

impl ExtractedContent {
    pub fn failure(slug: impl Into<String>, source: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            source: source.into(),
            identifier: None,
            full_text_path: None,
            tables: Vec::new(),
            has_coordinates: false,
            extracted_at: chrono::Utc::now(),
            error_message: Some(error_message.into()),
        }
    }
}

/// One author of an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub affiliation: Option<String>,
    pub orcid: Option<String>,
}

/// Bibliographic metadata for an article, as merged across metadata providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleMetadata {
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    pub r#abstract: Option<String>,
    pub journal: Option<String>,
    pub publication_year: Option<i32>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub license: Option<String>,
    pub source: Option<String>,
    pub open_access: Option<bool>,
    #[serde(default)]
    pub raw_metadata: HashMap<String, serde_json::Value>,
}

impl ArticleMetadata {
    /// Fill missing fields from `other`, preferring the longer abstract and
    /// longer author list when both are present.
    pub fn merge_from(&mut self, other: &ArticleMetadata) {
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.journal.is_none() {
            self.journal = other.journal.clone();
        }
        if self.publication_year.is_none() {
            self.publication_year = other.publication_year;
        }
        if self.license.is_none() {
            self.license = other.license.clone();
        }
        if self.source.is_none() {
            self.source = other.source.clone();
        }
        if self.open_access.is_none() {
            self.open_access = other.open_access;
        }
        if self.keywords.is_empty() {
            self.keywords = other.keywords.clone();
        }
        match (&self.r#abstract, &other.r#abstract) {
            (None, Some(_)) => self.r#abstract = other.r#abstract.clone(),
            (Some(mine), Some(theirs)) if theirs.len() > mine.len() => {
                self.r#abstract = other.r#abstract.clone();
            }
            _ => {}
        }
        if other.authors.len() > self.authors.len() {
            self.authors = other.authors.clone();
        }
        for (k, v) in &other.raw_metadata {
            self.raw_metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// The atomic unit passed from extract to create-analyses: one article's
/// extracted content paired with its resolved metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleExtractionBundle {
    pub content: ExtractedContent,
    pub metadata: ArticleMetadata,
}

/// One analysis (contrast) derived from a table, with its coordinates and
/// table provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub name: Option<String>,
    pub description: Option<String>,
    pub coordinates: Vec<Coordinate>,
    pub table_id: String,
    pub table_number: Option<u32>,
    pub table_caption: Option<String>,
    pub table_footer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// All analyses produced for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCollection {
    pub slug: String,
    pub coordinate_space: Option<CoordinateSpace>,
    pub identifier: Option<Identifier>,
    pub analyses: Vec<Analysis>,
}

/// Cache envelope payload for one table's create-analyses output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAnalysesResult {
    pub slug: String,
    pub article_slug: String,
    pub table_id: String,
    pub sanitized_table_id: String,
    pub analysis_collection: AnalysisCollection,
    pub analysis_paths: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
}

/// Sanitize a raw table id into a filesystem- and key-safe form, falling
/// back to a positional name when the raw id is empty after sanitization.
pub fn sanitize_table_id(raw: &str, index: usize) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"[^A-Za-z0-9_-]+").expect("valid regex"));
    let sanitized = re.replace_all(raw.trim(), "-").to_lowercase();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        format!("table-{}", index + 1)
    } else {
        trimmed.to_string()
    }
}

/// Outcome of attempting to upload one article's data to the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub slug: String,
    pub base_study_id: Option<String>,
    pub study_id: Option<String>,
    #[serde(default)]
    pub analysis_ids: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Fields applied to the `BaseStudy` row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseStudyPayload {
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub publication: Option<String>,
    pub authors: Option<String>,
    pub year: Option<i32>,
    pub is_oa: Option<bool>,
}

/// Fields applied to the `Study` row (the `source='llm'` version of a
/// `BaseStudy`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyPayload {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata_blob: serde_json::Map<String, serde_json::Value>,
}

/// One table's fields as upserted during upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePayload {
    pub table_id: String,
    pub table_number: Option<u32>,
    pub label: Option<String>,
    pub title: Option<String>,
}

/// One analysis paired with its coordinate space, ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedAnalysis {
    pub table: TablePayload,
    pub analysis: Analysis,
    pub coordinate_space: Option<CoordinateSpace>,
}

/// Everything the upload stage needs to process one article inside a
/// single savepoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadWorkItem {
    pub article_slug: String,
    pub base_study: BaseStudyPayload,
    pub study: StudyPayload,
    pub analyses: Vec<PreparedAnalysis>,
}

/// Field-merge policy applied when a metadata value already exists on the
/// target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMetadataMode {
    Fill,
    Overwrite,
}

/// Whether an existing `Study` version is updated in place or a new one is
/// always inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadBehavior {
    Update,
    InsertNew,
}

/// Cache-independent record of orchestration progress for the current run,
/// consumed by `--resume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    pub registered_identifiers: Vec<String>,
    pub recorded_downloads: Vec<String>,
    pub recorded_uploads: Vec<String>,
}

/// A bibliographic search query driving the gather stage's search backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
    #[serde(default)]
    pub per_year_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_table_id_replaces_non_alnum_and_lowercases() {
        assert_eq!(sanitize_table_id("Table 2 (MNI)", 1), "table-2-mni");
    }

    #[test]
    fn sanitize_table_id_falls_back_when_empty() {
        assert_eq!(sanitize_table_id("***", 2), "table-3");
        assert_eq!(sanitize_table_id("", 0), "table-1");
    }

    #[test]
    fn merge_from_prefers_longer_abstract() {
        let mut mine = ArticleMetadata {
            r#abstract: Some("short".into()),
            ..Default::default()
        };
        let other = ArticleMetadata {
            r#abstract: Some("a much longer abstract".into()),
            ..Default::default()
        };
        mine.merge_from(&other);
        assert_eq!(mine.r#abstract.as_deref(), Some("a much longer abstract"));
    }

    #[test]
    fn merge_from_does_not_overwrite_populated_title() {
        let mut mine = ArticleMetadata {
            title: Some("Mine".into()),
            ..Default::default()
        };
        let other = ArticleMetadata {
            title: Some("Theirs".into()),
            ..Default::default()
        };
        mine.merge_from(&other);
        assert_eq!(mine.title.as_deref(), Some("Mine"));
    }

    #[test]
    fn statistic_type_heuristic_defaults_to_other() {
        assert_eq!(StatisticType::from_heuristic("z-score"), StatisticType::ZStatistic);
        assert_eq!(StatisticType::from_heuristic("nonsense"), StatisticType::Other);
    }
}
