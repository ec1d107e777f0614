//! Pipeline configuration: resolved in precedence CLI > YAML > environment
//! variables > defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::model::{UploadBehavior, UploadMetadataMode};

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_cache_root() -> PathBuf {
    PathBuf::from("cache")
}
fn default_ns_pond_root() -> PathBuf {
    PathBuf::from("ns_pond")
}
fn default_download_sources() -> Vec<String> {
    vec!["pubget".into(), "elsevier".into(), "ace".into()]
}
fn default_metadata_providers() -> Vec<String> {
    vec!["semantic_scholar".into(), "pubmed".into()]
}
fn default_max_workers() -> usize {
    4
}
fn default_ace_max_workers() -> usize {
    2
}
fn default_n_llm_workers() -> usize {
    4
}
fn default_stages() -> Vec<String> {
    vec![
        "gather".into(),
        "download".into(),
        "extract".into(),
        "create_analyses".into(),
        "upload".into(),
        "sync".into(),
    ]
}
fn default_pubmed_batch_size() -> usize {
    200
}
fn default_neurostore_batch_size() -> usize {
    50
}
fn default_upload_behavior() -> UploadBehavior {
    UploadBehavior::Update
}
fn default_upload_metadata_mode() -> UploadMetadataMode {
    UploadMetadataMode::Fill
}

/// Fully resolved pipeline configuration. Every field has a default so a
/// bare `Settings::default()` is always runnable against the local
/// filesystem (though network-backed stages will skip unconfigured
/// providers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_root: PathBuf,
    pub cache_root: PathBuf,
    pub ns_pond_root: PathBuf,

    pub download_sources: Vec<String>,
    pub metadata_providers: Vec<String>,

    pub cache_only_mode: bool,
    pub force_redownload: bool,
    pub force_reextract: bool,
    pub ignore_cache_stages: Vec<String>,

    pub max_workers: usize,
    pub ace_max_workers: usize,
    pub n_llm_workers: usize,

    pub stages: Vec<String>,
    pub manifest_path: Option<PathBuf>,
    pub use_cached_inputs: bool,

    pub export: bool,
    pub export_overwrite: bool,
    pub sync_overwrite: bool,

    pub upload_behavior: UploadBehavior,
    pub upload_metadata_only: bool,
    pub upload_metadata_mode: UploadMetadataMode,
    pub upload_use_ssh: bool,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_port: Option<u16>,

    pub pubmed_email: Option<String>,
    pub pubmed_api_key: Option<String>,
    pub pubmed_batch_size: usize,
    pub pubmed_tool: Option<String>,

    pub semantic_scholar_api_key: Option<String>,
    pub openalex_email: Option<String>,

    pub elsevier_api_key: Option<String>,
    pub elsevier_http_proxy: Option<String>,
    pub elsevier_https_proxy: Option<String>,
    pub elsevier_use_proxy: bool,

    pub llm_api_key: Option<String>,
    pub llm_api_base: Option<String>,
    pub llm_model: Option<String>,

    pub neurostore_base_url: Option<String>,
    pub neurostore_token: Option<String>,
    pub neurostore_batch_size: usize,

    pub verbose: bool,
    pub dry_run: bool,
    pub log_to_file: bool,
    pub log_to_console: bool,
    pub log_file: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            cache_root: default_cache_root(),
            ns_pond_root: default_ns_pond_root(),
            download_sources: default_download_sources(),
            metadata_providers: default_metadata_providers(),
            cache_only_mode: false,
            force_redownload: false,
            force_reextract: false,
            ignore_cache_stages: Vec::new(),
            max_workers: default_max_workers(),
            ace_max_workers: default_ace_max_workers(),
            n_llm_workers: default_n_llm_workers(),
            stages: default_stages(),
            manifest_path: None,
            use_cached_inputs: true,
            export: false,
            export_overwrite: false,
            sync_overwrite: false,
            upload_behavior: default_upload_behavior(),
            upload_metadata_only: false,
            upload_metadata_mode: default_upload_metadata_mode(),
            upload_use_ssh: false,
            ssh_host: None,
            ssh_user: None,
            ssh_key_path: None,
            ssh_port: None,
            pubmed_email: None,
            pubmed_api_key: None,
            pubmed_batch_size: default_pubmed_batch_size(),
            pubmed_tool: None,
            semantic_scholar_api_key: None,
            openalex_email: None,
            elsevier_api_key: None,
            elsevier_http_proxy: None,
            elsevier_https_proxy: None,
            elsevier_use_proxy: false,
            llm_api_key: None,
            llm_api_base: None,
            llm_model: None,
            neurostore_base_url: None,
            neurostore_token: None,
            neurostore_batch_size: default_neurostore_batch_size(),
            verbose: false,
            dry_run: false,
            log_to_file: false,
            log_to_console: true,
            log_file: None,
            show_progress: true,
        }
    }
}

impl Settings {
    /// Load a YAML config file, layered on top of defaults; unknown fields
    /// are not an error, so older configs keep loading across versions.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| IngestError::io_with_path(e, path))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let defaults = Settings::default();
        let overrides: serde_yaml::Value = serde_yaml::from_str(contents)?;
        Ok(merge_yaml_onto(defaults, overrides)?)
    }

    /// Apply environment variables (`INGEST_<UPPER_SNAKE_FIELD>`), lower
    /// precedence than YAML and CLI, higher than built-in defaults.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("INGEST_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INGEST_CACHE_ROOT") {
            self.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INGEST_NS_POND_ROOT") {
            self.ns_pond_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INGEST_PUBMED_EMAIL") {
            self.pubmed_email = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_PUBMED_API_KEY") {
            self.pubmed_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_SEMANTIC_SCHOLAR_API_KEY") {
            self.semantic_scholar_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_ELSEVIER_API_KEY") {
            self.elsevier_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_LLM_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_LLM_API_BASE") {
            self.llm_api_base = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_LLM_MODEL") {
            self.llm_model = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_NEUROSTORE_BASE_URL") {
            self.neurostore_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("INGEST_NEUROSTORE_TOKEN") {
            self.neurostore_token = Some(v);
        }
        self
    }

    /// Create the configured root directories if they don't already exist.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.data_root, &self.cache_root, &self.ns_pond_root] {
            std::fs::create_dir_all(dir).map_err(|e| IngestError::io_with_path(e, dir))?;
        }
        Ok(())
    }

    pub fn get_cache_dir(&self, namespace: &str, source: &str) -> PathBuf {
        self.cache_root.join(namespace).join(source)
    }
}

/// Merge a partial YAML document onto a base `Settings` by round-tripping
/// through `serde_yaml::Value`, so a config file only needs to mention the
/// fields it overrides.
fn merge_yaml_onto(base: Settings, overrides: serde_yaml::Value) -> Result<Settings> {
    let mut base_value = serde_yaml::to_value(base)?;
    if let (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(override_map)) =
        (&mut base_value, overrides)
    {
        for (key, value) in override_map {
            base_map.insert(key, value);
        }
    }
    Ok(serde_yaml::from_value(base_value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let settings = Settings::default();
        assert_eq!(settings.download_sources, vec!["pubget", "elsevier", "ace"]);
        assert_eq!(settings.upload_behavior, UploadBehavior::Update);
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let yaml = "max_workers: 16\ncache_only_mode: true\n";
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.max_workers, 16);
        assert!(settings.cache_only_mode);
        // Untouched fields keep their defaults.
        assert_eq!(settings.ace_max_workers, default_ace_max_workers());
    }

    #[test]
    fn env_overrides_apply_on_top_of_yaml() {
        std::env::set_var("INGEST_PUBMED_EMAIL", "test@example.com");
        let settings = Settings::default().apply_env_overrides();
        assert_eq!(settings.pubmed_email.as_deref(), Some("test@example.com"));
        std::env::remove_var("INGEST_PUBMED_EMAIL");
    }
}
