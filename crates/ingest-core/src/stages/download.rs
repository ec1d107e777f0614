//! Download stage: runs the source-fallback chain over a set of
//! identifiers, each backend internally bounded by its own worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use md5::Digest;

use crate::config::Settings;
use crate::error::Result;
use crate::identifier::Identifiers;
use crate::model::{DownloadResult, DownloadedFile, FileType};
use crate::source::{run_with_fallback, SourceBackend};

/// Compute the MD5 of a byte slice, used to stamp every downloaded file.
pub fn md5_hex(bytes: &[u8]) -> String {
    let digest = md5::Md5::digest(bytes);
    hex::encode(digest)
}

/// Determine the write destination for one downloaded article file and
/// persist the bytes, returning the `DownloadedFile` record.
pub fn write_download_artifact(
    data_root: &Path,
    slug: &str,
    source: &str,
    filename: &str,
    content_type: Option<String>,
    file_type: FileType,
    bytes: &[u8],
) -> Result<DownloadedFile> {
    let dir = data_root.join(slug).join("source").join(source);
    std::fs::create_dir_all(&dir).map_err(|e| crate::error::IngestError::io_with_path(e, &dir))?;
    let path = dir.join(filename);
    std::fs::write(&path, bytes).map_err(|e| crate::error::IngestError::io_with_path(e, &path))?;
    Ok(DownloadedFile {
        path,
        file_type,
        content_type,
        source: source.to_string(),
        downloaded_at: chrono::Utc::now(),
        md5: md5_hex(bytes),
    })
}

/// Default ordering applied when `settings.download_sources` does not
/// otherwise constrain the chain.
pub const DEFAULT_SOURCE_ORDER: &[&str] = &["pubget", "elsevier", "ace"];

/// Runs the configured download backends, in `settings.download_sources`
/// order, over a set of identifiers.
pub struct DownloadStage {
    backends: Vec<Arc<dyn SourceBackend<DownloadResult>>>,
    cache_root: PathBuf,
}

impl DownloadStage {
    pub fn new(backends: Vec<Arc<dyn SourceBackend<DownloadResult>>>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            backends,
            cache_root: cache_root.into(),
        }
    }

    pub async fn run(&self, settings: &Settings, identifiers: &Identifiers) -> Result<Vec<DownloadResult>> {
        let inputs: Vec<_> = identifiers.iter().cloned().collect();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        run_with_fallback(
            &self.backends,
            &self.cache_root,
            "download",
            &inputs,
            settings.cache_only_mode,
            |identifier| {
                DownloadResult::failure(
                    identifier.clone(),
                    "none",
                    "no configured download source accepted this identifier",
                )
            },
        )
        .await
    }

    /// Import a historical on-disk download tree that predates the cache,
    /// so previously-downloaded content is indexed without re-downloading.
    ///
    /// `discover` yields `(identifier_hint, files)` pairs for every article
    /// found under `source_directory`; the concrete walk (ACE's `*.html`
    /// named by PMID, Pubget's `article.xml`-bearing directories) is
    /// supplied by the caller since it is backend-specific.
    pub fn index_legacy_downloads(
        &self,
        source: &str,
        discovered: Vec<(crate::identifier::Identifier, Vec<DownloadedFile>)>,
    ) -> Result<usize> {
        let store = crate::cache::CacheStore::open(self.cache_root.join("download").join(source))?;
        let (existing_slugs, existing_pmids, existing_pmcids, existing_dois) = store.identifier_sets()?;

        let mut to_insert = Vec::new();
        for (identifier, files) in discovered {
            let slug = identifier.hash_identifiers();
            let is_duplicate = existing_slugs.contains(&slug)
                || identifier.pmid.as_ref().is_some_and(|v| existing_pmids.contains(v))
                || identifier.pmcid.as_ref().is_some_and(|v| existing_pmcids.contains(v))
                || identifier.doi.as_ref().is_some_and(|v| existing_dois.contains(v));
            if is_duplicate {
                continue;
            }
            let result = DownloadResult {
                identifier: identifier.clone(),
                source: source.to_string(),
                success: true,
                files,
                error_message: None,
            };
            let envelope = crate::cache::CacheEnvelope::new(slug, result);
            let aliases = crate::cache::IdentifierAliases::from_identifier(&identifier).with_source(source);
            to_insert.push((envelope, aliases));
        }

        let inserted = to_insert.len();
        if inserted > 0 {
            store.add_entries(&to_insert)?;
        }
        Ok(inserted)
    }
}

/// A monotonic timestamp-derived filename suffix, used by backends that
/// need deterministic-but-unique filenames for retried downloads.
pub fn timestamp_suffix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn write_download_artifact_persists_bytes_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_download_artifact(
            dir.path(),
            "slug-a",
            "pubget",
            "article.xml",
            Some("application/xml".into()),
            FileType::Xml,
            b"<xml/>",
        )
        .unwrap();
        assert!(file.path.exists());
        assert_eq!(file.md5, md5_hex(b"<xml/>"));
    }
}
