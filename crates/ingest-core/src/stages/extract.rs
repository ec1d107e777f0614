//! Extract stage: validates each download result against its source's
//! preconditions, dispatches the survivors to a matching extractor, and
//! enriches the results with bibliographic metadata.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheEnvelope, CacheStore};
use crate::config::Settings;
use crate::error::Result;
use crate::model::{ArticleExtractionBundle, ArticleMetadata, DownloadResult, DownloadedFile, ExtractedContent, FileType};

/// One source's extraction logic. Given the validated downloads for that
/// source, produces one `ExtractedContent` per input, in order.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn source(&self) -> &str;
    async fn extract(&self, downloads: &[DownloadResult]) -> Result<Vec<ExtractedContent>>;
}

/// A metadata provider consulted, in order, to enrich extracted content
/// with bibliographic data. Results are cached on disk per-provider.
#[async_trait::async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, slug: &str, content: &ExtractedContent) -> Result<Option<ArticleMetadata>>;
}

fn has_file(files: &[DownloadedFile], file_type: FileType) -> bool {
    files.iter().any(|f| f.file_type == file_type)
}

fn has_named(files: &[DownloadedFile], name_suffix: &str) -> bool {
    files
        .iter()
        .any(|f| f.path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(name_suffix)))
}

/// Check a download result against its source's preconditions before
/// dispatching it to an extractor.
fn is_extractable(result: &DownloadResult) -> std::result::Result<(), String> {
    if !result.success {
        return Err("download was not successful".into());
    }
    if result.files.is_empty() {
        return Err("no files on disk".into());
    }
    match result.source.as_str() {
        "ace" if !has_file(&result.files, FileType::Html) => Err("ACE download missing HTML".into()),
        "pubget" if !has_named(&result.files, "article.xml") || !has_named(&result.files, "tables.xml") => {
            Err("Pubget download missing article.xml or tables/tables.xml".into())
        }
        "elsevier" if !has_file(&result.files, FileType::Xml) || !has_named(&result.files, "metadata.json") => {
            Err("Elsevier download missing XML content or metadata.json".into())
        }
        _ => Ok(()),
    }
}

pub struct ExtractStage {
    extractors: Vec<Arc<dyn Extractor>>,
    metadata_providers: Vec<Arc<dyn MetadataProvider>>,
    cache_root: PathBuf,
}

impl ExtractStage {
    pub fn new(
        extractors: Vec<Arc<dyn Extractor>>,
        metadata_providers: Vec<Arc<dyn MetadataProvider>>,
        cache_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            extractors,
            metadata_providers,
            cache_root: cache_root.into(),
        }
    }

    pub async fn run(&self, settings: &Settings, downloads: &[DownloadResult]) -> Result<Vec<ArticleExtractionBundle>> {
        if downloads.is_empty() {
            return Ok(Vec::new());
        }

        // Validate every input up front; invalid entries get a placeholder
        // result without ever reaching an extractor.
        let mut contents: Vec<Option<ExtractedContent>> = vec![None; downloads.len()];
        let mut valid_by_source: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, result) in downloads.iter().enumerate() {
            match is_extractable(result) {
                Ok(()) => {
                    valid_by_source
                        .entry(result.source.clone())
                        .or_default()
                        .push(idx);
                }
                Err(reason) => {
                    contents[idx] = Some(ExtractedContent::failure(
                        result.identifier.hash_identifiers(),
                        result.source.clone(),
                        reason,
                    ));
                }
            }
        }

        for (source, indices) in valid_by_source {
            let Some(extractor) = self.extractors.iter().find(|e| e.source() == source) else {
                for idx in indices {
                    contents[idx] = Some(ExtractedContent::failure(
                        downloads[idx].identifier.hash_identifiers(),
                        source.clone(),
                        format!("no extractor configured for source {source}"),
                    ));
                }
                continue;
            };

            let cache = if settings.ignore_cache_stages.iter().any(|s| s == "extract") || settings.force_reextract {
                None
            } else {
                Some(CacheStore::open(self.cache_root.join("extract").join(&source))?)
            };

            let slugs: Vec<String> = indices.iter().map(|&i| downloads[i].identifier.hash_identifiers()).collect();
            let (cached, missing_local) = match &cache {
                Some(store) => store.partition::<ExtractedContent>(&slugs)?,
                None => (Vec::new(), (0..indices.len()).collect()),
            };

            for (local_idx, envelope) in cached {
                contents[indices[local_idx]] = Some(envelope.payload);
            }

            if !missing_local.is_empty() {
                let missing_downloads: Vec<DownloadResult> =
                    missing_local.iter().map(|&li| downloads[indices[li]].clone()).collect();
                let extracted = extractor.extract(&missing_downloads).await?;

                if let Some(store) = &cache {
                    let entries: Vec<_> = missing_local
                        .iter()
                        .zip(extracted.iter())
                        .map(|(&li, content)| {
                            let identifier = &downloads[indices[li]].identifier;
                            (
                                CacheEnvelope::new(identifier.hash_identifiers(), content.clone()),
                                crate::cache::IdentifierAliases::from_identifier(identifier).with_source(source.clone()),
                            )
                        })
                        .collect();
                    store.add_entries(&entries)?;
                }

                for (local_idx, content) in missing_local.into_iter().zip(extracted.into_iter()) {
                    contents[indices[local_idx]] = Some(content);
                }
            }
        }

        let resolved: Vec<ExtractedContent> = contents.into_iter().map(|c| c.expect("every index assigned")).collect();

        // Enrich with bibliographic metadata, one provider chain per article.
        let mut bundles = Vec::with_capacity(resolved.len());
        for content in resolved {
            let metadata = self.enrich_metadata(&content).await?;
            bundles.push(ArticleExtractionBundle { content, metadata });
        }
        Ok(bundles)
    }

    async fn enrich_metadata(&self, content: &ExtractedContent) -> Result<ArticleMetadata> {
        let mut metadata = ArticleMetadata::default();
        for provider in &self.metadata_providers {
            let cache_path = self
                .cache_root
                .join("metadata")
                .join(provider.name())
                .join(format!("{}.json", content.slug));
            let fetched = if cache_path.exists() {
                let bytes = std::fs::read(&cache_path).map_err(|e| crate::error::IngestError::io_with_path(e, &cache_path))?;
                serde_json::from_slice(&bytes).ok()
            } else {
                let fetched = provider.fetch(&content.slug, content).await?;
                if let Some(parent) = cache_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| crate::error::IngestError::io_with_path(e, parent))?;
                }
                if let Some(value) = &fetched {
                    let bytes = serde_json::to_vec(value)?;
                    std::fs::write(&cache_path, bytes).map_err(|e| crate::error::IngestError::io_with_path(e, &cache_path))?;
                }
                fetched
            };
            if let Some(fetched) = fetched {
                metadata.merge_from(&fetched);
            }
        }
        if metadata.source.is_none() {
            metadata.source = Some(content.source.clone());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;

    fn sample_download(source: &str, files: Vec<DownloadedFile>) -> DownloadResult {
        DownloadResult {
            identifier: Identifier::with_pmid("1"),
            source: source.into(),
            success: true,
            files,
            error_message: None,
        }
    }

    fn file(path: &str, file_type: FileType) -> DownloadedFile {
        DownloadedFile {
            path: PathBuf::from(path),
            file_type,
            content_type: None,
            source: "x".into(),
            downloaded_at: chrono::Utc::now(),
            md5: "abc".into(),
        }
    }

    #[test]
    fn ace_requires_html() {
        let result = sample_download("ace", vec![file("a.xml", FileType::Xml)]);
        assert!(is_extractable(&result).is_err());
        let result = sample_download("ace", vec![file("a.html", FileType::Html)]);
        assert!(is_extractable(&result).is_ok());
    }

    #[test]
    fn pubget_requires_article_and_tables_xml() {
        let result = sample_download("pubget", vec![file("article.xml", FileType::Xml)]);
        assert!(is_extractable(&result).is_err());
        let result = sample_download(
            "pubget",
            vec![file("article.xml", FileType::Xml), file("tables/tables.xml", FileType::Xml)],
        );
        assert!(is_extractable(&result).is_ok());
    }

    #[test]
    fn failed_download_is_never_extractable() {
        let mut result = sample_download("ace", vec![file("a.html", FileType::Html)]);
        result.success = false;
        assert!(is_extractable(&result).is_err());
    }
}
