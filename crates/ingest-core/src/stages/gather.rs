//! Gather stage: identifier enrichment from seed manifests and search
//! queries, run through the identifier-lookup fallback chain.

use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheEnvelope, CacheStore};
use crate::config::Settings;
use crate::error::Result;
use crate::identifier::{IdentifierExpansion, Identifiers, IndexKey};
use crate::model::SearchQuery;
use crate::source::{run_with_fallback, SourceBackend};

/// A bibliographic search backend that resolves a query into PMIDs,
/// paging and falling back to per-year slices when a query's result count
/// exceeds the per-query cap.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// Per-query result cap before a per-year fallback kicks in.
    const RESULT_CAP: usize = 10_000;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<String>>;
}

/// Drives identifier-lookup providers over a working set of identifiers.
/// Each provider is a [`SourceBackend<Identifier>`] whose `run` enriches
/// in-place; "satisfied" here means all three primary ids are populated.
pub struct GatherStage {
    providers: Vec<Arc<dyn SourceBackend<crate::identifier::Identifier>>>,
    cache_root: std::path::PathBuf,
}

impl GatherStage {
    pub fn new(
        providers: Vec<Arc<dyn SourceBackend<crate::identifier::Identifier>>>,
        cache_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            providers,
            cache_root: cache_root.into(),
        }
    }

    /// Load seed identifiers from `manifest_path` (if given), run them
    /// through the configured providers, deduplicate, and write the
    /// resulting manifest to `data_root/manifests/<label>.jsonl`.
    pub async fn run(
        &self,
        settings: &Settings,
        seeds: Identifiers,
        label: &str,
    ) -> Result<Identifiers> {
        let inputs: Vec<_> = seeds.iter().cloned().collect();
        if inputs.is_empty() {
            return Ok(Identifiers::new());
        }

        let enriched = run_with_fallback(
            &self.providers,
            &self.cache_root,
            "gather",
            &inputs,
            settings.cache_only_mode,
            |identifier| identifier.clone(),
        )
        .await?;

        // Persist an IdentifierExpansion per seed so downstream runs can
        // recover which providers contributed without rerunning lookups.
        for (seed, resolved) in inputs.iter().zip(enriched.iter()) {
            let expansion = IdentifierExpansion {
                seed_identifier: seed.clone(),
                resolved: resolved.clone(),
                sources: self
                    .providers
                    .iter()
                    .filter(|p| p.supports(seed))
                    .map(|p| p.name().to_string())
                    .collect(),
            };
            let store = CacheStore::open(self.cache_root.join("gather").join("_expansions"))?;
            store.add_entries(&[(
                CacheEnvelope::new(seed.hash_identifiers(), expansion),
                Default::default(),
            )])?;
        }

        let mut collection = Identifiers::new();
        collection.set_index(&[IndexKey::Pmid, IndexKey::Doi, IndexKey::Pmcid, IndexKey::Neurostore]);
        for identifier in enriched {
            collection.push(identifier);
        }
        collection.deduplicate();

        let manifest_dir = settings.data_root.join("manifests");
        collection.save(&manifest_dir.join(format!("{label}.jsonl")))?;
        Ok(collection)
    }

    /// Load a manifest file written by a previous gather run (or supplied
    /// directly via `manifest_path`).
    pub fn load_manifest(path: &Path) -> Result<Identifiers> {
        Identifiers::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;

    struct FakePubmedProvider;

    #[async_trait::async_trait]
    impl SourceBackend<Identifier> for FakePubmedProvider {
        fn name(&self) -> &str {
            "pubmed"
        }
        fn supports(&self, identifier: &Identifier) -> bool {
            identifier.pmid.is_some()
        }
        async fn run(&self, inputs: &[Identifier]) -> Result<Vec<Identifier>> {
            Ok(inputs
                .iter()
                .map(|id| {
                    let mut enriched = id.clone();
                    enriched.set_doi(Some(format!("10.1/{}", id.pmid.as_deref().unwrap_or("x"))));
                    enriched
                })
                .collect())
        }
        fn is_satisfied(&self, output: &Identifier) -> bool {
            output.has_all_primary_ids()
        }
        fn fold(&self, _identifier: &Identifier, output: &Identifier) -> Identifier {
            output.clone()
        }
    }

    /// Supports any pmid-seeded identifier, same as pubmed, but its pmcid
    /// lookup depends on a DOI it expects an earlier provider to have
    /// resolved — it never requests one itself.
    struct FakeCrossrefProvider;

    #[async_trait::async_trait]
    impl SourceBackend<Identifier> for FakeCrossrefProvider {
        fn name(&self) -> &str {
            "crossref"
        }
        fn supports(&self, identifier: &Identifier) -> bool {
            identifier.pmid.is_some()
        }
        async fn run(&self, inputs: &[Identifier]) -> Result<Vec<Identifier>> {
            Ok(inputs
                .iter()
                .map(|id| {
                    let mut enriched = id.clone();
                    enriched.set_pmcid(Some(format!("PMC{}", id.doi.as_deref().unwrap_or("UNKNOWN"))));
                    enriched
                })
                .collect())
        }
        fn is_satisfied(&self, output: &Identifier) -> bool {
            output.has_all_primary_ids()
        }
        fn fold(&self, _identifier: &Identifier, output: &Identifier) -> Identifier {
            output.clone()
        }
    }

    #[tokio::test]
    async fn run_fills_doi_from_provider_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_root: dir.path().join("data"),
            ..Settings::default()
        };
        let stage = GatherStage::new(vec![Arc::new(FakePubmedProvider)], dir.path().join("cache"));

        let mut seeds = Identifiers::new();
        seeds.push(Identifier::with_pmid("42"));

        let result = stage.run(&settings, seeds, "run-1").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.as_slice()[0].doi.as_deref(), Some("10.1/42"));
        assert!(dir.path().join("data/manifests/run-1.jsonl").exists());
    }

    /// Crossref runs after pubmed in the chain and needs the DOI pubmed
    /// just resolved to build a pmcid — it must see that enrichment rather
    /// than the pristine seed, or it falls back to its "unknown doi" path.
    #[tokio::test]
    async fn later_provider_sees_earlier_providers_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_root: dir.path().join("data"),
            ..Settings::default()
        };
        let stage = GatherStage::new(
            vec![Arc::new(FakePubmedProvider), Arc::new(FakeCrossrefProvider)],
            dir.path().join("cache"),
        );

        let mut seeds = Identifiers::new();
        seeds.push(Identifier::with_pmid("42"));

        let result = stage.run(&settings, seeds, "run-1").await.unwrap();
        assert_eq!(result.len(), 1);
        let resolved = &result.as_slice()[0];
        assert_eq!(resolved.doi.as_deref(), Some("10.1/42"));
        assert_eq!(resolved.pmcid.as_deref(), Some("PMC10.1/42"));
    }
}
