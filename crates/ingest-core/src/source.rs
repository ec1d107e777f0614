//! Source-fallback scheduler, reused by the download stage (over download
//! backends) and the gather stage (over identifier-lookup providers).
//!
//! Sources are consulted in configured priority order. Each source only
//! sees the inputs still unsatisfied by an earlier source; cached results
//! are re-surfaced without re-running a backend at all.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheEnvelope, CacheStore, IdentifierAliases};
use crate::error::Result;
use crate::identifier::Identifier;

/// One backend in a fallback chain. `T` is the per-input output type
/// (`DownloadResult` for the download stage, `Identifier` for identifier
/// lookup providers).
#[async_trait]
pub trait SourceBackend<T>: Send + Sync {
    /// Stable backend name, used as the cache sub-namespace.
    fn name(&self) -> &str;

    /// Whether this backend accepts the given identifier's populated
    /// primary id types.
    fn supports(&self, identifier: &Identifier) -> bool;

    /// Run this backend over `inputs`, returning one output per input, in
    /// the same order. Must never mutate the identifiers it's given and
    /// must return an output even on failure.
    async fn run(&self, inputs: &[Identifier]) -> Result<Vec<T>>;

    /// Whether `output` fully satisfies this input — no further source in
    /// the chain needs to run for it.
    fn is_satisfied(&self, output: &T) -> bool;

    /// Fold this source's output back into the identifier passed to the
    /// next source in the chain. Identifier-lookup providers (`T =
    /// Identifier`) override this to return `output` itself, so a later
    /// provider sees this one's enrichment; sources whose output is a
    /// separate artifact (e.g. download results) keep the default, which
    /// leaves the identifier untouched.
    fn fold(&self, identifier: &Identifier, _output: &T) -> Identifier {
        identifier.clone()
    }
}

/// Run `sources` in order over `inputs`, caching successes under
/// `cache_root/<namespace>/<source.name()>/` and filling any input left
/// unsatisfied by every source with `default_for`.
pub async fn run_with_fallback<T>(
    sources: &[Arc<dyn SourceBackend<T>>],
    cache_root: &Path,
    namespace: &str,
    inputs: &[Identifier],
    cache_only: bool,
    default_for: impl Fn(&Identifier) -> T,
) -> Result<Vec<T>>
where
    T: Clone + Serialize + DeserializeOwned,
{
    let mut results: Vec<Option<T>> = vec![None; inputs.len()];
    let mut satisfied = vec![false; inputs.len()];

    for source in sources {
        let supported_indices: Vec<usize> = (0..inputs.len())
            .filter(|&i| !satisfied[i] && source.supports(&inputs[i]))
            .collect();
        if supported_indices.is_empty() {
            continue;
        }

        let store = CacheStore::open(cache_root.join(namespace).join(source.name()))?;
        let slugs: Vec<String> = supported_indices
            .iter()
            .map(|&i| inputs[i].hash_identifiers())
            .collect();
        let (cached, missing_local) = store.partition::<T>(&slugs)?;

        for (local_idx, envelope) in cached {
            let global_idx = supported_indices[local_idx];
            satisfied[global_idx] = source.is_satisfied(&envelope.payload);
            results[global_idx] = Some(envelope.payload);
        }

        if cache_only || missing_local.is_empty() {
            continue;
        }

        let missing_inputs: Vec<Identifier> = missing_local
            .iter()
            .map(|&local_idx| {
                let global_idx = supported_indices[local_idx];
                match &results[global_idx] {
                    Some(previous) => source.fold(&inputs[global_idx], previous),
                    None => inputs[global_idx].clone(),
                }
            })
            .collect();
        let outputs = source.run(&missing_inputs).await?;

        let mut to_persist = Vec::with_capacity(outputs.len());
        for (local_idx, output) in missing_local.iter().zip(outputs.into_iter()) {
            let global_idx = supported_indices[*local_idx];
            let identifier = &inputs[global_idx];
            let envelope = CacheEnvelope::new(identifier.hash_identifiers(), output.clone());
            let aliases = IdentifierAliases::from_identifier(identifier).with_source(source.name());
            to_persist.push((envelope, aliases));
            satisfied[global_idx] = source.is_satisfied(&output);
            results[global_idx] = Some(output);
        }
        store.add_entries(&to_persist)?;
    }

    Ok(results
        .into_iter()
        .zip(inputs.iter())
        .map(|(result, identifier)| result.unwrap_or_else(|| default_for(identifier)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Probe {
        value: String,
        satisfied: bool,
    }

    struct AlwaysSatisfies {
        name: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceBackend<Probe> for AlwaysSatisfies {
        fn name(&self) -> &str {
            &self.name
        }
        fn supports(&self, _identifier: &Identifier) -> bool {
            true
        }
        async fn run(&self, inputs: &[Identifier]) -> Result<Vec<Probe>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(inputs
                .iter()
                .map(|id| Probe {
                    value: format!("{}:{}", self.name, id.hash_identifiers()),
                    satisfied: true,
                })
                .collect())
        }
        fn is_satisfied(&self, output: &Probe) -> bool {
            output.satisfied
        }
    }

    #[tokio::test]
    async fn second_source_never_runs_once_first_satisfies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(AlwaysSatisfies {
            name: "first".into(),
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(AlwaysSatisfies {
            name: "second".into(),
            calls: AtomicUsize::new(0),
        });
        let sources: Vec<Arc<dyn SourceBackend<Probe>>> = vec![first.clone(), second.clone()];
        let inputs = vec![Identifier::with_pmid("1"), Identifier::with_pmid("2")];

        let results = run_with_fallback(&sources, dir.path(), "test", &inputs, false, |_| Probe {
            value: "default".into(),
            satisfied: false,
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_run_reads_from_cache_without_reinvoking_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(AlwaysSatisfies {
            name: "only".into(),
            calls: AtomicUsize::new(0),
        });
        let sources: Vec<Arc<dyn SourceBackend<Probe>>> = vec![backend.clone()];
        let inputs = vec![Identifier::with_pmid("1")];

        run_with_fallback(&sources, dir.path(), "test", &inputs, false, |_| Probe {
            value: "default".into(),
            satisfied: false,
        })
        .await
        .unwrap();
        run_with_fallback(&sources, dir.path(), "test", &inputs, false, |_| Probe {
            value: "default".into(),
            satisfied: false,
        })
        .await
        .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
