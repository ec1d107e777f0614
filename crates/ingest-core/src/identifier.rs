//! Article identifiers: normalization, slug derivation, and the ordered,
//! indexed collection used to drive every pipeline stage.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{IngestError, Result};

fn doi_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)https?://[^/\s]+/(10\.\d{4,9}/[^\s"'<>()]+)"#).expect("valid regex")
    })
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

fn normalize_pmid(pmid: Option<String>) -> Option<String> {
    let pmid = blank_to_none(pmid)?;
    let trimmed = pmid
        .trim()
        .trim_start_matches("https://pubmed.ncbi.nlm.nih.gov/")
        .trim_end_matches('/');
    blank_to_none(Some(trimmed.to_string()))
}

fn normalize_doi(doi: Option<String>) -> Option<String> {
    let doi = blank_to_none(doi)?;
    let doi = doi.trim();
    let extracted = if doi.to_lowercase().starts_with("http") {
        doi_url_re()
            .captures(doi)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| doi.to_string())
    } else {
        doi.trim_start_matches("doi:").trim_start_matches("DOI:").to_string()
    };
    blank_to_none(Some(extracted.trim().to_string()))
}

fn normalize_pmcid(pmcid: Option<String>) -> Option<String> {
    let pmcid = blank_to_none(pmcid)?;
    let trimmed = pmcid.trim();
    let normalized = if trimmed.to_uppercase().starts_with("PMC") {
        trimmed.to_string()
    } else {
        format!("PMC{trimmed}")
    };
    blank_to_none(Some(normalized))
}

/// An article identifier: the four primary keys plus an open bag of
/// secondary identifiers (e.g. `pii`, `arxiv`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifier {
    pub neurostore: Option<String>,
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    #[serde(default)]
    pub other_ids: HashMap<String, String>,
}

impl Identifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pmid(pmid: impl Into<String>) -> Self {
        let mut id = Self::new();
        id.set_pmid(Some(pmid.into()));
        id
    }

    pub fn with_doi(doi: impl Into<String>) -> Self {
        let mut id = Self::new();
        id.set_doi(Some(doi.into()));
        id
    }

    pub fn set_pmid(&mut self, value: Option<String>) {
        self.pmid = normalize_pmid(value);
    }

    pub fn set_doi(&mut self, value: Option<String>) {
        self.doi = normalize_doi(value);
    }

    pub fn set_pmcid(&mut self, value: Option<String>) {
        self.pmcid = normalize_pmcid(value);
    }

    pub fn set_neurostore(&mut self, value: Option<String>) {
        self.neurostore = blank_to_none(value);
    }

    /// Re-run normalization on every primary field. Idempotent; called
    /// after every mutation so the slug never drifts out from under callers.
    pub fn normalize(&mut self) {
        self.pmid = normalize_pmid(self.pmid.take());
        self.doi = normalize_doi(self.doi.take());
        self.pmcid = normalize_pmcid(self.pmcid.take());
        self.neurostore = blank_to_none(self.neurostore.take());
    }

    /// Fill any currently-absent primary field from `other`, without
    /// overwriting a field this identifier already has populated.
    pub fn fill_from(&mut self, other: &Identifier) {
        if self.pmid.is_none() {
            self.pmid = other.pmid.clone();
        }
        if self.doi.is_none() {
            self.doi = other.doi.clone();
        }
        if self.pmcid.is_none() {
            self.pmcid = other.pmcid.clone();
        }
        if self.neurostore.is_none() {
            self.neurostore = other.neurostore.clone();
        }
        for (k, v) in &other.other_ids {
            self.other_ids.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn has_all_primary_ids(&self) -> bool {
        self.pmid.is_some() && self.doi.is_some() && self.pmcid.is_some()
    }

    /// The cache-key / filesystem-safe slug: `"{pmid}|{doi}|{pmcid}"` with
    /// every `/` replaced by `_`. Two identifiers with the same primary
    /// triple share a slug even if their `other_ids` differ.
    pub fn hash_identifiers(&self) -> String {
        let raw = format!(
            "{}|{}|{}",
            self.pmid.as_deref().unwrap_or(""),
            self.doi.as_deref().unwrap_or(""),
            self.pmcid.as_deref().unwrap_or(""),
        );
        raw.replace('/', "_")
    }

    /// Alias for [`Identifier::hash_identifiers`], matching the common
    /// vocabulary used by cache and sync code.
    pub fn slug(&self) -> String {
        self.hash_identifiers()
    }

    fn primary_triple(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (self.pmid.as_deref(), self.doi.as_deref(), self.pmcid.as_deref())
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.primary_triple() == other.primary_triple()
    }
}
impl Eq for Identifier {}

/// An ordered collection of [`Identifier`]s with O(1) lookup by any primary
/// key. Insertion and removal keep the secondary indices in sync.
#[derive(Debug, Clone, Default)]
pub struct Identifiers {
    items: Vec<Identifier>,
    indexed_keys: Vec<IndexKey>,
    indices: HashMap<IndexKey, HashMap<String, usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Pmid,
    Doi,
    Pmcid,
    Neurostore,
}

impl Identifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build secondary indices on the given keys. Safe to call repeatedly;
    /// rebuilds from the current contents each time.
    pub fn set_index(&mut self, keys: &[IndexKey]) {
        self.indexed_keys = keys.to_vec();
        self.rebuild_indices();
    }

    fn rebuild_indices(&mut self) {
        self.indices.clear();
        for key in &self.indexed_keys {
            self.indices.insert(*key, HashMap::new());
        }
        for (idx, id) in self.items.iter().enumerate() {
            for key in &self.indexed_keys {
                if let Some(value) = Self::field(id, *key) {
                    self.indices.get_mut(key).unwrap().entry(value).or_insert(idx);
                }
            }
        }
    }

    fn field(id: &Identifier, key: IndexKey) -> Option<String> {
        match key {
            IndexKey::Pmid => id.pmid.clone(),
            IndexKey::Doi => id.doi.clone(),
            IndexKey::Pmcid => id.pmcid.clone(),
            IndexKey::Neurostore => id.neurostore.clone(),
        }
    }

    pub fn push(&mut self, mut identifier: Identifier) {
        identifier.normalize();
        let idx = self.items.len();
        for key in self.indexed_keys.clone() {
            if let Some(value) = Self::field(&identifier, key) {
                self.indices.entry(key).or_default().entry(value).or_insert(idx);
            }
        }
        self.items.push(identifier);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identifier> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Identifier> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[Identifier] {
        &self.items
    }

    /// Look up an identifier by one of the indexed keys. Returns the first
    /// identifier whose corresponding field equals `value`.
    pub fn lookup(&self, key: IndexKey, value: &str) -> Option<&Identifier> {
        self.indices.get(&key)?.get(value).map(|&idx| &self.items[idx])
    }

    /// Collapse duplicates by slug, preserving the first occurrence and its
    /// position. Rebuilds indices afterwards.
    pub fn deduplicate(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.items.retain(|id| seen.insert(id.hash_identifiers()));
        self.rebuild_indices();
    }

    /// Append one Identifier per line as JSON (JSONL).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::io_with_path(e, parent))?;
        }
        let mut file = std::fs::File::create(path).map_err(|e| IngestError::io_with_path(e, path))?;
        for id in &self.items {
            let line = serde_json::to_string(id)?;
            writeln!(file, "{line}").map_err(|e| IngestError::io_with_path(e, path))?;
        }
        Ok(())
    }

    /// Load a JSONL manifest, one Identifier per line. Blank lines are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| IngestError::io_with_path(e, path))?;
        let reader = BufReader::new(file);
        let mut collection = Self::new();
        for line in reader.lines() {
            let line = line.map_err(|e| IngestError::io_with_path(e, path))?;
            if line.trim().is_empty() {
                continue;
            }
            let id: Identifier = serde_json::from_str(&line)?;
            collection.push(id);
        }
        Ok(collection)
    }
}

/// Pairing of a seed identifier with every identifier resolved about it so
/// far and which providers contributed. Cache payload for the gather
/// namespace's identifier-lookup cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierExpansion {
    pub seed_identifier: Identifier,
    pub resolved: Identifier,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl IdentifierExpansion {
    pub fn new(seed: Identifier) -> Self {
        Self {
            resolved: seed.clone(),
            seed_identifier: seed,
            sources: Vec::new(),
        }
    }

    /// Merge a provider's response into `resolved`, filling only absent
    /// fields, and record the provider as having contributed.
    pub fn apply_provider_result(&mut self, provider: &str, result: &Identifier) {
        self.resolved.fill_from(result);
        if !self.sources.iter().any(|s| s == provider) {
            self.sources.push(provider.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmid_strips_pubmed_url() {
        let mut id = Identifier::new();
        id.set_pmid(Some("https://pubmed.ncbi.nlm.nih.gov/12345/".into()));
        assert_eq!(id.pmid.as_deref(), Some("12345"));
    }

    #[test]
    fn doi_extracted_from_url() {
        let mut id = Identifier::new();
        id.set_doi(Some("https://doi.org/10.1234/abcd.5678".into()));
        assert_eq!(id.doi.as_deref(), Some("10.1234/abcd.5678"));
    }

    #[test]
    fn doi_strips_prefix() {
        let mut id = Identifier::new();
        id.set_doi(Some("doi:10.1234/xyz".into()));
        assert_eq!(id.doi.as_deref(), Some("10.1234/xyz"));
    }

    #[test]
    fn pmcid_gets_prefixed() {
        let mut id = Identifier::new();
        id.set_pmcid(Some("1234567".into()));
        assert_eq!(id.pmcid.as_deref(), Some("PMC1234567"));
    }

    #[test]
    fn blank_values_become_absent() {
        let mut id = Identifier::new();
        id.set_pmid(Some("   ".into()));
        assert!(id.pmid.is_none());
    }

    #[test]
    fn slug_replaces_slashes() {
        let mut id = Identifier::new();
        id.set_doi(Some("10.1234/abc/def".into()));
        assert_eq!(id.hash_identifiers(), "|10.1234_abc_def|");
    }

    #[test]
    fn slug_shared_across_equal_primary_triples_despite_other_ids() {
        let mut a = Identifier::with_pmid("1");
        let mut b = Identifier::with_pmid("1");
        a.other_ids.insert("pii".into(), "x".into());
        assert_eq!(a.hash_identifiers(), b.hash_identifiers());
        b.other_ids.insert("arxiv".into(), "y".into());
        assert_eq!(a, b);
    }

    #[test]
    fn deduplicate_keeps_first_occurrence() {
        let mut ids = Identifiers::new();
        ids.set_index(&[IndexKey::Pmid]);
        ids.push(Identifier::with_pmid("1"));
        ids.push(Identifier::with_pmid("1"));
        ids.push(Identifier::with_pmid("2"));
        ids.deduplicate();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn lookup_by_indexed_key() {
        let mut ids = Identifiers::new();
        ids.set_index(&[IndexKey::Pmid, IndexKey::Doi]);
        ids.push(Identifier::with_pmid("42"));
        let found = ids.lookup(IndexKey::Pmid, "42");
        assert!(found.is_some());
        assert!(ids.lookup(IndexKey::Doi, "nope").is_none());
    }

    #[test]
    fn expansion_fills_without_overwriting() {
        let mut expansion = IdentifierExpansion::new(Identifier::with_pmid("1"));
        expansion.apply_provider_result("pubmed", &Identifier::with_doi("10.1/x"));
        assert_eq!(expansion.resolved.pmid.as_deref(), Some("1"));
        assert_eq!(expansion.resolved.doi.as_deref(), Some("10.1/x"));
        assert_eq!(expansion.sources, vec!["pubmed".to_string()]);

        // A second provider cannot clobber the already-populated doi.
        expansion.apply_provider_result("crossref", &Identifier::with_doi("10.9/other"));
        assert_eq!(expansion.resolved.doi.as_deref(), Some("10.1/x"));
        assert_eq!(expansion.sources, vec!["pubmed".to_string(), "crossref".to_string()]);
    }

    #[test]
    fn jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let mut ids = Identifiers::new();
        ids.push(Identifier::with_pmid("1"));
        ids.push(Identifier::with_doi("10.1/x"));
        ids.save(&path).unwrap();

        let loaded = Identifiers::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.as_slice()[0].pmid.as_deref(), Some("1"));
    }
}
