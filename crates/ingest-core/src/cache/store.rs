//! Slug-keyed SQLite cache index for one `(stage namespace, source)` pair.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::envelope::CacheEnvelope;
use super::lock::FileLock;
use crate::error::{IngestError, Result};
use crate::identifier::Identifier;

/// Identifier alias columns extracted from a payload at write time, used for
/// `get_by_identifier` recovery and (for downloads) `identifier_sets`.
#[derive(Debug, Clone, Default)]
pub struct IdentifierAliases {
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub source: Option<String>,
    pub base_study_id: Option<String>,
    pub study_id: Option<String>,
}

impl IdentifierAliases {
    pub fn from_identifier(identifier: &Identifier) -> Self {
        Self {
            pmid: identifier.pmid.clone(),
            doi: identifier.doi.clone(),
            pmcid: identifier.pmcid.clone(),
            source: None,
            base_study_id: None,
            study_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One namespace's cache: `cache_root/<namespace>/<source>/index.sqlite`
/// plus its sibling `index.lock`.
pub struct CacheStore {
    conn: Mutex<Connection>,
    lock_path: PathBuf,
}

const MAX_WRITE_BATCH: usize = 10_000;

impl CacheStore {
    /// Open (creating if necessary) the cache directory, its index, and
    /// apply the standard pragmas.
    pub fn open(namespace_dir: impl AsRef<Path>) -> Result<Self> {
        let namespace_dir = namespace_dir.as_ref();
        std::fs::create_dir_all(namespace_dir)
            .map_err(|e| IngestError::io_with_path(e, namespace_dir))?;
        let db_path = namespace_dir.join("index.sqlite");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_path: namespace_dir.join("index.lock"),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                slug TEXT PRIMARY KEY,
                payload_json BLOB NOT NULL,
                cached_at TEXT NOT NULL,
                metadata_json BLOB,
                pmid TEXT,
                pmcid TEXT,
                doi TEXT,
                source TEXT,
                base_study_id TEXT,
                study_id TEXT
            );
            CREATE INDEX IF NOT EXISTS entries_pmid_idx ON entries(pmid);
            CREATE INDEX IF NOT EXISTS entries_pmcid_idx ON entries(pmcid);
            CREATE INDEX IF NOT EXISTS entries_doi_idx ON entries(doi);
            CREATE INDEX IF NOT EXISTS entries_source_idx ON entries(source);
            CREATE INDEX IF NOT EXISTS entries_base_study_id_idx ON entries(base_study_id);
            CREATE INDEX IF NOT EXISTS entries_study_id_idx ON entries(study_id);",
        )?;
        Ok(())
    }

    /// Upsert a batch of envelopes. Serialized across processes by the
    /// sibling file lock; writes larger than [`MAX_WRITE_BATCH`] entries are
    /// split into multiple lock acquisitions to bound lock hold time.
    pub fn add_entries<T: Serialize>(
        &self,
        entries: &[(CacheEnvelope<T>, IdentifierAliases)],
    ) -> Result<()> {
        for chunk in entries.chunks(MAX_WRITE_BATCH) {
            let _guard = FileLock::acquire(&self.lock_path)?;
            let mut conn = self.conn.lock().expect("cache connection mutex poisoned");
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO entries
                        (slug, payload_json, cached_at, metadata_json, pmid, pmcid, doi, source, base_study_id, study_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(slug) DO UPDATE SET
                        payload_json = excluded.payload_json,
                        cached_at = excluded.cached_at,
                        metadata_json = excluded.metadata_json,
                        pmid = excluded.pmid,
                        pmcid = excluded.pmcid,
                        doi = excluded.doi,
                        source = excluded.source,
                        base_study_id = excluded.base_study_id,
                        study_id = excluded.study_id",
                )?;
                for (envelope, aliases) in chunk {
                    let payload_json = serde_json::to_vec(&envelope.payload)?;
                    let metadata_json = serde_json::to_vec(&envelope.metadata)?;
                    stmt.execute(params![
                        envelope.slug,
                        payload_json,
                        envelope.cached_at.to_rfc3339(),
                        metadata_json,
                        aliases.pmid,
                        aliases.pmcid,
                        aliases.doi,
                        aliases.source,
                        aliases.base_study_id,
                        aliases.study_id,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    fn decode_row<T: DeserializeOwned>(
        slug: String,
        payload_json: Vec<u8>,
        cached_at: String,
        metadata_json: Option<Vec<u8>>,
    ) -> Result<CacheEnvelope<T>> {
        let payload: T = serde_json::from_slice(&payload_json).map_err(|e| IngestError::CacheCorrupt {
            namespace: "entries".into(),
            slug: slug.clone(),
            message: e.to_string(),
        })?;
        let cached_at = chrono::DateTime::parse_from_rfc3339(&cached_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        let metadata = metadata_json
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Ok(CacheEnvelope {
            slug,
            payload,
            cached_at,
            metadata,
        })
    }

    /// Primary-key lookup by slug. A corrupt payload is logged and treated
    /// as a miss, never surfaced as an error.
    pub fn get<T: DeserializeOwned>(&self, slug: &str) -> Result<Option<CacheEnvelope<T>>> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let row = conn
            .query_row(
                "SELECT slug, payload_json, cached_at, metadata_json FROM entries WHERE slug = ?1",
                params![slug],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((slug, payload_json, cached_at, metadata_json)) => {
                match Self::decode_row(slug, payload_json, cached_at, metadata_json) {
                    Ok(envelope) => Ok(Some(envelope)),
                    Err(e) => {
                        tracing::warn!("corrupt cache entry treated as miss: {e}");
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Try the slug first, then each alias column in order `pmid`, `doi`,
    /// `pmcid`. Recovers legacy caches keyed under a different slug.
    pub fn get_by_identifier<T: DeserializeOwned>(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<CacheEnvelope<T>>> {
        if let Some(hit) = self.get(&identifier.hash_identifiers())? {
            return Ok(Some(hit));
        }
        let alias_columns: [(&str, &Option<String>); 3] = [
            ("pmid", &identifier.pmid),
            ("doi", &identifier.doi),
            ("pmcid", &identifier.pmcid),
        ];
        for (column, value) in alias_columns {
            let Some(value) = value else { continue };
            let conn = self.conn.lock().expect("cache connection mutex poisoned");
            let query = format!(
                "SELECT slug, payload_json, cached_at, metadata_json FROM entries WHERE {column} = ?1 LIMIT 1"
            );
            let row = conn
                .query_row(&query, params![value], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                    ))
                })
                .optional()?;
            drop(conn);
            if let Some((slug, payload_json, cached_at, metadata_json)) = row {
                if let Ok(envelope) = Self::decode_row(slug, payload_json, cached_at, metadata_json) {
                    return Ok(Some(envelope));
                }
            }
        }
        Ok(None)
    }

    pub fn has(&self, slug: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM entries WHERE slug = ?1", params![slug], |row| row.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn remove(&self, slug: &str) -> Result<bool> {
        let _guard = FileLock::acquire(&self.lock_path)?;
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let removed = conn.execute("DELETE FROM entries WHERE slug = ?1", params![slug])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn iter_entries<T: DeserializeOwned>(&self) -> Result<Vec<CacheEnvelope<T>>> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT slug, payload_json, cached_at, metadata_json FROM entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (slug, payload_json, cached_at, metadata_json) = row?;
            match Self::decode_row(slug, payload_json, cached_at, metadata_json) {
                Ok(envelope) => out.push(envelope),
                Err(e) => tracing::warn!("skipping corrupt cache entry: {e}"),
            }
        }
        Ok(out)
    }

    /// The four identifier sets currently present, used by bulk importers
    /// to skip duplicate insertions without decoding every payload.
    pub fn identifier_sets(&self) -> Result<(HashSet<String>, HashSet<String>, HashSet<String>, HashSet<String>)> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let mut stmt = conn.prepare("SELECT slug, pmid, pmcid, doi FROM entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let (mut slugs, mut pmids, mut pmcids, mut dois) = (
            HashSet::new(),
            HashSet::new(),
            HashSet::new(),
            HashSet::new(),
        );
        for row in rows {
            let (slug, pmid, pmcid, doi) = row?;
            slugs.insert(slug);
            if let Some(v) = pmid {
                pmids.insert(v);
            }
            if let Some(v) = pmcid {
                pmcids.insert(v);
            }
            if let Some(v) = doi {
                dois.insert(v);
            }
        }
        Ok((slugs, pmids, pmcids, dois))
    }

    /// Partition `slugs` into cached payloads (in input order) and missing
    /// slugs. The key idempotency primitive for every stage scheduler.
    pub fn partition<T: DeserializeOwned>(
        &self,
        slugs: &[String],
    ) -> Result<(Vec<(usize, CacheEnvelope<T>)>, Vec<usize>)> {
        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for (idx, slug) in slugs.iter().enumerate() {
            match self.get::<T>(slug)? {
                Some(envelope) => cached.push((idx, envelope)),
                None => missing.push(idx),
            }
        }
        Ok((cached, missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload {
        value: String,
    }

    #[test]
    fn roundtrip_get_and_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        let env = CacheEnvelope::new("slug-a", Payload { value: "x".into() });
        store
            .add_entries(&[(env.clone(), IdentifierAliases::default())])
            .unwrap();

        let fetched: CacheEnvelope<Payload> = store.get("slug-a").unwrap().unwrap();
        assert_eq!(fetched.payload, env.payload);

        let slugs = vec!["slug-a".to_string(), "slug-b".to_string()];
        let (cached, missing) = store.partition::<Payload>(&slugs).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].0, 0);
        assert_eq!(missing, vec![1]);
    }

    #[test]
    fn get_by_identifier_falls_back_to_alias_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let env = CacheEnvelope::new("legacy-slug", Payload { value: "y".into() });
        let aliases = IdentifierAliases {
            pmid: Some("999".into()),
            ..Default::default()
        };
        store.add_entries(&[(env, aliases)]).unwrap();

        let identifier = Identifier::with_pmid("999");
        let found: CacheEnvelope<Payload> = store.get_by_identifier(&identifier).unwrap().unwrap();
        assert_eq!(found.slug, "legacy-slug");
    }

    #[test]
    fn corrupt_payload_is_treated_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO entries (slug, payload_json, cached_at) VALUES ('bad', 'not json', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let result: Option<CacheEnvelope<Payload>> = store.get("bad").unwrap();
        assert!(result.is_none());
    }
}
