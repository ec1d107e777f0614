//! Generic cache envelope wrapping a stage's payload with caching metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic wrapper persisted by every stage's cache. Serialization of the
/// payload itself is delegated to `T`; the envelope only adds the slug,
/// timestamp, and an open metadata bag used for alias-column extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub slug: String,
    pub payload: T,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl<T> CacheEnvelope<T> {
    pub fn new(slug: impl Into<String>, payload: T) -> Self {
        Self {
            slug: slug.into(),
            payload,
            cached_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
