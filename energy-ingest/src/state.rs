use std::collections::BTreeMap;
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::IngestError;
use crate::sinks::blob::BlobStore;

/// Blob under which per-meter bookmarks live.
pub const STATE_BLOB: &str = "state/last_interval.json";

/// Durable per-meter bookmark of the last ingested `interval_end`.
///
/// The map is keyed `"<id>:<serial>"` and mutated only by the orchestrator
/// after a meter's raw path fully succeeds. Commits are monotonic: a smaller
/// timestamp never overwrites a larger one.
pub struct StateStore<B> {
    store: Arc<B>,
}

impl<B: BlobStore> StateStore<B> {
    pub fn new(store: Arc<B>) -> Self {
        Self { store }
    }

    /// Loads every bookmark. A missing or unreadable state blob is treated
    /// as bootstrap for all meters (warning, not an error); individual
    /// unparseable entries are skipped the same way.
    pub async fn load(&self) -> BTreeMap<String, OffsetDateTime> {
        let raw = match self.store.get(STATE_BLOB).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "state blob unreadable, treating all meters as bootstrap");
                return BTreeMap::new();
            }
        };
        let entries: BTreeMap<String, String> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "state blob corrupt, treating all meters as bootstrap");
                return BTreeMap::new();
            }
        };
        let mut bookmarks = BTreeMap::new();
        for (key, value) in entries {
            match OffsetDateTime::parse(&value, &Rfc3339) {
                Ok(ts) => {
                    bookmarks.insert(key, ts.to_offset(UtcOffset::UTC));
                }
                Err(e) => {
                    tracing::warn!(key, value, error = %e, "unparseable bookmark, meter will bootstrap");
                }
            }
        }
        bookmarks
    }

    /// Read-modify-write commit of one meter's bookmark.
    pub async fn commit(&self, key: &str, interval_end: OffsetDateTime) -> Result<(), IngestError> {
        let mut entries: BTreeMap<String, String> = match self.store.get(STATE_BLOB).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "state blob corrupt at commit, rebuilding");
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => return Err(IngestError::State(e.to_string())),
        };

        let new_value = interval_end.to_offset(UtcOffset::UTC);
        if let Some(existing) = entries
            .get(key)
            .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
        {
            if existing >= new_value {
                tracing::debug!(key, "bookmark already at or past this interval, leaving as is");
                return Ok(());
            }
        }

        let formatted = new_value
            .format(&Rfc3339)
            .map_err(|e| IngestError::State(format!("unrepresentable bookmark: {e}")))?;
        entries.insert(key.to_string(), formatted);

        let body = serde_json::to_vec_pretty(&entries)
            .map_err(|e| IngestError::State(e.to_string()))?;
        self.store
            .put(STATE_BLOB, &body)
            .await
            .map_err(|e| IngestError::State(e.to_string()))
    }
}
