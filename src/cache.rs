//! In-memory store for the last successfully aggregated record set.
//!
//! Single writer (the refresh coordinator), many readers (every endpoint).
//! The entry is swapped wholesale behind an `RwLock`, so a reader either sees
//! the previous complete set or the new complete set, never a mix.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::metadata::VideoRecord;

/// One full aggregate with the instant it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Vec<VideoRecord>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Stamps a freshly aggregated record set with the current time.
    pub fn new(records: Vec<VideoRecord>) -> Self {
        Self {
            records,
            fetched_at: Utc::now(),
        }
    }

    /// Whether this entry is still within the freshness window.
    pub fn is_fresh(&self, window: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(window) {
            Ok(window) => age <= window,
            // A window too large for chrono means effectively "never stale".
            Err(_) => true,
        }
    }
}

/// Holder for the most recent [`CacheEntry`]. Writes replace the entry
/// atomically; reads are lock-held only long enough to clone an `Arc`.
#[derive(Debug, Default)]
pub struct CacheStore {
    entry: RwLock<Option<Arc<CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the most recently written entry, or `None` if no aggregation
    /// has succeeded yet.
    pub fn read(&self) -> Option<Arc<CacheEntry>> {
        self.entry.read().clone()
    }

    /// Replaces the current entry. No partial merges happen here; all merge
    /// logic lives in the aggregator.
    pub fn write(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        *self.entry.write() = Some(entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::embed_url;

    fn sample_records(id: &str) -> Vec<VideoRecord> {
        vec![VideoRecord {
            id: id.into(),
            title: format!("Video {id}"),
            url: embed_url(id),
            published_at: Utc::now(),
            view_count: 1,
            description: String::new(),
            comments: Vec::new(),
        }]
    }

    #[test]
    fn read_before_any_write_is_empty() {
        let store = CacheStore::new();
        assert!(store.read().is_none());
    }

    #[test]
    fn write_replaces_the_entire_entry() {
        let store = CacheStore::new();
        store.write(CacheEntry::new(sample_records("alpha")));
        store.write(CacheEntry::new(sample_records("beta")));

        let entry = store.read().expect("entry present");
        assert_eq!(entry.records.len(), 1);
        assert_eq!(entry.records[0].id, "beta");
    }

    #[test]
    fn freshness_respects_the_window() {
        let fresh = CacheEntry::new(sample_records("alpha"));
        assert!(fresh.is_fresh(Duration::from_secs(600)));

        let stale = CacheEntry {
            fetched_at: Utc::now() - chrono::Duration::seconds(700),
            ..fresh
        };
        assert!(!stale.is_fresh(Duration::from_secs(600)));
        assert!(stale.is_fresh(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_window_means_always_stale() {
        let entry = CacheEntry {
            records: sample_records("alpha"),
            fetched_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(!entry.is_fresh(Duration::ZERO));
    }
}
