//! Video metadata model for ViewTube plus the durable fallback snapshot.
//!
//! All structs in this module mirror how records are serialized to disk and
//! exposed to the API. The snapshot file is the last-known-good aggregate and
//! is only read when a live refresh and the in-memory cache are both
//! unavailable.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One aggregated video as served by `/api/videos` and persisted in the
/// fallback snapshot.
///
/// Records degrade rather than disappear: a video whose statistics lookup
/// failed still shows up with zero views and an empty description, and a
/// failed comment fetch leaves `comments` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    /// Embeddable player URL derived from the id.
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub view_count: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// A single top-level comment, newest first within a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    /// Upstream profile image when provided, otherwise a deterministic
    /// placeholder derived from the author name.
    pub author_avatar_url: String,
}

/// Returns the embed URL served alongside every record.
pub fn embed_url(video_id: &str) -> String {
    format!("https://www.youtube.com/embed/{video_id}")
}

/// Durable last-known-good store for the aggregated record set.
///
/// Written through after every successful aggregation and read back only when
/// neither a live fetch nor the in-memory cache can produce data.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted record set. A missing file is not an error; a
    /// file that exists but cannot be parsed is.
    pub fn load(&self) -> Result<Option<Vec<VideoRecord>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let records = serde_json::from_str(&raw)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(Some(records))
    }

    /// Replaces the snapshot atomically so readers never observe a torn file.
    pub fn save(&self, records: &[VideoRecord]) -> Result<()> {
        write_json_atomic(&self.path, &records)
    }

    /// Number of records currently persisted, if the snapshot is readable.
    /// Used by the health endpoint to report fallback availability.
    pub fn video_count(&self) -> Option<usize> {
        self.load().ok().flatten().map(|records| records.len())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_record(id: &str) -> VideoRecord {
        VideoRecord {
            id: id.into(),
            title: format!("Video {id}"),
            url: embed_url(id),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            view_count: 10,
            description: "desc".into(),
            comments: vec![Comment {
                author: "tester".into(),
                text: "hello world".into(),
                published_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                author_avatar_url: "https://example.test/avatar.png".into(),
            }],
        }
    }

    #[test]
    fn load_missing_snapshot_returns_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested/dir/snapshot.json"));
        store.save(&[sample_record("alpha")]).unwrap();

        let loaded = store.load().unwrap().expect("snapshot present");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "alpha");
        assert_eq!(store.video_count(), Some(1));
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        store
            .save(&[sample_record("alpha"), sample_record("beta")])
            .unwrap();
        store.save(&[sample_record("gamma")]).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "gamma");
    }

    #[test]
    fn load_corrupt_snapshot_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "not json").unwrap();
        let store = SnapshotStore::new(&path);
        assert!(store.load().is_err());
        assert_eq!(store.video_count(), None);
    }

    #[test]
    fn records_serialize_with_camel_case_keys() {
        let value = serde_json::to_value(sample_record("alpha")).unwrap();
        assert_eq!(value["viewCount"], 10);
        assert_eq!(value["url"], "https://www.youtube.com/embed/alpha");
        assert_eq!(
            value["comments"][0]["authorAvatarUrl"],
            "https://example.test/avatar.png"
        );
        assert!(
            value["publishedAt"]
                .as_str()
                .unwrap()
                .starts_with("2024-01-01")
        );
    }
}
