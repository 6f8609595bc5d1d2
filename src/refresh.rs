//! Refresh coordinator: decides whether a trigger is served from cache or
//! starts a live aggregation, and guarantees at most one upstream aggregation
//! is in flight at any instant.
//!
//! Every trigger (HTTP read, webhook, periodic timer) funnels through
//! [`RefreshCoordinator::get_or_refresh`]. Callers that arrive while an
//! attempt is running join it through a `watch` channel and receive that
//! attempt's outcome; `watch` is level-triggered, so a late subscriber still
//! observes the published value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use crate::aggregate;
use crate::cache::{CacheEntry, CacheStore};
use crate::metadata::{SnapshotStore, VideoRecord};
use crate::youtube::{UploadsApi, UpstreamError};

/// Where the records in a [`ServeOutcome`] came from. Endpoints use this to
/// mark responses as cached or fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Live,
    Cached,
    Fallback,
}

/// The record set handed back to a trigger, plus enough provenance to build
/// the response envelope.
#[derive(Debug, Clone)]
pub struct ServeOutcome {
    pub records: Vec<VideoRecord>,
    pub source: DataSource,
    /// When the records were aggregated; `None` for a fallback snapshot,
    /// whose fetch time was lost with the process that wrote it.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ServeOutcome {
    fn cached(entry: &CacheEntry) -> Self {
        Self {
            records: entry.records.clone(),
            source: DataSource::Cached,
            fetched_at: Some(entry.fetched_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no live, cached, or fallback data available")]
    NoDataAvailable,
}

type AttemptResult = Result<ServeOutcome, RefreshError>;

/// Arbitrates all refresh triggers over one shared cache and snapshot.
///
/// Cheap to clone; clones share the same state.
pub struct RefreshCoordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for RefreshCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    api: S,
    cache: CacheStore,
    snapshot: SnapshotStore,
    freshness: Duration,
    /// `Some` while an aggregation attempt is in flight; the receiver is the
    /// join handle late arrivals subscribe to. Reset to `None` when the
    /// attempt completes, success or failure.
    in_flight: Mutex<Option<watch::Receiver<Option<AttemptResult>>>>,
}

impl<S: UploadsApi + 'static> RefreshCoordinator<S> {
    pub fn new(api: S, cache: CacheStore, snapshot: SnapshotStore, freshness: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                snapshot,
                freshness,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Returns current data, refreshing from upstream when warranted.
    ///
    /// * Idle, cache fresh, not forced: cached records, no upstream call.
    /// * Idle otherwise: exactly one aggregation attempt runs; on success the
    ///   cache and fallback snapshot are written, on failure the best
    ///   available prior data is served instead.
    /// * An attempt already in flight: join it, forced or not, and take its
    ///   outcome. Forcing only affects whether a new attempt starts while
    ///   idle.
    pub async fn get_or_refresh(&self, force: bool) -> AttemptResult {
        let mut rx = {
            let mut guard = self.inner.in_flight.lock().await;
            if let Some(rx) = guard.as_ref() {
                rx.clone()
            } else {
                if !force
                    && let Some(entry) = self.inner.cache.read()
                    && entry.is_fresh(self.inner.freshness)
                {
                    return Ok(ServeOutcome::cached(&entry));
                }

                let (tx, rx) = watch::channel(None);
                *guard = Some(rx.clone());
                let inner = Arc::clone(&self.inner);
                // Detached so a caller that disconnects cannot cancel work
                // other callers are waiting on; the attempt always runs to
                // completion.
                tokio::spawn(async move {
                    let outcome = run_attempt(&inner).await;
                    let _ = tx.send(Some(outcome));
                    inner.in_flight.lock().await.take();
                });
                rx
            }
        };

        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                tracing::error!("refresh attempt ended without publishing a result");
                return serve_best_available(&self.inner);
            }
        }
    }
}

/// One full aggregation attempt: fetch, join, publish, persist.
async fn run_attempt<S: UploadsApi>(inner: &Inner<S>) -> AttemptResult {
    match aggregate_live(inner).await {
        Ok(records) => {
            let entry = inner.cache.write(CacheEntry::new(records.clone()));
            // Write-through to the fallback snapshot, best effort: losing the
            // snapshot must not fail the aggregation it followed.
            if let Err(err) = inner.snapshot.save(&entry.records) {
                tracing::warn!(error = %err, "failed to persist fallback snapshot");
            }
            Ok(ServeOutcome {
                records,
                source: DataSource::Live,
                fetched_at: Some(entry.fetched_at),
            })
        }
        Err(err) => {
            tracing::warn!(error = %err, "live aggregation failed, serving best available data");
            serve_best_available(inner)
        }
    }
}

/// Cache first, then the durable snapshot, then nothing.
fn serve_best_available<S>(inner: &Inner<S>) -> AttemptResult {
    if let Some(entry) = inner.cache.read() {
        return Ok(ServeOutcome::cached(&entry));
    }
    match inner.snapshot.load() {
        Ok(Some(records)) => Ok(ServeOutcome {
            records,
            source: DataSource::Fallback,
            fetched_at: None,
        }),
        Ok(None) => Err(RefreshError::NoDataAvailable),
        Err(err) => {
            tracing::warn!(error = %err, "fallback snapshot unreadable");
            Err(RefreshError::NoDataAvailable)
        }
    }
}

async fn aggregate_live<S: UploadsApi>(inner: &Inner<S>) -> Result<Vec<VideoRecord>, UpstreamError> {
    let items = inner.api.list_playlist_items().await?;
    if items.is_empty() {
        // An empty listing for a live channel is a bad response; do not
        // publish an empty feed over previously good data.
        return Err(UpstreamError::Malformed(
            "playlist listing returned no items".into(),
        ));
    }

    let ids: Vec<String> = items.iter().map(|item| item.video_id.clone()).collect();
    let stats = inner.api.fetch_statistics(&ids).await?;

    let mut comments_by_id = HashMap::new();
    for item in &items {
        match inner.api.fetch_comments(&item.video_id).await {
            Ok(threads) => {
                comments_by_id.insert(item.video_id.clone(), threads.comments);
            }
            Err(err) => {
                // Non-fatal: the record is published with no comments.
                tracing::debug!(
                    video_id = %item.video_id,
                    error = %err,
                    "comment fetch failed, serving record without comments"
                );
            }
        }
    }

    Ok(aggregate::aggregate(items, &stats, &comments_by_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Comment;
    use crate::youtube::{CommentThreads, PlaylistItem, VideoStats};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct ScriptedApi {
        items: Vec<PlaylistItem>,
        stats: HashMap<String, VideoStats>,
        comments: HashMap<String, Vec<Comment>>,
        fail_listing: bool,
        fail_comments_for: Option<String>,
        playlist_calls: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
    }

    impl UploadsApi for ScriptedApi {
        async fn list_playlist_items(&self) -> Result<Vec<PlaylistItem>, UpstreamError> {
            self.playlist_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            if self.fail_listing {
                return Err(UpstreamError::Transient("scripted failure".into()));
            }
            Ok(self.items.clone())
        }

        async fn fetch_statistics(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, VideoStats>, UpstreamError> {
            Ok(self
                .stats
                .iter()
                .filter(|(id, _)| ids.contains(id))
                .map(|(id, stats)| (id.clone(), stats.clone()))
                .collect())
        }

        async fn fetch_comments(&self, video_id: &str) -> Result<CommentThreads, UpstreamError> {
            if self.fail_comments_for.as_deref() == Some(video_id) {
                return Err(UpstreamError::NotFound);
            }
            let comments = self.comments.get(video_id).cloned().unwrap_or_default();
            Ok(CommentThreads {
                total_results: comments.len() as u64,
                comments,
            })
        }
    }

    fn item(id: &str) -> PlaylistItem {
        PlaylistItem {
            video_id: id.into(),
            title: format!("Video {id}"),
            published_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    fn comment(text: &str) -> Comment {
        Comment {
            author: "tester".into(),
            text: text.into(),
            published_at: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            author_avatar_url: "https://example.test/a.png".into(),
        }
    }

    fn two_item_api() -> ScriptedApi {
        let mut stats = HashMap::new();
        stats.insert(
            "a".to_string(),
            VideoStats {
                views: 150,
                description: "first".into(),
            },
        );
        let mut comments = HashMap::new();
        comments.insert("a".to_string(), vec![comment("nice")]);
        ScriptedApi {
            items: vec![item("a"), item("b")],
            stats,
            comments,
            ..ScriptedApi::default()
        }
    }

    struct TestCoordinator {
        coordinator: RefreshCoordinator<ScriptedApi>,
        playlist_calls: Arc<AtomicUsize>,
        snapshot: SnapshotStore,
        _temp: tempfile::TempDir,
    }

    fn build(api: ScriptedApi, freshness: Duration) -> TestCoordinator {
        build_with_cache(api, freshness, CacheStore::new())
    }

    fn build_with_cache(
        mut api: ScriptedApi,
        freshness: Duration,
        cache: CacheStore,
    ) -> TestCoordinator {
        let temp = tempdir().unwrap();
        let snapshot = SnapshotStore::new(temp.path().join("snapshot.json"));
        let playlist_calls = Arc::new(AtomicUsize::new(0));
        api.playlist_calls = playlist_calls.clone();
        TestCoordinator {
            coordinator: RefreshCoordinator::new(api, cache, snapshot.clone(), freshness),
            playlist_calls,
            snapshot,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn second_call_within_freshness_window_uses_cache() {
        let ctx = build(two_item_api(), Duration::from_secs(600));

        let first = ctx.coordinator.get_or_refresh(false).await.unwrap();
        assert_eq!(first.source, DataSource::Live);

        let second = ctx.coordinator.get_or_refresh(false).await.unwrap();
        assert_eq!(second.source, DataSource::Cached);
        assert_eq!(second.records, first.records);
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_triggers_a_new_fetch() {
        let ctx = build(two_item_api(), Duration::ZERO);

        ctx.coordinator.get_or_refresh(false).await.unwrap();
        let second = ctx.coordinator.get_or_refresh(false).await.unwrap();

        assert_eq!(second.source, DataSource::Live);
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_refresh_bypasses_a_fresh_cache() {
        let ctx = build(two_item_api(), Duration::from_secs(600));

        ctx.coordinator.get_or_refresh(false).await.unwrap();
        let forced = ctx.coordinator.get_or_refresh(true).await.unwrap();

        assert_eq!(forced.source, DataSource::Live);
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let gate = Arc::new(Semaphore::new(0));
        let api = ScriptedApi {
            gate: Some(gate.clone()),
            ..two_item_api()
        };
        let ctx = build(api, Duration::from_secs(600));

        // Leader starts and parks inside the upstream call.
        let leader = tokio::spawn({
            let coordinator = ctx.coordinator.clone();
            async move { coordinator.get_or_refresh(true).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 1);

        // A plain read and a forced webhook-style refresh arrive mid-flight.
        let reader = tokio::spawn({
            let coordinator = ctx.coordinator.clone();
            async move { coordinator.get_or_refresh(false).await }
        });
        let forced = tokio::spawn({
            let coordinator = ctx.coordinator.clone();
            async move { coordinator.get_or_refresh(true).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(1);

        let leader = leader.await.unwrap().unwrap();
        let reader = reader.await.unwrap().unwrap();
        let forced = forced.await.unwrap().unwrap();

        // Everyone observed the same single attempt.
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 1);
        assert_eq!(leader.source, DataSource::Live);
        assert_eq!(reader.records, leader.records);
        assert_eq!(forced.records, leader.records);
        assert_eq!(reader.fetched_at, leader.fetched_at);
    }

    #[tokio::test]
    async fn partial_statistics_degrade_single_records() {
        let ctx = build(two_item_api(), Duration::from_secs(600));
        let outcome = ctx.coordinator.get_or_refresh(true).await.unwrap();

        assert_eq!(outcome.records.len(), 2);
        let a = &outcome.records[0];
        let b = &outcome.records[1];
        assert_eq!(a.id, "a");
        assert_eq!(a.view_count, 150);
        assert_eq!(a.comments.len(), 1);
        assert_eq!(b.id, "b");
        assert_eq!(b.view_count, 0);
        assert_eq!(b.description, "");
    }

    #[tokio::test]
    async fn comment_failure_degrades_only_that_record() {
        let mut api = two_item_api();
        api.comments
            .insert("b".to_string(), vec![comment("should not appear")]);
        api.fail_comments_for = Some("b".to_string());
        let ctx = build(api, Duration::from_secs(600));

        let outcome = ctx.coordinator.get_or_refresh(true).await.unwrap();
        assert_eq!(outcome.source, DataSource::Live);
        assert_eq!(outcome.records[0].comments.len(), 1);
        assert!(outcome.records[1].comments.is_empty());
    }

    #[tokio::test]
    async fn failed_attempt_serves_previous_cache() {
        let cache = CacheStore::new();
        let previous = vec![crate::metadata::VideoRecord {
            id: "old".into(),
            title: "Old".into(),
            url: crate::metadata::embed_url("old"),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            view_count: 3,
            description: String::new(),
            comments: Vec::new(),
        }];
        cache.write(CacheEntry::new(previous.clone()));

        let api = ScriptedApi {
            fail_listing: true,
            ..ScriptedApi::default()
        };
        let ctx = build_with_cache(api, Duration::ZERO, cache);

        let outcome = ctx.coordinator.get_or_refresh(true).await.unwrap();
        assert_eq!(outcome.source, DataSource::Cached);
        assert_eq!(outcome.records, previous);
    }

    #[tokio::test]
    async fn failed_attempt_without_cache_reads_snapshot() {
        let api = ScriptedApi {
            fail_listing: true,
            ..ScriptedApi::default()
        };
        let ctx = build(api, Duration::from_secs(600));
        let persisted = vec![crate::metadata::VideoRecord {
            id: "snap".into(),
            title: "Snap".into(),
            url: crate::metadata::embed_url("snap"),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            view_count: 9,
            description: String::new(),
            comments: Vec::new(),
        }];
        ctx.snapshot.save(&persisted).unwrap();

        let outcome = ctx.coordinator.get_or_refresh(false).await.unwrap();
        assert_eq!(outcome.source, DataSource::Fallback);
        assert_eq!(outcome.fetched_at, None);
        assert_eq!(outcome.records, persisted);
    }

    #[tokio::test]
    async fn failed_attempt_with_nothing_reports_no_data() {
        let api = ScriptedApi {
            fail_listing: true,
            ..ScriptedApi::default()
        };
        let ctx = build(api, Duration::from_secs(600));

        let err = ctx.coordinator.get_or_refresh(false).await.unwrap_err();
        assert_eq!(err, RefreshError::NoDataAvailable);
    }

    #[tokio::test]
    async fn empty_playlist_is_treated_as_a_failed_attempt() {
        let api = ScriptedApi::default();
        let ctx = build(api, Duration::from_secs(600));

        let err = ctx.coordinator.get_or_refresh(true).await.unwrap_err();
        assert_eq!(err, RefreshError::NoDataAvailable);
        assert_eq!(ctx.playlist_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_attempt_writes_the_snapshot() {
        let ctx = build(two_item_api(), Duration::from_secs(600));
        let outcome = ctx.coordinator.get_or_refresh(true).await.unwrap();

        let persisted = ctx.snapshot.load().unwrap().expect("snapshot written");
        assert_eq!(persisted, outcome.records);
    }
}
