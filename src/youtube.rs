//! Typed client for the three YouTube Data API v3 resources the backend
//! aggregates: the uploads playlist listing, per-video statistics, and
//! per-video comment threads.
//!
//! The client owns retry and error classification. Callers only ever see
//! [`UpstreamError`]; whether a failure aborts the whole aggregation or
//! degrades a single record is decided upstream of this module.

use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::comments;
use crate::metadata::Comment;

const API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Canonical length of a bare video identifier.
pub const VIDEO_ID_LEN: usize = 11;

/// Page size used when aggregating the feed.
pub const FEED_PAGE_SIZE: u32 = 10;
/// Larger page size for the standalone comments endpoint.
pub const COMMENT_PAGE_SIZE: u32 = 20;

// Only transient failures are retried; retrying a quota rejection would
// spend quota exactly when quota is the problem.
const TRANSIENT_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Classified upstream failure. Fatal only to the current aggregation
/// attempt, never to the process.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rate limit or quota exceeded")]
    RateLimited,
    #[error("upstream rejected the API credential")]
    Unauthorized,
    #[error("upstream resource not found")]
    NotFound,
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// One entry of the uploads playlist listing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistItem {
    pub video_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
}

/// Statistics joined onto a playlist item by video id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoStats {
    pub views: u64,
    pub description: String,
}

/// Sanitized comment threads for one video plus the upstream total.
#[derive(Debug, Clone, Default)]
pub struct CommentThreads {
    pub comments: Vec<Comment>,
    pub total_results: u64,
}

/// The three upstream calls the refresh coordinator drives. The concrete
/// implementation is [`YouTubeClient`]; tests substitute a scripted one.
pub trait UploadsApi: Send + Sync {
    fn list_playlist_items(
        &self,
    ) -> impl Future<Output = Result<Vec<PlaylistItem>, UpstreamError>> + Send;

    fn fetch_statistics(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, VideoStats>, UpstreamError>> + Send;

    fn fetch_comments(
        &self,
        video_id: &str,
    ) -> impl Future<Output = Result<CommentThreads, UpstreamError>> + Send;
}

/// HTTP client for the YouTube Data API, bound to one API key and one
/// uploads playlist.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    playlist_id: String,
}

impl YouTubeClient {
    pub fn new(api_key: impl Into<String>, playlist_id: impl Into<String>) -> Self {
        Self::with_base_url(API_BASE_URL, api_key, playlist_id)
    }

    /// Points the client at a different API root. Used by tests to run
    /// against a local stub server.
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        playlist_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            playlist_id: playlist_id.into(),
        }
    }

    /// Fetches one page of comment threads for a video, newest first.
    pub async fn fetch_comment_threads(
        &self,
        video_id: &str,
        max_results: u32,
    ) -> Result<CommentThreads, UpstreamError> {
        let max_results = max_results.to_string();
        let response: CommentThreadListResponse = self
            .get_json(
                "commentThreads",
                &[
                    ("part", "snippet"),
                    ("videoId", video_id),
                    ("maxResults", max_results.as_str()),
                    ("order", "time"),
                    ("key", self.api_key.as_str()),
                ],
            )
            .await?;

        let total_results = response
            .page_info
            .and_then(|info| info.total_results)
            .unwrap_or(0);
        let comments = response
            .items
            .into_iter()
            .map(|item| comment_from_snippet(item.snippet.top_level_comment.snippet))
            .collect();

        Ok(CommentThreads {
            comments,
            total_results,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(resource, query).await {
                Err(UpstreamError::Transient(reason)) if attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(resource, attempt, %reason, "retrying transient failure");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.base_url, resource);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| UpstreamError::Transient(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| UpstreamError::Malformed(err.to_string()))
    }
}

impl UploadsApi for YouTubeClient {
    async fn list_playlist_items(&self) -> Result<Vec<PlaylistItem>, UpstreamError> {
        let max_results = FEED_PAGE_SIZE.to_string();
        let response: PlaylistItemListResponse = self
            .get_json(
                "playlistItems",
                &[
                    ("part", "snippet"),
                    ("playlistId", self.playlist_id.as_str()),
                    ("maxResults", max_results.as_str()),
                    ("key", self.api_key.as_str()),
                ],
            )
            .await?;

        let items = response
            .items
            .into_iter()
            .map(|item| PlaylistItem {
                video_id: item.snippet.resource_id.video_id,
                title: item.snippet.title,
                published_at: item.snippet.published_at,
            })
            .collect();
        Ok(items)
    }

    async fn fetch_statistics(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, VideoStats>, UpstreamError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids.join(",");
        let response: VideoListResponse = self
            .get_json(
                "videos",
                &[
                    ("part", "snippet,statistics"),
                    ("id", joined.as_str()),
                    ("key", self.api_key.as_str()),
                ],
            )
            .await?;

        let mut stats = HashMap::new();
        for item in response.items {
            let views = item
                .statistics
                .and_then(|statistics| statistics.view_count)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0);
            let description = item
                .snippet
                .map(|snippet| snippet.description)
                .unwrap_or_default();
            stats.insert(item.id, VideoStats { views, description });
        }
        Ok(stats)
    }

    async fn fetch_comments(&self, video_id: &str) -> Result<CommentThreads, UpstreamError> {
        self.fetch_comment_threads(video_id, FEED_PAGE_SIZE).await
    }
}

fn classify_status(status: reqwest::StatusCode) -> UpstreamError {
    use reqwest::StatusCode;
    match status {
        StatusCode::UNAUTHORIZED => UpstreamError::Unauthorized,
        // The Data API reports quota exhaustion as 403.
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited,
        StatusCode::NOT_FOUND => UpstreamError::NotFound,
        StatusCode::BAD_REQUEST => {
            UpstreamError::Malformed("upstream rejected the request as malformed".into())
        }
        status => UpstreamError::Transient(format!("unexpected status {status}")),
    }
}

fn comment_from_snippet(snippet: CommentSnippet) -> Comment {
    let author = comments::display_author(snippet.author_display_name);
    let author_avatar_url =
        comments::avatar_or_placeholder(snippet.author_profile_image_url, &author);
    Comment {
        author,
        text: snippet.text_display.unwrap_or_default(),
        published_at: snippet.published_at,
        author_avatar_url,
    }
}

static VIDEO_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)([^&\n?#]+)",
        r"youtube\.com/embed/([^&\n?#]+)",
        r"v=([^&\n?#]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern compiles"))
    .collect()
});

/// Normalizes a path parameter into a bare video id.
///
/// Accepts either an 11-character id or one of the known URL shapes. Unknown
/// shapes are handed through unchanged so the downstream API lookup fails
/// loudly instead of this helper guessing.
pub fn extract_video_id(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.len() == VIDEO_ID_LEN && !trimmed.contains('/') {
        return trimmed.to_string();
    }
    for pattern in VIDEO_URL_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(trimmed)
            && let Some(id) = captures.get(1)
        {
            return id.as_str().to_string();
        }
    }
    tracing::warn!(
        input = trimmed,
        "identifier matched no known URL shape, passing through unchanged"
    );
    trimmed.to_string()
}

// Wire types. Field names mirror the JSON the Data API returns; everything
// the backend does not consume is simply not declared.

#[derive(Debug, Deserialize)]
struct PlaylistItemListResponse {
    #[serde(default)]
    items: Vec<PlaylistItemResource>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemResource {
    snippet: PlaylistItemSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemSnippet {
    title: String,
    published_at: DateTime<Utc>,
    resource_id: PlaylistResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistResourceId {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoResource>,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
    snippet: Option<VideoSnippet>,
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    #[serde(default)]
    description: String,
}

// Counts arrive as JSON strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadListResponse {
    #[serde(default)]
    items: Vec<CommentThreadResource>,
    page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    total_results: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CommentThreadResource {
    snippet: CommentThreadSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadSnippet {
    top_level_comment: TopLevelComment,
}

#[derive(Debug, Deserialize)]
struct TopLevelComment {
    snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    author_display_name: Option<String>,
    text_display: Option<String>,
    published_at: DateTime<Utc>,
    author_profile_image_url: Option<String>,
}
