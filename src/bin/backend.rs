#![forbid(unsafe_code)]

//! Axum backend that serves the aggregated channel feed.
//!
//! Every endpoint is a thin adapter: the read path, the authenticated
//! forced-refresh path, and the webhook all end up in the shared
//! [`RefreshCoordinator`], which owns the caching and single-flight logic.
//! A daily in-process timer is the remaining trigger.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::signal;
use viewtube_tools::{
    cache::CacheStore,
    config::{BackendConfig, ConfigOverrides, resolve_config},
    metadata::{Comment, SnapshotStore, VideoRecord},
    refresh::{DataSource, RefreshCoordinator, ServeOutcome},
    security::{ensure_not_root, verify_bearer, verify_webhook_signature},
    youtube::{COMMENT_PAGE_SIZE, YouTubeClient, extract_video_id},
};

/// The original deployment refreshed once per day from cron; the in-process
/// timer keeps that cadence. The interval's first tick fires immediately,
/// which doubles as the startup cache warm-up.
const DAILY_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct BackendArgs {
    port: Option<u16>,
    host: Option<String>,
    env_path: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut port = None;
        let mut host = None;
        let mut env_path = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--port=") {
                port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--port" => {
                    let value = args.next().ok_or_else(|| anyhow!("--port requires a value"))?;
                    port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args.next().ok_or_else(|| anyhow!("--host requires a value"))?;
                    host = Some(value);
                }
                "--env" => {
                    let value = args.next().ok_or_else(|| anyhow!("--env requires a value"))?;
                    env_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self {
            port,
            host,
            env_path,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

/// Shared state injected into every Axum handler.
///
/// * `coordinator` owns the cache, the single-flight refresh, and fallback.
/// * `client` serves the standalone per-video comments endpoint, which is
///   deliberately uncached (it is a debugging/detail surface).
/// * `snapshot` is only consulted directly by the health report.
#[derive(Clone)]
struct AppState {
    coordinator: RefreshCoordinator<YouTubeClient>,
    client: YouTubeClient,
    snapshot: SnapshotStore,
    config: Arc<BackendConfig>,
}

impl AppState {
    fn new(config: BackendConfig) -> Self {
        let client = YouTubeClient::new(config.api_key.clone(), config.playlist_id.clone());
        let snapshot = SnapshotStore::new(config.snapshot_path.clone());
        let coordinator = RefreshCoordinator::new(
            client.clone(),
            CacheStore::new(),
            snapshot.clone(),
            config.cache_duration,
        );
        Self {
            coordinator,
            client,
            snapshot,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    ensure_not_root("backend")?;

    let args = BackendArgs::parse()?;
    let config = resolve_config(ConfigOverrides {
        viewtube_port: args.port,
        viewtube_host: args.host,
        env_path: args.env_path,
        snapshot_path: None,
    })?;

    let host: IpAddr = config
        .viewtube_host
        .parse()
        .context("expected a valid IPv4 or IPv6 address for --host/VIEWTUBE_HOST")?;
    let port = config.viewtube_port;

    let state = AppState::new(config);
    spawn_daily_refresh(state.coordinator.clone());

    let app = router(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    // Each route is extremely small; everything interesting happens behind
    // the coordinator.
    Router::new()
        .route("/api/videos", get(list_videos))
        .route("/api/comments/{videoId}", get(get_comments))
        .route("/api/update-videos", get(update_videos).post(update_videos))
        .route("/api/webhook", get(webhook_handshake).post(webhook_notify))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Periodic trigger. Goes through the same coordinator as everyone else, so
/// a timer firing during an in-flight refresh joins it instead of starting a
/// second one.
fn spawn_daily_refresh(coordinator: RefreshCoordinator<YouTubeClient>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DAILY_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            match coordinator.get_or_refresh(true).await {
                Ok(outcome) => {
                    tracing::info!(videos = outcome.records.len(), "scheduled refresh complete");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "scheduled refresh produced no data");
                }
            }
        }
    });
}

/// Envelope for `/api/videos`. Live and cached responses carry `cached` +
/// `updatedAt`; snapshot fallbacks carry `fallback` + `error` instead.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideosResponse {
    videos: Vec<VideoRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl VideosResponse {
    fn from_outcome(outcome: ServeOutcome) -> Self {
        match outcome.source {
            DataSource::Live | DataSource::Cached => Self {
                videos: outcome.records,
                cached: Some(outcome.source == DataSource::Cached),
                updated_at: outcome.fetched_at,
                fallback: None,
                error: None,
            },
            DataSource::Fallback => Self {
                videos: outcome.records,
                cached: None,
                updated_at: None,
                fallback: Some(true),
                error: Some("live refresh failed; serving fallback snapshot".to_string()),
            },
        }
    }
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<VideosResponse>> {
    let outcome = state
        .coordinator
        .get_or_refresh(false)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(VideosResponse::from_outcome(outcome)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentsResponse {
    success: bool,
    video_id: String,
    raw_video_id: String,
    count: usize,
    comments: Vec<Comment>,
    total_results: u64,
    error: Option<String>,
    timestamp: DateTime<Utc>,
}

/// Standalone comment lookup for one video. Accepts a bare id or any known
/// URL shape. Upstream failures degrade to an empty list with `error` set
/// rather than a non-200 response.
async fn get_comments(
    State(state): State<AppState>,
    AxumPath(raw_video_id): AxumPath<String>,
) -> ApiResult<Json<CommentsResponse>> {
    if raw_video_id.trim().is_empty() {
        return Err(ApiError::bad_request("Video ID is required"));
    }

    let video_id = extract_video_id(&raw_video_id);
    let (comments, total_results, error) = match state
        .client
        .fetch_comment_threads(&video_id, COMMENT_PAGE_SIZE)
        .await
    {
        Ok(threads) => (threads.comments, threads.total_results, None),
        Err(err) => {
            tracing::warn!(video_id = %video_id, error = %err, "comment fetch failed");
            (Vec::new(), 0, Some(err.to_string()))
        }
    };

    Ok(Json(CommentsResponse {
        success: true,
        video_id,
        raw_video_id,
        count: comments.len(),
        comments,
        total_results,
        error,
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    success: bool,
    videos: Vec<VideoRecord>,
    updated_at: DateTime<Utc>,
}

/// Forced-refresh endpoint for external cron jobs. Requires the shared
/// bearer secret; the refresh itself still goes through the single-flight
/// coordinator.
async fn update_videos(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !verify_bearer(authorization, &state.config.cron_secret) {
        return ApiError::unauthorized("Unauthorized").into_response();
    }

    match state.coordinator.get_or_refresh(true).await {
        Ok(outcome) => Json(UpdateResponse {
            success: true,
            videos: outcome.records,
            updated_at: outcome.fetched_at.unwrap_or_else(Utc::now),
        })
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "error": err.to_string(),
            })),
        )
            .into_response(),
    }
}

/// Subscription handshake: the hub echoes our verify token and expects the
/// challenge back as plain text.
async fn webhook_handshake(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge");

    if mode == Some("subscribe")
        && token == Some(state.config.webhook_secret.as_str())
        && let Some(challenge) = challenge
    {
        tracing::info!("webhook subscription verified");
        return challenge.clone().into_response();
    }

    Json(serde_json::json!({
        "message": "Webhook endpoint",
        "timestamp": Utc::now(),
    }))
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    message: String,
    processed: bool,
    timestamp: DateTime<Utc>,
}

/// Update notification. Once the signature passes we always acknowledge with
/// 200, even if the refresh behind it found nothing; the hub only cares that
/// the notification was received.
async fn webhook_notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get("x-hub-signature")
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        });

    if !verify_webhook_signature(signature, &state.config.webhook_secret) {
        return ApiError::unauthorized("Unauthorized webhook").into_response();
    }

    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&body) {
        let video_id = payload["videoId"].as_str().or(payload["video_id"].as_str());
        if let Some(video_id) = video_id {
            tracing::info!(video_id, "webhook notification for new video");
        }
    } else if !body.is_empty() {
        tracing::debug!("non-JSON webhook payload received");
    }

    if let Err(err) = state.coordinator.get_or_refresh(true).await {
        tracing::warn!(error = %err, "webhook-triggered refresh produced no data");
    }

    Json(WebhookAck {
        message: "Webhook processed successfully".to_string(),
        processed: true,
        timestamp: Utc::now(),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    environment: EnvironmentReport,
    fallback_data: FallbackReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentReport {
    has_api_key: bool,
    has_cron_secret: bool,
    has_webhook_secret: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FallbackReport {
    available: bool,
    video_count: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let video_count = state.snapshot.video_count();
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        environment: EnvironmentReport {
            has_api_key: !state.config.api_key.is_empty(),
            has_cron_secret: !state.config.cron_secret.is_empty(),
            has_webhook_secret: !state.config.webhook_secret.is_empty(),
        },
        fallback_data: FallbackReport {
            available: video_count.is_some(),
            video_count: video_count.unwrap_or(0),
        },
    })
}
