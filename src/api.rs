#![forbid(unsafe_code)]

//! HTTP surface of the service.
//!
//! Every error leaves as `{"detail": "..."}`. Request bodies that fail to
//! parse or carry an invalid YouTube URL are rejected with 422 before any
//! job is created.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Path as AxumPath, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::downloads::DownloadManager;
use crate::jobs::{Job, JobError, JobRegistry, JobStatus};
use crate::middleware::{RateLimit, cors_layer, rate_limit, security_headers};
use crate::security::SecurityManager;
use crate::youtube::{VideoMetadata, YouTubeService, validate_youtube_url};

pub const YOUTUBE_PROBE_DOMAINS: &[&str] = &[
    "https://www.youtube.com",
    "https://youtube.com",
    "https://i.ytimg.com",
    "https://www.googleapis.com",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub youtube: Arc<YouTubeService>,
    pub downloads: DownloadManager,
    pub security: SecurityManager,
    pub probe_domains: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(settings: Settings, youtube: Arc<YouTubeService>, registry: JobRegistry) -> Self {
        let security = SecurityManager::new(&settings.jwt_secret_key);
        Self {
            downloads: DownloadManager::new(registry, youtube.clone()),
            settings: Arc::new(settings),
            youtube,
            security,
            probe_domains: Arc::new(
                YOUTUBE_PROBE_DOMAINS
                    .iter()
                    .map(|domain| domain.to_string())
                    .collect(),
            ),
        }
    }

    fn jobs(&self) -> &JobRegistry {
        self.downloads.registry()
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "detail": self.message }))).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => Self::not_found("Job not found"),
            JobError::AlreadyFinished(_) | JobError::InvalidTransition { .. } => {
                Self::bad_request(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::unprocessable(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::unprocessable(rejection.body_text())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct YouTubeUrlRequest {
    pub url: String,
}

impl YouTubeUrlRequest {
    fn validated(payload: Result<Json<Self>, JsonRejection>) -> ApiResult<String> {
        let Json(request) = payload?;
        if !validate_youtube_url(&request.url) {
            return Err(ApiError::unprocessable("Invalid YouTube URL format"));
        }
        Ok(request.url)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<VideoMetadata>,
    pub file_path: Option<String>,
    pub error_details: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub message: String,
    pub file_path: Option<String>,
    pub error_details: Option<String>,
}

impl From<Job> for DownloadStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            message: job.message,
            file_path: job.file_path,
            error_details: job.error_details,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub success: bool,
    pub metadata: Option<VideoMetadata>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub total_jobs: usize,
    pub jobs: BTreeMap<String, Job>,
}

#[derive(Debug, Deserialize)]
pub struct TestModeParams {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub enable: Option<bool>,
}

/// Query flags arrive as text; accept the usual spellings, not just
/// `true`/`false`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(serde::de::Error::custom(format!(
            "enable must be a boolean, got {other:?}"
        ))),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DomainProbe {
    pub domain: String,
    pub status_code: u16,
    pub accessible: bool,
}

pub fn router(state: AppState) -> Router {
    let settings = state.settings.clone();
    let limit = RateLimit::new(
        settings.rate_limit_requests,
        Duration::from_secs(settings.rate_limit_period_secs),
    )
    .trust_forwarded_headers(settings.trust_proxy_headers);
    let body_limit = usize::try_from(settings.max_upload_size).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(root))
        .route("/api/v1/health", get(health))
        .route("/api/v1/health/youtube", get(youtube_health))
        .route("/api/v1/health/network", get(network_health))
        .route("/api/v1/youtube/download", post(start_download))
        .route(
            "/api/v1/youtube/download/{job_id}/status",
            get(download_status),
        )
        .route("/api/v1/youtube/metadata", post(video_metadata))
        .route("/api/v1/youtube/jobs", get(list_jobs))
        .route("/api/v1/youtube/jobs/{job_id}", delete(cancel_job))
        .route(
            "/api/v1/youtube/test-mode",
            get(get_test_mode).post(set_test_mode),
        )
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(limit, rate_limit))
        .layer(cors_layer(&settings.allowed_origins))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "message": format!("{} API", state.settings.app_name) }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.settings.app_name,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn youtube_health(State(state): State<AppState>) -> Json<Value> {
    let test_mode = state.youtube.test_mode();
    let yt_dlp_version = state.youtube.probe_ytdlp().await;
    let available = test_mode || yt_dlp_version.is_some();
    Json(json!({
        "status": if available { "healthy" } else { "unhealthy" },
        "service_available": available,
        "download_path": state.youtube.download_dir().display().to_string(),
        "test_mode": test_mode,
        "yt_dlp_version": yt_dlp_version,
    }))
}

async fn network_health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let domains = state.probe_domains.as_ref().clone();
    let probes = tokio::task::spawn_blocking(move || probe_domains(&domains))
        .await
        .map_err(|err| ApiError::internal(format!("Internal server error: {err}")))?;
    let yt_dlp_available = state.youtube.probe_ytdlp().await.is_some();

    let reachable = probes.iter().any(|probe| probe.accessible);
    Ok(Json(json!({
        "status": if reachable { "healthy" } else { "degraded" },
        "youtube_domains": probes,
        "yt_dlp_available": yt_dlp_available,
        "timestamp": Utc::now(),
    })))
}

/// Any HTTP answer counts as reachable, including 403 from bot checks.
fn probe_domains(domains: &[String]) -> Vec<DomainProbe> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PROBE_TIMEOUT)
        .redirects(0)
        .build();
    domains
        .iter()
        .map(|domain| {
            let (status_code, accessible) = match agent.get(domain).call() {
                Ok(response) => (response.status(), true),
                Err(ureq::Error::Status(code, _)) => (code, true),
                Err(err) => {
                    warn!(domain = %domain, "network probe failed: {err}");
                    (0, false)
                }
            };
            DomainProbe {
                domain: domain.clone(),
                status_code,
                accessible,
            }
        })
        .collect()
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<YouTubeUrlRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = YouTubeUrlRequest::validated(payload)?;

    let metadata = state
        .youtube
        .fetcher()
        .fetch_metadata(&url)
        .await
        .map_err(|err| {
            error!(url = %url, "Error getting video metadata: {err}");
            ApiError::bad_request(format!("Error getting video metadata: {err}"))
        })?;

    let job = state
        .downloads
        .start(&url, Some(metadata))
        .await
        .map_err(|err| ApiError::internal(format!("Internal server error: {err:#}")))?;

    Ok(Json(DownloadResponse {
        job_id: job.id,
        status: job.status,
        message: job.message,
        created_at: job.created_at,
        metadata: job.metadata,
        file_path: job.file_path,
        error_details: job.error_details,
    }))
}

async fn download_status(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<DownloadStatusResponse>> {
    let job = state
        .jobs()
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(job.into()))
}

async fn video_metadata(
    State(state): State<AppState>,
    payload: Result<Json<YouTubeUrlRequest>, JsonRejection>,
) -> ApiResult<Json<MetadataResponse>> {
    let url = YouTubeUrlRequest::validated(payload)?;

    let response = match state.youtube.fetcher().fetch_metadata(&url).await {
        Ok(metadata) => MetadataResponse {
            success: true,
            metadata: Some(metadata),
            error: None,
        },
        Err(err) => {
            warn!(url = %url, "Error extracting video info: {err}");
            MetadataResponse {
                success: false,
                metadata: None,
                error: Some(format!("Error extracting video info: {err}")),
            }
        }
    };
    Ok(Json(response))
}

async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    let jobs: BTreeMap<String, Job> = state
        .jobs()
        .list()
        .into_iter()
        .map(|job| (job.id.clone(), job))
        .collect();
    Json(JobListResponse {
        total_jobs: jobs.len(),
        jobs,
    })
}

async fn cancel_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    state.jobs().cancel(&job_id).await?;
    Ok(Json(json!({ "message": "Job cancelled successfully" })))
}

async fn get_test_mode(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "test_mode": state.youtube.test_mode() }))
}

async fn set_test_mode(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<TestModeParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(params) = params?;
    if state.settings.is_production() {
        authorize(&state.security, &headers)?;
    }

    let enable = params.enable.unwrap_or(true);
    state.youtube.set_test_mode(enable);
    info!(enable, "test mode updated via API");
    Ok(Json(json!({
        "message": format!("Test mode {}", if enable { "enabled" } else { "disabled" }),
        "test_mode": state.youtube.test_mode(),
    })))
}

fn authorize(security: &SecurityManager, headers: &HeaderMap) -> ApiResult<()> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;
    security
        .verify_token(token)
        .map(|_| ())
        .map_err(|err| ApiError::unauthorized(err.to_string()))
}
