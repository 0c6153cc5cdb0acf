use std::path::Path as StdPath;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

mod upload;
mod ws;

use crate::config::{resolve_relative_to, AppConfig, ServerConfig};
use crate::detection::{resolve_program, DetectionInvoker};
use crate::notify::NotificationHub;
use crate::pipeline::{PipelineError, UploadPipeline};
use crate::storage::{Storage, StorageError};

pub use upload::UploadResponse;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    pipeline: UploadPipeline,
    notifications: Arc<NotificationHub>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, storage: Storage, notifications: Arc<NotificationHub>) -> Self {
        let invoker = DetectionInvoker::new(config.detector.clone(), Arc::clone(&notifications));
        let pipeline = UploadPipeline::new(
            Arc::new(storage),
            invoker,
            config.detector.timeout_secs.map(Duration::from_secs),
            config.upload.cleanup_on_failure,
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                pipeline,
                notifications,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Validate `config`, resolve its relative paths against `base_dir`,
    /// create the storage roots and locate the detector executable.
    pub async fn from_config(mut config: AppConfig, base_dir: &StdPath) -> Result<Self> {
        config.validate()?;

        config.paths.uploads_dir = resolve_relative_to(base_dir, &config.paths.uploads_dir);
        config.paths.detected_dir = resolve_relative_to(base_dir, &config.paths.detected_dir);
        if let Some(dir) = config.detector.working_dir.as_mut() {
            *dir = resolve_relative_to(base_dir, dir);
        }

        let program = &config.detector.program;
        let program = if program.is_relative() && program.components().count() > 1 {
            base_dir.join(program)
        } else {
            program.clone()
        };
        config.detector.program = resolve_program(&program).with_context(|| {
            format!("detector executable not found: {}", program.display())
        })?;

        let storage = Storage::open(&config.paths.uploads_dir, &config.paths.detected_dir)
            .await
            .context("failed to prepare storage directories")?;

        info!(
            uploads_dir = %storage.uploads_dir().display(),
            detected_dir = %storage.detected_dir().display(),
            detector = %config.detector.program.display(),
            "Storage and detector ready"
        );

        Ok(Self::new(config, storage, Arc::new(NotificationHub::new())))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &UploadPipeline {
        &self.inner.pipeline
    }

    pub fn storage(&self) -> &Storage {
        self.inner.pipeline.storage()
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.inner.notifications
    }

    /// Cancelled on shutdown; in-flight workers observe child tokens of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let detected = ServeDir::new(state.storage().detected_dir());
    let body_limit = state.config().upload.max_bytes;
    let cors = cors_layer(&state.config().server.cors_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/upload", post(upload::upload))
        .route("/ws", any(ws::notifications_ws))
        .nest_service("/detected", detected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(origin = %origin, error = %error, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Scheme and authority clients should use to reach this server.
fn public_base_url(server: &ServerConfig, headers: &HeaderMap) -> String {
    if let Some(url) = server.public_url.as_deref() {
        return url.trim_end_matches('/').to_string();
    }

    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let host = if server.host == "0.0.0.0" || server.host == "::" {
                "localhost"
            } else {
                server.host.as_str()
            };
            format!("{host}:{}", server.port)
        });
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| matches!(*value, "http" | "https"))
        .unwrap_or("http");

    format!("{scheme}://{host}")
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Internal(format!("error storing upload: {err}"))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Internal(err.to_string())
    }
}
