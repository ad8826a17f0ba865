//! axum HTTP ingestion endpoints.
//!
//! `POST /logs` records one request's observations into the current window. Requests
//! must carry the configured key in the `X-API-Key` header; gzip-compressed bodies
//! are decompressed via tower-http middleware.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use super::request::LogRequest;
use crate::config::{ProfileConfig, DEFAULT_MAX_BODY_SIZE};
use crate::key::WindowKey;
use crate::profile::{FeatureValue, Profile, ProfileError};
use crate::store::ProfileStore;
use crate::upload::Uploader;
use crate::ProfiledError;

/// Header carrying the client credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct IngestState {
    pub store: Arc<ProfileStore>,
    pub uploader: Arc<Uploader>,
    pub profile: Arc<ProfileConfig>,
}

/// Response to an accepted log request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub recorded: usize,
}

/// Snapshot of the service's aggregation state.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub epoch: u64,
    pub live_keys: usize,
    pub pending_uploads: usize,
    pub window_start: DateTime<Utc>,
}

/// Create the ingestion router with the default body size limit.
pub fn ingest_router(state: IngestState) -> Router {
    ingest_router_with_limit(state, DEFAULT_MAX_BODY_SIZE)
}

/// Create the ingestion router with a custom body size limit.
///
/// The limit applies to the decompressed body.
pub fn ingest_router_with_limit(state: IngestState, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/logs", post(handle_logs))
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Handle GET /status
async fn handle_status(State(state): State<IngestState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        epoch: state.store.epoch(),
        live_keys: state.store.len(),
        pending_uploads: state.uploader.pending(),
        window_start: state.store.window_start(),
    })
}

/// Handle POST /logs
#[tracing::instrument(skip_all)]
async fn handle_logs(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LogResponse>, HttpError> {
    authorize(&headers, &state.profile)?;

    let request = LogRequest::from_slice(&body)?;
    let key = request.window_key(
        &state.profile.org_id,
        &state.profile.default_dataset_id,
        &state.profile.tag_prefix,
    );
    let observations = request.into_observations()?;

    for (name, value) in observations.iter().filter(|(_, v)| v.is_unsupported()) {
        tracing::warn!(key = %key, feature = %name, recorded_as = %value, "unsupported value type");
    }

    let recorded = apply_observations(&state.store, &key, &observations)?;

    tracing::debug!(key = %key, recorded, "recorded observations");
    Ok(Json(LogResponse { recorded }))
}

/// Records a request's observations into the current window as one unit.
///
/// The batch is built off to the side and merged under the key's guard only once
/// every observation has been accepted, so a rejected request leaves no trace.
fn apply_observations(
    store: &ProfileStore,
    key: &WindowKey,
    observations: &[(String, FeatureValue)],
) -> Result<usize, ProfileError> {
    let mut batch = Profile::new();
    for (name, value) in observations {
        batch.record(name, value)?;
    }
    store.with_current(key, |profile| profile.merge(&batch));
    Ok(observations.len())
}

/// Checks the presented API key. Fails closed when no key is configured.
fn authorize(headers: &HeaderMap, profile: &ProfileConfig) -> Result<(), ProfiledError> {
    let Some(expected) = &profile.api_key else {
        return Err(ProfiledError::Unauthorized("no API key configured"));
    };
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProfiledError::Unauthorized("missing API key"))?;

    if expected.matches(presented) {
        Ok(())
    } else {
        Err(ProfiledError::Unauthorized("invalid API key"))
    }
}

/// HTTP error response wrapper.
pub struct HttpError(ProfiledError);

impl From<ProfiledError> for HttpError {
    fn from(err: ProfiledError) -> Self {
        Self(err)
    }
}

impl From<ProfileError> for HttpError {
    fn from(err: ProfileError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            ProfiledError::InvalidRequest(_)
            | ProfiledError::JsonDecode { .. }
            | ProfiledError::Profile(_) => StatusCode::BAD_REQUEST,
            ProfiledError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }

        (status, self.0.to_string()).into_response()
    }
}
