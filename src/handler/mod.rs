//! HTTP handlers over the ingestion pipeline.

use axum::{
    async_trait,
    extract::{rejection::BytesRejection, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::broadcast::{Broadcaster, Credentials, Principal};
use crate::pipeline::{IngestError, IngestPipeline, IngestReceipt};
use crate::queue::{JobId, JobSnapshot};
use crate::storage::{Page, Pagination, PointFilter, StatsSnapshot};

pub mod ws;

/// Largest accepted request body, before or after gzip decompression.
pub(crate) const MAX_DECOMPRESSED_SIZE: usize = 10 * 1024 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub broadcaster: Arc<Broadcaster>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Storage(String),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(msg) => ApiError::BadRequest(msg),
            e @ IngestError::Capacity { .. } => ApiError::PayloadTooLarge(e.to_string()),
            IngestError::Storage(e) => ApiError::Storage(e.to_string()),
            e @ IngestError::Unavailable(_) => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Storage(_) => (StatusCode::BAD_GATEWAY, "STORAGE_ERROR"),
        };

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Caller identity from an `Authorization: Bearer <jwt>` header.
pub struct AuthenticatedUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?
            .to_str()
            .map_err(|_| ApiError::Unauthorized("invalid authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("expected bearer token".into()))?;

        state
            .broadcaster
            .verifier()
            .verify(&Credentials::bearer(token))
            .map(AuthenticatedUser)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}

fn body_rejection(rejection: BytesRejection) -> ApiError {
    warn!(error = %rejection.body_text(), "request body rejected");
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        ))
    } else {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub(crate) fn decompress_if_gzipped(body: Bytes, is_gzipped: bool) -> Result<Bytes, ApiError> {
    let too_large = || {
        ApiError::PayloadTooLarge(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        ))
    };

    if !is_gzipped && body.len() > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read = body.len(),
            max = MAX_DECOMPRESSED_SIZE,
            "uncompressed body exceeds limit"
        );
        return Err(too_large());
    }
    if !is_gzipped {
        return Ok(body);
    }

    debug!(compressed_size = body.len(), "decompressing gzipped body");
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(2));
    let bytes_read = GzDecoder::new(body.as_ref())
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| {
            error!(error = %e, "gzip decompression failed");
            ApiError::BadRequest(format!("gzip decompression failed: {}", e))
        })?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read,
            max = MAX_DECOMPRESSED_SIZE,
            "decompressed size exceeds limit"
        );
        return Err(too_large());
    }
    debug!(decompressed_size = bytes_read, "decompression complete");
    Ok(Bytes::from(decompressed))
}

fn is_gzipped(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

/// Accepts `[...]` or `{"points": [...]}`.
fn extract_points(body: &[u8]) -> Result<Vec<JsonValue>, ApiError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {}", e)))?;
    match value {
        JsonValue::Array(points) => Ok(points),
        JsonValue::Object(mut obj) => match obj.remove("points") {
            Some(JsonValue::Array(points)) => Ok(points),
            _ => Err(ApiError::BadRequest(
                "expected an array of points or an object with a 'points' array".into(),
            )),
        },
        _ => Err(ApiError::BadRequest(
            "expected an array of points or an object with a 'points' array".into(),
        )),
    }
}

#[tracing::instrument(
    name = "http_ingest",
    skip_all,
    fields(subject = %user.0.subject, body_size = tracing::field::Empty)
)]
pub async fn ingest_data(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<IngestReceipt>), ApiError> {
    let body = body.map_err(body_rejection)?;
    tracing::Span::current().record("body_size", body.len());
    let body = decompress_if_gzipped(body, is_gzipped(&headers))?;
    let points = extract_points(&body)?;

    let receipt = state.pipeline.ingest(points).await.map_err(|e| {
        warn!(error = %e, "ingest rejected");
        ApiError::from(e)
    })?;
    let status = if receipt.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub point_type: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_data(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Page>, ApiError> {
    let filter = PointFilter {
        point_type: params.point_type,
        since: None,
    };
    let page = Pagination::new(params.page, params.limit);
    Ok(Json(state.pipeline.list(filter, page).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    #[serde(rename = "type")]
    pub point_type: Option<String>,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<StatsSnapshot>, ApiError> {
    Ok(Json(
        state.pipeline.stats(params.point_type.as_deref()).await?,
    ))
}

pub async fn get_realtime_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsSnapshot>, ApiError> {
    Ok(Json(state.pipeline.realtime_stats().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let not_found = || ApiError::NotFound(format!("job {} not found", id));
    let job_id: JobId = id.parse().map_err(|_| not_found())?;
    state.pipeline.job(job_id).map(Json).ok_or_else(not_found)
}

pub async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "accepting": state.pipeline.queue().is_accepting(),
        "connections": state.broadcaster.connection_count(),
        "queue": state.pipeline.queue().counts(),
    }))
}
