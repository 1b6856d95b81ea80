//! HTTP surface of the hub.
//!
//! Routes:
//! - `GET /health`
//! - `GET /metrics`
//! - `GET /api/v2/devices`
//! - `GET /api/v2/device` (WebSocket connect, see [`super::ws`])
//! - `POST /api/v2/device/send`
//! - `DELETE /api/v2/device/{id}`

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, info};

use crate::device::{DeviceError, DeviceId, Manager, Request};
use crate::metrics::MetricsRegistry;
use crate::server::ws::{self, MAX_DEVICES_HEADER};
use crate::wrp::{self, Format, WrpError};

/// Per-request override of the route timeout, in milliseconds.
pub static TRANSACTION_TIMEOUT_HEADER: HeaderName =
    HeaderName::from_static("x-webpa-transaction-timeout");

/// Default request body cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state for every handler.
#[derive(Clone)]
pub struct HubState {
    pub manager: Manager,
    pub metrics: Arc<MetricsRegistry>,
    pub default_route_timeout: Duration,
    pub start_time: Instant,
}

impl HubState {
    pub fn new(manager: Manager, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            manager,
            metrics,
            default_route_timeout: Duration::from_secs(120),
            start_time: Instant::now(),
        }
    }

    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.default_route_timeout = timeout;
        self
    }
}

/// Build the router with every hub endpoint.
pub fn create_router(state: HubState, max_body_bytes: usize) -> Router {
    let connect = Router::new()
        .route("/api/v2/device", get(ws::connect_handler))
        .route_layer(middleware::from_fn(ws::device_id_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v2/devices", get(list_handler))
        .route("/api/v2/device/send", post(send_handler))
        .route("/api/v2/device/{id}", delete(disconnect_handler))
        .merge(connect)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Status code for a hub failure.
pub fn status_for(error: &DeviceError) -> StatusCode {
    match error {
        DeviceError::DeviceNotFound => StatusCode::NOT_FOUND,
        DeviceError::InvalidDeviceName(_)
        | DeviceError::Wrp(WrpError::Decode { .. })
        | DeviceError::Wrp(WrpError::Encode { .. }) => StatusCode::BAD_REQUEST,
        DeviceError::Wrp(WrpError::UnsupportedContentType(_)) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        DeviceError::DuplicateId(_) | DeviceError::TransactionAlreadyRegistered(_) => {
            StatusCode::CONFLICT
        }
        DeviceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DeviceError::DeviceBusy
        | DeviceError::DeviceClosed
        | DeviceError::CapacityExceeded { .. }
        | DeviceError::TransactionCancelled
        | DeviceError::TransactionsClosed
        | DeviceError::Cancelled
        | DeviceError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        DeviceError::MissingDeviceName
        | DeviceError::NoSuchTransactionKey(_)
        | DeviceError::Upgrade(_)
        | DeviceError::Pinger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(error: &DeviceError) -> Response {
    (status_for(error), Json(json!({ "error": error.to_string() }))).into_response()
}

/// `GET /health`
async fn health_handler(State(state): State<HubState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "devices": state.manager.len(),
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
    }))
}

/// `GET /metrics`
async fn metrics_handler(State(state): State<HubState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// `GET /api/v2/devices`
async fn list_handler(State(state): State<HubState>) -> Response {
    let mut devices = Vec::with_capacity(state.manager.len());
    state.manager.visit_all(|device| devices.push(device.summary()));
    devices.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    let count = devices.len();

    let mut response = Json(json!({ "devices": devices, "count": count })).into_response();
    response
        .headers_mut()
        .insert(MAX_DEVICES_HEADER.clone(), ws::max_devices_value(&state.manager));
    response
}

fn route_timeout(headers: &HeaderMap, default: Duration) -> Result<Duration, Response> {
    let Some(value) = headers.get(&TRANSACTION_TIMEOUT_HEADER) else {
        return Ok(default);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid transaction timeout" })),
            )
                .into_response()
        })
}

/// `POST /api/v2/device/send`
async fn send_handler(State(state): State<HubState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let format = match Format::from_content_type(content_type) {
        Ok(format) => format,
        Err(e) => return error_response(&e.into()),
    };
    let timeout = match route_timeout(&headers, state.default_route_timeout) {
        Ok(timeout) => timeout,
        Err(response) => return response,
    };
    let mut request = match Request::decode(body, format) {
        Ok(request) => request.with_timeout(timeout),
        Err(e) => return error_response(&e),
    };
    request.ensure_transaction_uuid();

    debug!(
        target: "http",
        destination = request.message.destination.as_str(),
        transaction_uuid = request.message.transaction_uuid.as_str(),
        "routing message"
    );

    match state.manager.route(request).await {
        Ok(None) => StatusCode::OK.into_response(),
        Ok(Some(reply)) => {
            let body = match format {
                Format::Msgpack => Ok(reply.contents.to_vec()),
                Format::Json => wrp::encode(&reply.message, Format::Json),
            };
            match body {
                Ok(body) => (
                    [(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()))],
                    body,
                )
                    .into_response(),
                Err(e) => error_response(&e.into()),
            }
        }
        Err(e) => {
            debug!(target: "http", error = %e, "route failed");
            error_response(&e)
        }
    }
}

/// `DELETE /api/v2/device/{id}`
async fn disconnect_handler(State(state): State<HubState>, Path(id): Path<String>) -> Response {
    let id = match DeviceId::parse(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    if state.manager.disconnect(&id) {
        info!(target: "http", device_id = id.as_str(), "device disconnected on request");
        StatusCode::OK.into_response()
    } else {
        error_response(&DeviceError::DeviceNotFound)
    }
}
