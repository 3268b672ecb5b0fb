//! # HTTP module
//!
//! This module provides the operational surface of the operator, liveness and
//! readiness probes, the metrics endpoint and the event bridge ingest

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Request, Response, StatusCode},
};
use tracing::debug;

use crate::svc::{bridge, cfg::Configuration};

pub mod layer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

// -----------------------------------------------------------------------------
// ServerState structure

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Configuration>,
    pub http: reqwest::Client,
    pub ready: Arc<AtomicBool>,
}

// -----------------------------------------------------------------------------
// Not found

#[tracing::instrument(skip_all)]
pub async fn not_found(_req: Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

// -----------------------------------------------------------------------------
// Healthz

#[tracing::instrument(skip_all)]
pub async fn healthz() -> Response<Body> {
    let mut res = Response::default();

    let message = serde_json::json!({"messaging": "Everything is fine! 🚀"}).to_string();

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(message);

    res
}

// -----------------------------------------------------------------------------
// Readyz

/// readiness follows the leadership lease, standbys answer unavailable so
/// traffic and probes can tell the active replica apart
#[tracing::instrument(skip_all)]
pub async fn readyz(State(state): State<ServerState>) -> Response<Body> {
    let mut res = Response::default();

    if state.ready.load(Ordering::SeqCst) {
        let message = serde_json::json!({"leader": true}).to_string();

        *res.status_mut() = StatusCode::OK;
        *res.body_mut() = Body::from(message);
    } else {
        let message = serde_json::json!({"leader": false}).to_string();

        *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        *res.body_mut() = Body::from(message);
    }

    res
}

// -----------------------------------------------------------------------------
// Events

/// event bridge ingest, accepts structured-mode cloudevents and republishes
/// them into the broker
#[tracing::instrument(skip_all)]
pub async fn events(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let mut res = Response::default();

    match bridge::forward(&state.http, &state.config, content_type, &body).await {
        Ok(()) => {
            *res.status_mut() = StatusCode::ACCEPTED;
        }
        Err(err) if err.is_rejection() => {
            debug!(error = err.to_string(), "Reject inbound event");

            let message = serde_json::json!({"error": err.to_string()}).to_string();

            *res.status_mut() = StatusCode::BAD_REQUEST;
            *res.body_mut() = Body::from(message);
        }
        Err(err) => {
            let message = serde_json::json!({"error": err.to_string()}).to_string();

            *res.status_mut() = StatusCode::BAD_GATEWAY;
            *res.body_mut() = Body::from(message);
        }
    }

    res
}

// -----------------------------------------------------------------------------
// Dead letter accounting

#[tracing::instrument(skip_all)]
pub async fn dead_letter(headers: HeaderMap, body: Bytes) -> Response<Body> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let mut res = Response::default();

    match bridge::account_dead_letter(content_type, &body) {
        Ok(()) => {
            *res.status_mut() = StatusCode::ACCEPTED;
        }
        Err(err) => {
            let message = serde_json::json!({"error": err.to_string()}).to_string();

            *res.status_mut() = StatusCode::BAD_REQUEST;
            *res.body_mut() = Body::from(message);
        }
    }

    res
}
