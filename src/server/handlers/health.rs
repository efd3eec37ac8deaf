//! `GET /livez` and `GET /readyz` — liveness and readiness probes for the
//! gateway itself (not the upstream services it protects).
//!
//! `/readyz` is the stricter of the two: it also verifies the signer holds
//! a usable keypair and the session store is reachable, so a deployment
//! with a broken database or a corrupt signing key fails its readiness
//! check instead of accepting `/auth` probes it cannot actually serve.

use std::sync::Arc;

use axum::{extract::State, response::Response};
use hyper::{HeaderMap, StatusCode};
use serde_json::json;

use crate::state::AppState;

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .contains("application/json")
}

fn respond(status: StatusCode, text: &str, json_wanted: bool) -> Response {
    let (content_type, body) = if json_wanted {
        ("application/json", json!({ "status": text }).to_string())
    } else {
        ("text/plain", text.to_string())
    };
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(body.into())
        .unwrap()
}

pub async fn livez(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (status, text) = if state.is_alive() {
        (StatusCode::OK, "live")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not live")
    };
    respond(status, text, wants_json(&headers))
}

pub async fn readyz(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let app_ready = state.is_ready();
    let signer_ready = state.is_signer_ready();
    let store_ready = state.is_store_ready().await;

    let (status, text) = if app_ready && signer_ready && store_ready {
        (StatusCode::OK, "ready")
    } else {
        tracing::debug!(
            "not ready: app_ready={}, signer_ready={}, store_ready={}",
            app_ready,
            signer_ready,
            store_ready
        );
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    };
    respond(status, text, wants_json(&headers))
}
