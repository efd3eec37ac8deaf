//! `/.well-known/jwks.json` and `/.well-known/openid-configuration`.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

pub async fn jwks(State(state): State<Arc<AppState>>) -> Response {
    Json(state.signer.jwks()).into_response()
}

pub async fn openid_configuration(State(state): State<Arc<AppState>>) -> Response {
    let issuer = &state.config.issuer.iss;
    let doc = crate::signing::discovery_document(
        issuer,
        &format!("{}/login", issuer.trim_end_matches('/')),
        &format!("{}/auth/tokens/new", issuer.trim_end_matches('/')),
        &["read:all".to_string(), "exec:admin".to_string()],
    );
    Json(doc).into_response()
}
