//! `GET /auth/analyze` — token introspection diagnostic endpoint. Never
//! gates: always returns 200, even with no credential.
//! Grounded on the `/auth/analyze` fixture in `login_github_test.py`.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde_json::json;

use super::session_lookup::current_session;
use crate::state::AppState;

pub async fn analyze(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some((handle, claims)) = current_session(&state, &jar).await else {
        return Json(json!({ "handle": null, "session": null, "token": null })).into_response();
    };

    let record = match state.store.get_session(&handle).await {
        Ok(Some(r)) => r,
        _ => return Json(json!({ "handle": null, "session": null, "token": null })).into_response(),
    };

    let header_value = jsonwebtoken::decode_header(&record.token).ok();
    let valid = crate::verifier::verify(
        &state.jwks_cache,
        &record.token,
        &[state.config.issuer.iss.clone()],
        &state.config.issuer.aud_default,
    )
    .await
    .is_ok();

    Json(json!({
        "handle": { "key": handle.key, "secret": handle.secret },
        "session": {
            "email": record.email,
            "created_at": record.created_at,
            "expires_on": record.expires_on,
        },
        "token": {
            "header": header_value.map(|h| json!({ "alg": "RS256", "typ": "JWT", "kid": h.kid })),
            "data": claims,
            "valid": valid,
        }
    }))
    .into_response()
}
