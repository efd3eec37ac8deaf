//! `/auth/tokens*` — user-minted child token management.
//!
//! Grounded on `tokens.py`: `post_tokens_new` builds a claim set from the
//! requested scope plus the caller's own identity fields and pipelines the
//! session-store write with the user-token-index write; `post_delete_token`
//! requires the `DELETE` method and revokes both records together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};

use crate::authz;
use crate::issuer::ClaimSet;
use crate::store::{SessionRecord, TokenIndexEntry};

use super::session_lookup::current_session;
use crate::state::AppState;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

#[derive(Debug, Serialize)]
pub struct TokenSummary {
    pub handle_key: String,
    pub scope: String,
    pub created: i64,
    pub expires: i64,
}

#[derive(Debug, Deserialize)]
pub struct NewTokenRequest {
    pub scope: String,
    #[serde(rename = "_csrf")]
    pub csrf: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteTokenRequest {
    #[serde(rename = "method_")]
    pub method: String,
    #[serde(rename = "_csrf")]
    pub csrf: String,
}

/// `GET /auth/tokens` — list the caller's user-minted tokens, alongside the
/// CSRF token each mutating request against them must echo back.
pub async fn list_tokens(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some((handle, claims)) = current_session(&state, &jar).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(uid) = claims.get("sub").and_then(|v| v.as_str()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.store.expire_tokens(uid, now()).await {
        Ok(_) => {}
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }

    let entries = match state.store.get_all_tokens(uid).await {
        Ok(entries) => entries,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let csrf_token = match state.store.get_session(&handle).await {
        Ok(Some(record)) => record.csrf_token,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    Json(serde_json::json!({
        "tokens": entries
            .into_iter()
            .map(|e| TokenSummary { handle_key: e.handle_key, scope: e.scope, created: e.created, expires: e.expires })
            .collect::<Vec<_>>(),
        "csrf_token": csrf_token,
    }))
    .into_response()
}

/// `GET /auth/tokens/new` — the scopes the caller may delegate (their own
/// held scopes intersected with the deployment's known scope catalog) plus a
/// CSRF token for the following `POST`.
pub async fn new_token_form(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some((handle, claims)) = current_session(&state, &jar).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let held = authz::parse_scopes(claims.get("scope").and_then(|v| v.as_str()).unwrap_or(""));
    let known: BTreeSet<String> = state.config.auth.known_scopes.iter().cloned().collect();
    let available: Vec<&String> = known.intersection(&held).collect();

    let csrf_token = match state.store.get_session(&handle).await {
        Ok(Some(record)) => record.csrf_token,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    Json(serde_json::json!({ "available_scopes": available, "csrf_token": csrf_token })).into_response()
}

/// `POST /auth/tokens/new` — mint a new user token scoped to the requested
/// scopes that the caller actually holds.
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<NewTokenRequest>,
) -> Response {
    let Some((handle, claims)) = current_session(&state, &jar).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let record = match state.store.get_session(&handle).await {
        Ok(Some(record)) => record,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    if req.csrf != record.csrf_token {
        return (StatusCode::BAD_REQUEST, "invalid CSRF token").into_response();
    }

    let uid = claims.get("sub").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let held = authz::parse_scopes(claims.get("scope").and_then(|v| v.as_str()).unwrap_or(""));
    let requested = authz::parse_scopes(&req.scope);
    let granted: Vec<String> = requested.intersection(&held).cloned().collect();
    let scope = granted.join(",");

    let new_handle = crate::handle::Handle::new();
    let now_ts = now();
    let exp = now_ts + state.config.session.user_token_ttl_seconds;

    let new_claims = ClaimSet {
        sub: uid.clone(),
        iss: state.config.issuer.iss.clone(),
        aud: state.config.issuer.aud_default.clone(),
        jti: new_handle.key.clone(),
        scope: scope.clone(),
        iat: now_ts,
        exp,
        email: claims.get("email").and_then(|v| v.as_str()).map(str::to_string),
        uid: claims.get("uid").and_then(|v| v.as_str()).map(str::to_string),
        uid_number: claims.get("uidNumber").and_then(|v| v.as_str()).map(str::to_string),
        name: claims.get("name").and_then(|v| v.as_str()).map(str::to_string),
        is_member_of: None,
        act: None,
        act_nested: None,
    };

    let signed = match crate::issuer::issue(&state.signer, &new_claims) {
        Ok(token) => token,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let new_record = SessionRecord::new(signed.clone(), new_claims.email.clone(), now_ts, exp);
    let entry = TokenIndexEntry { handle_key: new_handle.key.clone(), scope, created: now_ts, expires: exp };

    match state.store.issue_and_index(&uid, &new_handle, new_record, entry).await {
        Ok(()) => {
            crate::metrics::record_token_issued("user_token");
            Json(serde_json::json!({ "token": format!("{}.{}", new_handle.key, new_handle.secret) })).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// `GET /auth/tokens/{handle_key}` — 404 on a miss, per the linear-scan
/// `get_token_by_handle` ground truth.
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(handle_key): Path<String>,
) -> Response {
    let Some((_, claims)) = current_session(&state, &jar).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(uid) = claims.get("sub").and_then(|v| v.as_str()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.store.get_all_tokens(uid).await {
        Ok(entries) => match entries.into_iter().find(|e| e.handle_key == handle_key) {
            Some(entry) => Json(TokenSummary {
                handle_key: entry.handle_key,
                scope: entry.scope,
                created: entry.created,
                expires: entry.expires,
            })
            .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// `POST /auth/tokens/{handle_key}` — revokes the index entry and its
/// backing session record together. Browsers can't issue `DELETE` from a
/// plain form, so the method is carried in the body (`method_=DELETE`)
/// alongside the CSRF token, per `post_delete_token`.
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(handle_key): Path<String>,
    Json(req): Json<DeleteTokenRequest>,
) -> Response {
    if req.method != "DELETE" {
        return (StatusCode::BAD_REQUEST, "method_ must be DELETE").into_response();
    }

    let Some((handle, claims)) = current_session(&state, &jar).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let record = match state.store.get_session(&handle).await {
        Ok(Some(record)) => record,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    if req.csrf != record.csrf_token {
        return (StatusCode::BAD_REQUEST, "invalid CSRF token").into_response();
    }
    let Some(uid) = claims.get("sub").and_then(|v| v.as_str()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.store.revoke_token(uid, &handle_key).await {
        Ok(true) => StatusCode::SEE_OTHER.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
