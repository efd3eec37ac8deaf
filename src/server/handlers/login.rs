//! `GET /login`, its OAuth callback, and `GET /logout`.
//!
//! Grounded on the GitHub round trip in `login_github_test.py`: the first
//! request (no `code`) redirects to the provider with a CSRF `state`; the
//! second (with `code` and `state`) exchanges the code, mints an internal
//! token, stores the session under a fresh handle, sets the session cookie,
//! and redirects back to the original `rd=` return URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};

use crate::issuer::ClaimSet;
use crate::state::{AppState, Provider};
use crate::store::{LoginState, SessionRecord};

const SESSION_COOKIE: &str = "gafaelfawr_session";
const STATE_TTL_SECONDS: i64 = 600;

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Resolve the return URL a caller ends up at after login: `?rd=`, then the
/// `X-Auth-Request-Redirect` header nginx sets on the original request, then
/// `Referer` as a last resort.
fn resolve_return_url(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(rd) = params.get("rd").filter(|s| !s.is_empty()) {
        return Some(rd.clone());
    }
    if let Some(v) = headers.get("X-Auth-Request-Redirect").and_then(|v| v.to_str().ok()) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(v) = headers.get(axum::http::header::REFERER).and_then(|v| v.to_str().ok()) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    None
}

/// Reject open redirects: an absolute URL must point at the requesting host
/// or a configured allowed host; a relative URL must be path-absolute
/// (`/foo`), never protocol-relative (`//evil.com/foo`, which browsers treat
/// as absolute).
fn validate_return_url(raw: &str, request_host: Option<&str>, allowed_hosts: &[String]) -> bool {
    if raw.is_empty() {
        return false;
    }
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let Some(host) = parsed.host_str() else { return false };
            request_host.is_some_and(|h| h.eq_ignore_ascii_case(host))
                || allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        }
        Err(_) => raw.starts_with('/') && !raw.starts_with("//"),
    }
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    if let (Some(code), Some(csrf_state)) = (params.get("code"), params.get("state")) {
        return callback(&state, code, csrf_state, jar).await;
    }

    let Some(return_url) = resolve_return_url(&params, &headers) else {
        return (StatusCode::BAD_REQUEST, "no return URL given").into_response();
    };
    let request_host = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok());
    if !validate_return_url(&return_url, request_host, &state.config.auth.allowed_hosts) {
        return (StatusCode::BAD_REQUEST, "return URL not allowed").into_response();
    }

    start_login(&state, return_url).await
}

async fn start_login(state: &AppState, return_url: String) -> Response {
    match &state.provider {
        Provider::Github(provider) => {
            let csrf_state = crate::handle::random_urlsafe(16);
            let login_state = LoginState { return_url, pkce_verifier: None, created_at: now() };
            if state
                .store
                .put_login_state(&csrf_state, login_state, STATE_TTL_SECONDS, now())
                .await
                .is_err()
            {
                return (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable").into_response();
            }
            Redirect::to(&provider.authorization_url(&csrf_state)).into_response()
        }
        Provider::Oidc(provider) => {
            let pending = provider.authorize();
            let login_state = LoginState {
                return_url,
                pkce_verifier: Some(pending.pkce_verifier),
                created_at: now(),
            };
            if state
                .store
                .put_login_state(&pending.csrf_state, login_state, STATE_TTL_SECONDS, now())
                .await
                .is_err()
            {
                return (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable").into_response();
            }
            Redirect::to(&pending.url).into_response()
        }
    }
}

async fn callback(state: &AppState, code: &str, csrf_state: &str, jar: CookieJar) -> Response {
    let login_state = match state.store.take_login_state(csrf_state, now()).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::BAD_REQUEST, "unknown or expired login state").into_response(),
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    let identity = match &state.provider {
        Provider::Github(provider) => provider.exchange_and_resolve(code).await,
        Provider::Oidc(provider) => {
            provider
                .exchange_and_resolve(code.to_string(), login_state.pkce_verifier.clone().unwrap_or_default())
                .await
        }
    };

    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => return (StatusCode::BAD_GATEWAY, format!("provider exchange failed: {e}")).into_response(),
    };

    let handle = crate::handle::Handle::new();
    let now_ts = now();
    let exp = now_ts + state.config.session.session_ttl_seconds;

    let claims = ClaimSet {
        sub: identity.subject.clone(),
        iss: state.config.issuer.iss.clone(),
        aud: state.config.issuer.aud_default.clone(),
        jti: handle.key.clone(),
        scope: String::new(),
        iat: now_ts,
        exp,
        email: identity.email.clone(),
        uid: identity.uid.clone(),
        uid_number: identity.uid_number.clone(),
        name: identity.name.clone(),
        is_member_of: identity.groups_as_claim(),
        act: None,
        act_nested: None,
    };

    let signed = match crate::issuer::issue(&state.signer, &claims) {
        Ok(token) => token,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("signing failed: {e}")).into_response(),
    };

    let record = SessionRecord::new(signed, identity.email, now_ts, exp);
    if state.store.store_session(&handle, record, now_ts).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable").into_response();
    }
    crate::metrics::record_token_issued("login");

    let session_secret = match crate::crypto::decode_session_secret(&state.config.session.session_secret) {
        Ok(s) => s,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("bad session secret: {e}")).into_response(),
    };
    let sealed = match crate::crypto::seal(&session_secret, handle.encode().as_bytes()) {
        Ok(s) => s,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("sealing session cookie failed: {e}")).into_response(),
    };

    let mut cookie = Cookie::new(SESSION_COOKIE, sealed);
    cookie.set_http_only(true);
    cookie.set_secure(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");

    let jar = jar.add(cookie);
    let return_url = if login_state.return_url.is_empty() { "/".to_string() } else { login_state.return_url };
    (jar, Redirect::to(&return_url)).into_response()
}

pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let mut cookie = Cookie::new(SESSION_COOKIE, "");
    cookie.set_path("/");
    cookie.make_removal();
    let redirect_url = state.config.auth.after_logout_url.clone().unwrap_or_else(|| "/".to_string());
    (jar.add(cookie), Redirect::to(&redirect_url)).into_response()
}
