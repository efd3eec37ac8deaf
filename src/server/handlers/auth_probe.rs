//! `GET /auth` — the nginx `auth_request` probe.
//!
//! Grounded directly on the Flask `/auth` route: find a credential, verify
//! it, authorize it against the requested scopes, and always set the
//! `X-Auth-Request-*` capability headers regardless of outcome so the
//! caller can see what was required even on a 403.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use super::session_lookup;
use crate::authz::{self, Satisfy};
use crate::errors::AuthError;
use crate::handle::Handle;
use crate::issuer;
use crate::reissue::{self, ReissueKind};
use crate::state::AppState;

const SESSION_COOKIE: &str = "gafaelfawr_session";

/// A notebook spawner asks for this fixed scope set via `notebook=true`
/// rather than spelling out `scope=` itself.
const NOTEBOOK_SCOPES: &[&str] = &["exec:notebook"];

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Where the bearer credential for this request came from.
enum Credential {
    Token(String),
    Cookie(String),
}

/// Parse a raw query string into a multi-map, preserving repeated keys —
/// `axum::extract::Query<HashMap<String, String>>` collapses
/// `?scope=a&scope=b` to its last value, which breaks the repeatable
/// `scope=`/`capability=` contract.
fn parse_query_multimap(raw: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(raw) = raw {
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            map.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    map
}

fn first<'a>(params: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.first()).map(String::as_str)
}

/// Decode an `Authorization: Basic <b64>` value into the bearer token it
/// carries. The decoded pair is `token:x-oauth-basic` or
/// `x-oauth-basic:token` — the sentinel may sit in either half.
fn parse_basic_credential(b64: &str) -> Option<String> {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD.decode(b64.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (first, second) = text.split_once(':')?;
    if first.eq_ignore_ascii_case("x-oauth-basic") {
        Some(second.to_string())
    } else if second.eq_ignore_ascii_case("x-oauth-basic") {
        Some(first.to_string())
    } else {
        None
    }
}

/// Finds the request's credential per the extraction order: `Authorization:
/// Bearer`, `Authorization: Basic` (oauth2_proxy sentinel form),
/// `X-Forwarded-Access-Token`, `X-Forwarded-Ticket-Id-Token`, the session
/// cookie, then (opt-in) `X-Orig-Authorization`. The session cookie jumps
/// the queue ahead of `Authorization` when the latter's scheme is literally
/// `token` — a JupyterHub interop requirement.
fn find_credential(headers: &HeaderMap, jar: &CookieJar, honor_x_orig: bool) -> Option<Credential> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());

    if let Some(auth) = auth_header
        && let Some((scheme, _)) = auth.split_once(' ')
        && scheme.eq_ignore_ascii_case("token")
        && let Some(cookie) = cookie.clone()
    {
        return Some(Credential::Cookie(cookie));
    }

    if let Some(auth) = auth_header {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(Credential::Token(token.to_string()));
        }
        if let Some(b64) = auth.strip_prefix("Basic ")
            && let Some(token) = parse_basic_credential(b64)
        {
            return Some(Credential::Token(token));
        }
    }

    if let Some(v) = headers.get("X-Forwarded-Access-Token").and_then(|v| v.to_str().ok()) {
        return Some(Credential::Token(v.to_string()));
    }
    if let Some(v) = headers.get("X-Forwarded-Ticket-Id-Token").and_then(|v| v.to_str().ok()) {
        return Some(Credential::Token(v.to_string()));
    }
    if let Some(cookie) = cookie {
        return Some(Credential::Cookie(cookie));
    }
    if honor_x_orig
        && let Some(v) = headers.get("X-Orig-Authorization").and_then(|v| v.to_str().ok())
        && let Some(token) = v.strip_prefix("Bearer ")
    {
        return Some(Credential::Token(token.to_string()));
    }
    None
}

pub async fn auth(State(state): State<Arc<AppState>>, RawQuery(raw_query): RawQuery, headers: HeaderMap, jar: CookieJar) -> Response {
    let started = Instant::now();
    let params = parse_query_multimap(raw_query.as_deref());
    let result = auth_inner(&state, &params, &headers, &jar).await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(AuthError::NoCredential { .. }) => "no_credential",
        Err(AuthError::VerificationFailed { .. }) => "verification_failed",
        Err(AuthError::InsufficientScope { .. }) => "insufficient_scope",
        Err(AuthError::StoreUnavailable(_)) => "store_unavailable",
        Err(AuthError::Internal(_)) => "internal_error",
    };
    crate::metrics::record_auth_request(outcome, started.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn auth_inner(
    state: &AppState,
    params: &HashMap<String, Vec<String>>,
    headers: &HeaderMap,
    jar: &CookieJar,
) -> Result<Response, AuthError> {
    let realm = state.config.auth.realm.clone();
    let scheme = state.config.auth.www_authenticate_scheme.clone();

    let mut required_scopes: BTreeSet<String> = BTreeSet::new();
    for key in ["scope", "capability"] {
        if let Some(values) = params.get(key) {
            for v in values {
                required_scopes.extend(authz::parse_scopes(v));
            }
        }
    }
    if first(params, "notebook").map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false) {
        required_scopes.extend(NOTEBOOK_SCOPES.iter().map(|s| s.to_string()));
    }

    let satisfy = first(params, "satisfy")
        .map(Satisfy::parse)
        .unwrap_or(Satisfy::parse(&state.config.auth.default_satisfy));

    let ticket_prefix = state.config.auth.ticket_prefix.clone();
    let ticket_raw = jar.get(ticket_prefix.as_str()).map(|c| c.value().to_string());
    let ticket = ticket_raw.as_deref().and_then(|raw| Handle::parse_ticket(raw, &ticket_prefix).ok());

    let credential = find_credential(headers, jar, state.config.auth.honor_x_orig_authorization);

    let (claims, encoded_token) = match credential {
        Some(Credential::Token(token)) => {
            let claims = crate::verifier::verify(
                &state.jwks_cache,
                &token,
                &state.config.auth.trusted_issuers,
                &state.config.issuer.aud_default,
            )
            .await
            .map_err(|e| AuthError::VerificationFailed { realm: realm.clone(), scheme: scheme.clone(), detail: e.to_string() })?;
            (claims, token)
        }
        Some(Credential::Cookie(raw)) => {
            let session_secret = crate::crypto::decode_session_secret(&state.config.session.session_secret)
                .map_err(|_| AuthError::Internal("malformed session secret".to_string()))?;
            let handle = session_lookup::decode_session_cookie(&session_secret, &raw)
                .ok_or_else(|| AuthError::NoCredential { realm: realm.clone(), scheme: scheme.clone() })?;
            let record = state
                .store
                .get_session(&handle)
                .await
                .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?
                .ok_or_else(|| AuthError::NoCredential { realm: realm.clone(), scheme: scheme.clone() })?;

            let claims_value: serde_json::Value = {
                let mut parts = record.token.split('.');
                let _h = parts.next();
                let payload = parts.next().ok_or_else(|| AuthError::VerificationFailed {
                    realm: realm.clone(),
                    scheme: scheme.clone(),
                    detail: "malformed token".to_string(),
                })?;
                let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload).map_err(|e| {
                    AuthError::VerificationFailed { realm: realm.clone(), scheme: scheme.clone(), detail: e.to_string() }
                })?;
                serde_json::from_slice(&bytes).map_err(|e| AuthError::VerificationFailed {
                    realm: realm.clone(),
                    scheme: scheme.clone(),
                    detail: e.to_string(),
                })?
            };
            (claims_value, record.token)
        }
        None => return Err(AuthError::NoCredential { realm, scheme }),
    };

    let token_scope_str = claims.get("scope").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let token_scopes = authz::parse_scopes(&token_scope_str);

    let mut response = axum::response::Response::builder();
    let headers_mut = response.headers_mut().expect("builder has headers");
    headers_mut.insert("X-Auth-Request-Token-Scopes", HeaderValue::from_str(&token_scope_str).unwrap());
    headers_mut.insert(
        "X-Auth-Request-Scopes-Accepted",
        HeaderValue::from_str(&required_scopes.iter().cloned().collect::<Vec<_>>().join(" ")).unwrap(),
    );
    headers_mut.insert("X-Auth-Request-Scopes-Satisfy", HeaderValue::from_static(satisfy.as_str()));

    if !authz::satisfies(&required_scopes, &token_scopes, satisfy) {
        return Err(AuthError::InsufficientScope {
            accepted: required_scopes.iter().cloned().collect::<Vec<_>>().join(" "),
            satisfy: satisfy.as_str().to_string(),
            token_scopes: token_scope_str,
        });
    }

    if let Some(email) = claims.get("email").and_then(|v| v.as_str()) {
        headers_mut.insert("X-Auth-Request-Email", HeaderValue::from_str(email).unwrap());
    }
    if let Some(uid) = claims.get(&state.config.auth.username_claim).and_then(|v| v.as_str()) {
        headers_mut.insert("X-Auth-Request-User", HeaderValue::from_str(uid).unwrap());
    }
    if let Some(uid_number) = claims.get(&state.config.auth.uid_claim).and_then(|v| v.as_str()) {
        headers_mut.insert("X-Auth-Request-Uid", HeaderValue::from_str(uid_number).unwrap());
    }
    if let Some(groups) = claims.get("isMemberOf").and_then(|v| v.as_array()) {
        let names: Vec<&str> = groups.iter().filter_map(|g| g.get("name").and_then(|n| n.as_str())).collect();
        if !names.is_empty() {
            headers_mut.insert("X-Auth-Request-Groups", HeaderValue::from_str(&names.join(",")).unwrap());
        }
    }

    let reissue_requested = first(params, "reissue_token").map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false);
    let audience_requested = params.contains_key("audience");
    let final_token = if reissue_requested || audience_requested {
        match maybe_reissue(state, &claims, params, ticket.as_ref()).await {
            Some(token) => token,
            None => encoded_token,
        }
    } else {
        encoded_token
    };
    headers_mut.insert("X-Auth-Request-Token", HeaderValue::from_str(&final_token).unwrap());
    headers_mut.insert(
        "X-Auth-Request-Token-Ticket",
        HeaderValue::from_str(ticket_raw.as_deref().unwrap_or("")).unwrap_or(HeaderValue::from_static("")),
    );

    Ok(response.status(200).body(axum::body::Body::empty()).unwrap())
}

async fn maybe_reissue(
    state: &AppState,
    claims: &serde_json::Value,
    params: &HashMap<String, Vec<String>>,
    ticket: Option<&Handle>,
) -> Option<String> {
    let token_iss = claims.get("iss")?.as_str()?;
    let token_aud = claims.get("aud")?.as_str()?;
    let kind = reissue::classify(
        token_iss,
        token_aud,
        &state.config.issuer.iss,
        &state.config.issuer.aud_default,
        &state.config.issuer.aud_internal,
        first(params, "audience"),
        ticket.is_some(),
    )?;

    let new_handle = match kind {
        ReissueKind::IngressExchange => Handle::with_key(ticket?.key.clone()),
        ReissueKind::InternalAudienceExchange => Handle::new(),
    };
    let now_ts = now();
    let exp = now_ts + state.config.session.user_token_ttl_seconds;
    let new_claims = reissue::build_reissued_claims(
        kind,
        claims,
        new_handle.key.clone(),
        &state.config.issuer.iss,
        &state.config.issuer.aud_default,
        &state.config.issuer.aud_internal,
        now_ts,
        exp,
    );
    let signed = issuer::issue(&state.signer, &new_claims).ok()?;

    let record = crate::store::SessionRecord::new(signed.clone(), new_claims.email.clone(), now_ts, exp);
    let _ = state.store.store_session(&new_handle, record, now_ts).await;
    crate::metrics::record_token_issued("reissue");

    Some(signed)
}
