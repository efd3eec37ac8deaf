//! Shared session-cookie resolution used by the `/auth/tokens*` and
//! `/auth/analyze` handlers.

use axum_extra::extract::CookieJar;
use serde_json::Value;

use crate::handle::Handle;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "gafaelfawr_session";

/// Open the deployment-wide AEAD wrapper placed around the cookie value at
/// login and recover the handle it carries. Any failure — bad base64, wrong
/// key, tampered ciphertext, malformed handle — is folded into `None`.
pub fn decode_session_cookie(session_secret: &[u8], raw: &str) -> Option<Handle> {
    let opened = crate::crypto::open(session_secret, raw).ok()?;
    let encoded = String::from_utf8(opened).ok()?;
    Handle::parse(&encoded).ok()
}

/// Resolve the session cookie into its handle and the unverified claims of
/// the token it stores. Returns `None` on any failure — missing cookie,
/// malformed handle, decrypt failure, or missing session record — callers
/// must not distinguish these (same as `/auth`'s credential lookup).
pub async fn current_session(state: &AppState, jar: &CookieJar) -> Option<(Handle, Value)> {
    let raw = jar.get(SESSION_COOKIE)?.value().to_string();
    let session_secret = crate::crypto::decode_session_secret(&state.config.session.session_secret).ok()?;
    let handle = decode_session_cookie(&session_secret, &raw)?;
    let record = state.store.get_session(&handle).await.ok()??;

    let mut parts = record.token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    Some((handle, claims))
}
