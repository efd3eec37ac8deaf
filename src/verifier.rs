//! External ID token verification.
//!
//! Fetches and caches JWKS documents per `(iss, kid)`, validates RS256
//! signatures and standard claims against the set of trusted issuers in
//! configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

const JWKS_TTL: Duration = Duration::from_secs(60 * 60);
const NEGATIVE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token has no kid in its header")]
    NoKid,
    #[error("issuer {0} is not trusted")]
    UnknownIssuer(String),
    #[error("no key {kid} found in JWKS for issuer {iss}")]
    UnknownKid { iss: String, kid: String },
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),
    #[error("token expired")]
    Expired,
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("malformed claims: {0}")]
    MalformedClaims(String),
    #[error("fetching JWKS for {iss} failed: {detail}")]
    FetchFailed { iss: String, detail: String },
}

struct CacheEntry {
    fetched_at: Instant,
    jwks: Option<Value>,
}

/// Single-flight, TTL-bounded JWKS cache keyed by issuer.
pub struct JwksCache {
    http: reqwest::Client,
    entries: Mutex<HashMap<String, Arc<Mutex<Option<CacheEntry>>>>>,
}

impl JwksCache {
    pub fn new(http: reqwest::Client) -> Self {
        JwksCache {
            http,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot_for(&self, iss: &str) -> Arc<Mutex<Option<CacheEntry>>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(iss.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Look up the decoding key for `(iss, kid)`, fetching the JWKS document
    /// if not cached or stale. Concurrent callers for the same issuer share
    /// one in-flight fetch via the per-issuer mutex.
    async fn decoding_key(&self, iss: &str, kid: &str) -> Result<DecodingKey, VerifyError> {
        let slot = self.slot_for(iss).await;
        let mut guard = slot.lock().await;

        let needs_fetch = match guard.as_ref() {
            None => true,
            Some(entry) => {
                let ttl = if entry.jwks.is_some() { JWKS_TTL } else { NEGATIVE_TTL };
                entry.fetched_at.elapsed() > ttl
            }
        };

        if needs_fetch {
            let jwks = self.fetch(iss).await;
            *guard = Some(CacheEntry {
                fetched_at: Instant::now(),
                jwks: jwks.ok(),
            });
        }

        let entry = guard.as_ref().expect("just populated");
        let jwks = entry.jwks.as_ref().ok_or_else(|| VerifyError::FetchFailed {
            iss: iss.to_string(),
            detail: "no JWKS available (cached failure)".to_string(),
        })?;

        find_key(jwks, kid).ok_or_else(|| VerifyError::UnknownKid {
            iss: iss.to_string(),
            kid: kid.to_string(),
        })
    }

    /// Periodic sweep: drops cached entries (positive or negative) whose TTL
    /// has elapsed, so a long-lived deployment doesn't accumulate one stale
    /// negative-cache slot per issuer it has ever rejected.
    pub async fn sweep_expired(&self) {
        let stale: Vec<String> = {
            let entries = self.entries.lock().await;
            let mut stale = Vec::new();
            for (iss, slot) in entries.iter() {
                let guard = slot.lock().await;
                if let Some(entry) = guard.as_ref() {
                    let ttl = if entry.jwks.is_some() { JWKS_TTL } else { NEGATIVE_TTL };
                    if entry.fetched_at.elapsed() > ttl {
                        stale.push(iss.clone());
                    }
                }
            }
            stale
        };

        if stale.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().await;
        for iss in stale {
            entries.remove(&iss);
        }
    }

    async fn fetch(&self, iss: &str) -> Result<Value, VerifyError> {
        let url = format!("{}/.well-known/jwks.json", iss.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| VerifyError::FetchFailed { iss: iss.to_string(), detail: e.to_string() })?;
        resp.json::<Value>()
            .await
            .map_err(|e| VerifyError::FetchFailed { iss: iss.to_string(), detail: e.to_string() })
    }
}

fn find_key(jwks: &Value, kid: &str) -> Option<DecodingKey> {
    let keys = jwks.get("keys")?.as_array()?;
    let jwk = keys
        .iter()
        .find(|k| k.get("kid").and_then(Value::as_str) == Some(kid))?;
    let jwk: jsonwebtoken::jwk::Jwk = serde_json::from_value(jwk.clone()).ok()?;
    DecodingKey::from_jwk(&jwk).ok()
}

/// Peek at a token's header/issuer without verifying the signature. Only
/// ever exposes the bare strings needed for dispatch — never a decoded
/// claim map — so callers cannot accidentally trust an unverified claim
/// (this is a deliberate design choice, not an oversight).
pub fn peek_unverified_header_kid(token: &str) -> Option<String> {
    decode_header(token).ok().and_then(|h| h.kid)
}

pub fn peek_unverified_issuer(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("iss").and_then(Value::as_str).map(str::to_string)
}

/// Verify an external ID token's signature and standard claims against a
/// trusted issuer's JWKS. Returns the decoded claim set on success.
pub async fn verify(
    cache: &JwksCache,
    token: &str,
    trusted_issuers: &[String],
    expected_audience: &str,
) -> Result<Value, VerifyError> {
    let iss = peek_unverified_issuer(token).ok_or_else(|| VerifyError::MalformedClaims("missing iss".into()))?;
    if !trusted_issuers.iter().any(|t| t == &iss) {
        return Err(VerifyError::UnknownIssuer(iss));
    }
    let kid = peek_unverified_header_kid(token).ok_or(VerifyError::NoKid)?;

    let key = cache.decoding_key(&iss, &kid).await?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[expected_audience]);
    validation.set_issuer(&[iss.as_str()]);

    let data = decode::<Value>(token, &key, &validation).map_err(|e| {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => VerifyError::Expired,
            ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
            _ => VerifyError::SignatureInvalid(e.to_string()),
        }
    })?;

    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_unverified_issuer_reads_iss_without_verifying_signature() {
        use base64::Engine as _;
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::json!({"alg":"RS256","kid":"abc"}).to_string());
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::json!({"iss":"https://idp.example.com/"}).to_string());
        let token = format!("{header}.{payload}.sig");
        assert_eq!(peek_unverified_issuer(&token), Some("https://idp.example.com/".to_string()));
        assert_eq!(peek_unverified_header_kid(&token), Some("abc".to_string()));
    }

    #[test]
    fn peek_unverified_issuer_returns_none_for_garbage() {
        assert_eq!(peek_unverified_issuer("not-a-jwt"), None);
    }
}
