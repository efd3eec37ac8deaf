//! Opaque session handles.
//!
//! A handle is a `(key, secret)` pair: `key` addresses the session record in
//! the store, `secret` is never persisted and is the only thing that can
//! decrypt the record once retrieved. The external representation travels in
//! cookies and in the body of freshly-minted user tokens, so it must be easy
//! to copy-paste and free of characters that need escaping in a cookie value.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use thiserror::Error;

const PART_BYTES: usize = 16;
const PART_CHARS: usize = 22; // 16 bytes, base64url-no-pad

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("malformed handle")]
    Malformed,
}

/// An opaque `(key, secret)` session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub key: String,
    pub secret: String,
}

impl Handle {
    /// Draw a fresh handle from the process CSPRNG.
    pub fn new() -> Self {
        Handle {
            key: random_urlsafe(PART_BYTES),
            secret: random_urlsafe(PART_BYTES),
        }
    }

    /// Build a handle from an already-known key, drawing a fresh secret.
    ///
    /// Used when the storage key is externally fixed (e.g. a legacy ticket's
    /// key portion, or a handle derived from an existing `jti`).
    pub fn with_key(key: impl Into<String>) -> Self {
        Handle {
            key: key.into(),
            secret: random_urlsafe(PART_BYTES),
        }
    }

    /// External representation: `"<key>.<secret>"`.
    pub fn encode(&self) -> String {
        format!("{}.{}", self.key, self.secret)
    }

    /// The key the value is stored at in the session store: `session:<key>`.
    pub fn storage_key(&self) -> String {
        format!("session:{}", self.key)
    }

    /// Parse the `"<key>.<secret>"` form. Rejects anything that does not
    /// match `^[A-Za-z0-9_-]{22}\.[A-Za-z0-9_-]{22}$`.
    pub fn parse(s: &str) -> Result<Self, HandleError> {
        let (key, secret) = s.split_once('.').ok_or(HandleError::Malformed)?;
        if key.len() != PART_CHARS || secret.len() != PART_CHARS {
            return Err(HandleError::Malformed);
        }
        if !is_urlsafe_b64(key) || !is_urlsafe_b64(secret) {
            return Err(HandleError::Malformed);
        }
        Ok(Handle {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Parse a legacy oauth2_proxy ticket: `"<prefix>-<key>.<secret>"`. The
    /// `prefix` is configuration-fixed; only the `key` portion feeds the
    /// JWT's `jti` on ingress exchange.
    pub fn parse_ticket(s: &str, prefix: &str) -> Result<Self, HandleError> {
        let rest = s
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('-'))
            .ok_or(HandleError::Malformed)?;
        Self::parse(rest)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

fn is_urlsafe_b64(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Draw `n` random bytes and base64url-encode them without padding.
pub fn random_urlsafe(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_and_parse() {
        let h = Handle::new();
        let encoded = h.encode();
        assert_eq!(encoded.len(), PART_CHARS * 2 + 1);
        let parsed = Handle::parse(&encoded).expect("valid handle");
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!(Handle::parse(""), Err(HandleError::Malformed));
        assert_eq!(Handle::parse("nodothere"), Err(HandleError::Malformed));
        assert_eq!(
            Handle::parse("short.short"),
            Err(HandleError::Malformed)
        );
        let mut too_long = "a".repeat(22);
        too_long.push('.');
        too_long.push_str(&"a".repeat(23));
        assert_eq!(Handle::parse(&too_long), Err(HandleError::Malformed));
    }

    #[test]
    fn rejects_non_urlsafe_characters() {
        let key = "a".repeat(22);
        let secret = "b".repeat(21) + "+";
        let s = format!("{key}.{secret}");
        assert_eq!(Handle::parse(&s), Err(HandleError::Malformed));
    }

    #[test]
    fn parses_legacy_ticket_form() {
        let h = Handle::new();
        let ticket = format!("oauth2_proxy-{}", h.encode());
        let parsed = Handle::parse_ticket(&ticket, "oauth2_proxy").expect("valid ticket");
        assert_eq!(parsed, h);
    }

    #[test]
    fn two_handles_never_collide_in_practice() {
        let a = Handle::new();
        let b = Handle::new();
        assert_ne!(a.key, b.key);
        assert_ne!(a.secret, b.secret);
    }
}
