//! Symmetric AEAD helpers for session records and the browser session cookie.
//!
//! Session records are encrypted with the handle's own `secret` (never
//! persisted, so possession of the ciphertext alone is not enough to read
//! it back). The browser cookie itself is additionally wrapped with a
//! deployment-wide secret so the handle never appears in plaintext on the
//! wire.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("ciphertext truncated or malformed")]
    Malformed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Expand an arbitrary byte string's secret material into a 32-byte AEAD key
/// via SHA-256, so callers can pass a handle's base64url `secret` (16 raw
/// bytes) directly rather than having to pad it themselves.
fn derive_key(secret: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().into()
}

/// Encrypt `plaintext` under `secret`, prefixing the random nonce to the
/// ciphertext and base64url-encoding the whole thing.
pub fn seal(secret: &[u8], plaintext: &[u8]) -> Result<String, CryptoError> {
    let key_bytes = derive_key(secret);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(out))
}

/// Decrypt a value produced by [`seal`]. Returns `Err` on any failure
/// (truncated payload, base64 error, wrong key, tampered ciphertext) without
/// distinguishing the cause to the caller — callers treat all of these
/// identically per the session-store contract.
pub fn open(secret: &[u8], sealed: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = URL_SAFE_NO_PAD
        .decode(sealed)
        .map_err(|_| CryptoError::Malformed)?;
    if raw.len() < NONCE_LEN {
        return Err(CryptoError::Malformed);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let key_bytes = derive_key(secret);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Load a 32-byte deployment session secret from its base64 (standard,
/// padded or not) textual form, as produced by `generate-session-secret`.
pub fn decode_session_secret(s: &str) -> Result<[u8; 32], CryptoError> {
    let raw = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(s.trim_end_matches('='))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .map_err(|_| CryptoError::Malformed)?;
    if raw.len() != 32 {
        return Err(CryptoError::BadKeyLength(raw.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Generate a fresh 32-byte session secret, base64-encoded (standard,
/// unpadded) for storage in configuration.
pub fn generate_session_secret() -> String {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let secret = b"0123456789abcdef";
        let plaintext = b"{\"token\":\"abc\"}";
        let sealed = seal(secret, plaintext).expect("seal");
        let opened = open(secret, &sealed).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_secret_fails_without_panicking() {
        let sealed = seal(b"correct-secret-1", b"payload").expect("seal");
        let result = open(b"wrong-secret-000", &sealed);
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let secret = b"0123456789abcdef";
        let mut sealed = seal(secret, b"payload").expect("seal");
        sealed.pop();
        sealed.push(if sealed.ends_with('A') { 'B' } else { 'A' });
        assert!(open(secret, &sealed).is_err());
    }

    #[test]
    fn session_secret_round_trips() {
        let secret = generate_session_secret();
        let decoded = decode_session_secret(&secret).expect("decode");
        assert_eq!(decoded.len(), 32);
    }
}
