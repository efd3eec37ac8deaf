//! Row-level models for the three key families of the key-value layout,
//! realized as SQLite tables.

use serde::{Deserialize, Serialize};

/// A session record bound to a handle:
/// `{token, email, created_at, expires_on, csrf_token}`. `csrf_token` is a
/// 32-byte random value minted alongside the session and checked against
/// `_csrf` on every mutating `/auth/tokens*` request bound to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub token: String,
    pub email: Option<String>,
    pub created_at: i64,
    pub expires_on: i64,
    pub csrf_token: String,
}

impl SessionRecord {
    pub fn new(token: impl Into<String>, email: Option<String>, created_at: i64, expires_on: i64) -> Self {
        SessionRecord {
            token: token.into(),
            email,
            created_at,
            expires_on,
            csrf_token: crate::handle::random_urlsafe(32),
        }
    }
}

/// One entry in a user's token index: `{handle.key, scope, created, expires}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenIndexEntry {
    pub handle_key: String,
    pub scope: String,
    pub created: i64,
    pub expires: i64,
}

/// Transient login state keyed by the OAuth `state` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginState {
    pub return_url: String,
    pub pkce_verifier: Option<String>,
    pub created_at: i64,
}
