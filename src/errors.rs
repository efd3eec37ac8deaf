use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Token signing misconfigured: {0}")]
    SigningMisconfigured(String),

    #[error("Key/Cert mismatch: {0}")]
    KeyCertMismatch(String),

    #[error("Other startup error: {0}")]
    Other(String),
}

/// The request-time failure kinds, each mapped to the status
/// code and headers `/auth` must return. Internal causes are logged but
/// never placed in the response body.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    NoCredential { realm: String, scheme: String },

    #[error("credential verification failed: {detail}")]
    VerificationFailed { realm: String, scheme: String, detail: String },

    #[error("credential does not satisfy required scopes")]
    InsufficientScope { accepted: String, satisfy: String, token_scopes: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthError::NoCredential { .. } => {
                (StatusCode::UNAUTHORIZED, "no_credential", "No Authorization header".to_string())
            }
            AuthError::VerificationFailed { .. } => {
                (StatusCode::UNAUTHORIZED, "verification_failed", "invalid or expired credential".to_string())
            }
            AuthError::InsufficientScope { .. } => {
                (StatusCode::FORBIDDEN, "insufficient_scope", self.to_string())
            }
            AuthError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "session store unavailable".to_string())
            }
            AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error".to_string())
            }
        };

        let mut response = (status, Json(json!({ "code": code, "message": message }))).into_response();

        match &self {
            AuthError::NoCredential { realm, scheme } => {
                let value = format!(
                    "{scheme} realm=\"{realm}\",error=\"No Authorization header\",error_description=\"\""
                );
                if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
                    response.headers_mut().insert(axum::http::header::WWW_AUTHENTICATE, v);
                }
            }
            AuthError::VerificationFailed { realm, scheme, .. } => {
                let value = format!(
                    "{scheme} realm=\"{realm}\",error=\"invalid_token\",error_description=\"credential verification failed\""
                );
                if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
                    response.headers_mut().insert(axum::http::header::WWW_AUTHENTICATE, v);
                }
            }
            AuthError::InsufficientScope { accepted, satisfy, token_scopes } => {
                if let Ok(v) = axum::http::HeaderValue::from_str(accepted) {
                    response.headers_mut().insert("X-Auth-Request-Scopes-Accepted", v);
                }
                if let Ok(v) = axum::http::HeaderValue::from_str(satisfy) {
                    response.headers_mut().insert("X-Auth-Request-Scopes-Satisfy", v);
                }
                if let Ok(v) = axum::http::HeaderValue::from_str(token_scopes) {
                    response.headers_mut().insert("X-Auth-Request-Token-Scopes", v);
                }
            }
            AuthError::StoreUnavailable(_) | AuthError::Internal(_) => {}
        }

        response
    }
}
