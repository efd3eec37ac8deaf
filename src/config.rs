//! Deployment configuration.
//!
//! Loaded from a YAML file with `#[serde(deny_unknown_fields)]` so a typo
//! in an operator's config fails fast at startup rather than being silently
//! ignored. Secrets are never read from the file: they come from
//! environment variables so they don't end up checked into a config repo.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::StartupError;

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_session_ttl_seconds() -> i64 {
    14 * 24 * 60 * 60
}

fn default_token_ttl_seconds() -> i64 {
    365 * 24 * 60 * 60
}

fn default_scopes_satisfy() -> String {
    "all".to_string()
}

fn default_username_claim() -> String {
    "uid".to_string()
}

fn default_uid_claim() -> String {
    "uidNumber".to_string()
}

fn default_realm() -> String {
    "gafaelfawr".to_string()
}

fn default_www_authenticate_scheme() -> String {
    "Bearer".to_string()
}

fn default_ticket_prefix() -> String {
    "oauth2_proxy".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerConfig {
    /// This deployment's own issuer URL (`iss` on tokens it signs).
    pub iss: String,
    /// Default audience for tokens minted at login.
    pub aud_default: String,
    /// Audience used for internal-service exchange.
    pub aud_internal: String,
    /// Path to the RSA private key PEM used to sign tokens. The path itself
    /// is configuration; the key material is read from disk at startup, not
    /// embedded in the config file.
    pub signing_key_path: String,
    /// Optional matching certificate, verified against the key at startup.
    pub signing_cert_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: i64,
    #[serde(default = "default_token_ttl_seconds")]
    pub user_token_ttl_seconds: i64,
    /// Set from `GAFAELFAWR_SESSION_SECRET` at startup; never persisted in
    /// the config file.
    #[serde(skip)]
    pub session_secret: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_ttl_seconds: default_session_ttl_seconds(),
            user_token_ttl_seconds: default_token_ttl_seconds(),
            session_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Github {
        client_id: String,
        #[serde(skip)]
        client_secret: String,
    },
    Oidc {
        issuer_url: String,
        client_id: String,
        #[serde(skip)]
        client_secret: String,
        redirect_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Trusted issuers for externally-presented bearer tokens.
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    #[serde(default = "default_scopes_satisfy")]
    pub default_satisfy: String,
    /// Whether `X-Orig-Authorization` is honored as a token source. Off by
    /// default: an ingress can be misconfigured to forward an arbitrary
    /// client header under this name, and turning it on should be an
    /// explicit, audited decision.
    #[serde(default)]
    pub honor_x_orig_authorization: bool,
    /// Upstream group name to scope-list mapping, consulted when a token is
    /// minted from group membership rather than an explicit scope request.
    #[serde(default)]
    pub group_mapping: std::collections::HashMap<String, Vec<String>>,
    /// Scopes an operator has declared as delegable; the user-token
    /// scope-picker only ever offers the intersection of this set and the
    /// caller's own held scopes.
    #[serde(default)]
    pub known_scopes: Vec<String>,
    /// Claim name carrying the value set on `X-Auth-Request-User`.
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    /// Claim name carrying the value set on `X-Auth-Request-Uid`.
    #[serde(default = "default_uid_claim")]
    pub uid_claim: String,
    /// Realm advertised in `WWW-Authenticate` on 401 responses.
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Auth scheme advertised in `WWW-Authenticate` on 401 responses.
    #[serde(default = "default_www_authenticate_scheme")]
    pub www_authenticate_scheme: String,
    /// Where `/logout` redirects once the session cookie is cleared. Falls
    /// back to `/` when unset.
    #[serde(default)]
    pub after_logout_url: Option<String>,
    /// Hosts a `/login?rd=` (or its header fallbacks) may redirect to, in
    /// addition to the requesting host itself. Guards against open redirect.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Cookie name and ticket prefix for the legacy oauth2_proxy ticket form.
    #[serde(default = "default_ticket_prefix")]
    pub ticket_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            trusted_issuers: Vec::new(),
            default_satisfy: default_scopes_satisfy(),
            honor_x_orig_authorization: false,
            group_mapping: std::collections::HashMap::new(),
            known_scopes: Vec::new(),
            username_claim: default_username_claim(),
            uid_claim: default_uid_claim(),
            realm: default_realm(),
            www_authenticate_scheme: default_www_authenticate_scheme(),
            after_logout_url: None,
            allowed_hosts: Vec::new(),
            ticket_prefix: default_ticket_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GafaelfawrConfig {
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl GafaelfawrConfig {
    /// Load from `path`, layering in secrets from the environment. Unknown
    /// keys in the YAML file are a startup error, not a warning.
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StartupError::ConfigError(format!("reading {}: {e}", path.display())))?;

        let mut config: GafaelfawrConfig = serde_yaml_ng::from_str(&contents)
            .map_err(|e| StartupError::ConfigError(format!("parsing {}: {e}", path.display())))?;

        config.session.session_secret = std::env::var("GAFAELFAWR_SESSION_SECRET").map_err(|_| {
            StartupError::ConfigError("GAFAELFAWR_SESSION_SECRET is not set".to_string())
        })?;

        match &mut config.provider {
            ProviderConfig::Github { client_secret, .. } => {
                *client_secret = std::env::var("GAFAELFAWR_GITHUB_CLIENT_SECRET").map_err(|_| {
                    StartupError::ConfigError(
                        "GAFAELFAWR_GITHUB_CLIENT_SECRET is not set".to_string(),
                    )
                })?;
            }
            ProviderConfig::Oidc { client_secret, .. } => {
                *client_secret = std::env::var("GAFAELFAWR_OIDC_CLIENT_SECRET").map_err(|_| {
                    StartupError::ConfigError(
                        "GAFAELFAWR_OIDC_CLIENT_SECRET is not set".to_string(),
                    )
                })?;
            }
        }

        if config.issuer.signing_key_path.is_empty() {
            return Err(StartupError::SigningMisconfigured(
                "issuer.signing_key_path must be set".to_string(),
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_keys() {
        let yaml = r#"
issuer:
  iss: "https://example.com/"
  aud_default: "https://example.com/"
  aud_internal: "https://internal.example.com/"
  signing_key_path: "/etc/gafaelfawr/signing.pem"
provider:
  type: github
  client_id: "abc"
bogus_top_level_key: true
"#;
        let parsed: Result<GafaelfawrConfig, _> = serde_yaml_ng::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let yaml = r#"
issuer:
  iss: "https://example.com/"
  aud_default: "https://example.com/"
  aud_internal: "https://internal.example.com/"
  signing_key_path: "/etc/gafaelfawr/signing.pem"
provider:
  type: github
  client_id: "abc"
"#;
        let parsed: GafaelfawrConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(parsed.session.session_ttl_seconds, default_session_ttl_seconds());
        assert_eq!(parsed.server.bind_address, default_bind_address());
        assert_eq!(parsed.auth.default_satisfy, "all");
    }
}
