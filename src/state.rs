//! Shared application state handed to every handler.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use crate::config::{GafaelfawrConfig, ProviderConfig};
use crate::providers::{github::GithubProvider, oidc::OidcProvider};
use crate::signing::DynSigner;
use crate::store::Store;
use crate::verifier::JwksCache;

/// Application lifecycle states, used by the liveness/readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Unknown = 0,
    Initializing = 1,
    Ready = 2,
    Terminating = 3,
}

/// One of the two identity-provider backends this deployment is configured
/// to use.
pub enum Provider {
    Github(GithubProvider),
    Oidc(OidcProvider),
}

pub struct AppState {
    pub config: GafaelfawrConfig,
    pub signer: DynSigner,
    pub store: Store,
    pub jwks_cache: JwksCache,
    pub provider: Provider,
    lifecycle: AtomicU8,
}

impl AppState {
    pub fn new(config: GafaelfawrConfig, signer: DynSigner, store: Store, provider: Provider) -> Self {
        let http = reqwest::Client::new();
        AppState {
            config,
            signer,
            store,
            jwks_cache: JwksCache::new(http),
            provider,
            lifecycle: AtomicU8::new(ApplicationState::Unknown as u8),
        }
    }

    pub fn set_state(&self, value: ApplicationState) {
        self.lifecycle.store(value as u8, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        let state = self.lifecycle.load(Ordering::SeqCst);
        state >= ApplicationState::Initializing as u8 && state < ApplicationState::Terminating as u8
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) >= ApplicationState::Ready as u8
    }

    /// The signer is ready once it can produce a JWKS document with at
    /// least one key — a signer holding a malformed or empty keypair would
    /// otherwise pass every other startup check and only fail the first
    /// real `/auth` request.
    pub fn is_signer_ready(&self) -> bool {
        self.signer
            .jwks()
            .get("keys")
            .and_then(|k| k.as_array())
            .is_some_and(|keys| !keys.is_empty())
    }

    pub async fn is_store_ready(&self) -> bool {
        self.store.is_healthy().await
    }

    pub fn github_provider(&self) -> Option<&GithubProvider> {
        match &self.provider {
            Provider::Github(p) => Some(p),
            Provider::Oidc(_) => None,
        }
    }

    pub fn oidc_provider(&self) -> Option<&OidcProvider> {
        match &self.provider {
            Provider::Oidc(p) => Some(p),
            Provider::Github(_) => None,
        }
    }
}

pub fn describe_provider(config: &GafaelfawrConfig) -> &'static str {
    match &config.provider {
        ProviderConfig::Github { .. } => "github",
        ProviderConfig::Oidc { .. } => "oidc",
    }
}

pub type SharedState = Arc<AppState>;
