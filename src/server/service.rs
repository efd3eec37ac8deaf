//! HTTP service: builds the gateway's router and runs its HTTP(S) listener.
//!
//! Plain TCP falls through to `axum::serve`; TLS terminates per-connection
//! via a `tokio_rustls::TlsAcceptor` spawned onto its own task.

use std::{fs, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use axum::{Router, routing::get};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use crate::server::handlers::{analyze, auth_probe, health, login, tokens, well_known};
use crate::state::{AppState, ApplicationState};

struct TlsMaterial {
    certs: Vec<u8>,
    key: Vec<u8>,
}

fn is_existing_file(path: &str) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

async fn load_tls_material(state: &AppState) -> anyhow::Result<TlsMaterial> {
    let cert = state
        .config
        .server
        .tls_cert
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no TLS cert configured"))?;
    let key = state
        .config
        .server
        .tls_key
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no TLS key configured"))?;

    if !is_existing_file(&cert.to_string_lossy()) || !is_existing_file(&key.to_string_lossy()) {
        bail!("configured TLS cert/key file is missing");
    }

    let certs = fs::read(cert).context("reading TLS cert")?;
    let key = fs::read(key).context("reading TLS key")?;
    if certs.is_empty() || key.is_empty() {
        bail!("TLS cert or key file is empty");
    }
    Ok(TlsMaterial { certs, key })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", get(auth_probe::auth))
        .route("/login", get(login::login))
        .route("/logout", get(login::logout))
        .route("/auth/analyze", get(analyze::analyze))
        .route(
            "/auth/tokens",
            get(tokens::list_tokens).post(tokens::create_token),
        )
        .route("/auth/tokens/new", get(tokens::new_token_form))
        .route(
            "/auth/tokens/{handle_key}",
            get(tokens::get_token).post(tokens::delete_token),
        )
        .route("/.well-known/jwks.json", get(well_known::jwks))
        .route(
            "/.well-known/openid-configuration",
            get(well_known::openid_configuration),
        )
        .route("/livez", get(health::livez))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(crate::metrics::handler::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawns the gateway's two periodic sweeps: expired session rows fall out
/// of the store, and stale JWKS cache entries (positive or negative) fall
/// out of memory. Both are detached loops that die with the process, the
/// same shape as the Prometheus upkeep loop in `metrics::init`.
fn spawn_background_tasks(state: Arc<AppState>) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs() as i64;
            if let Err(e) = sweep_state.store.cleanup_expired_sessions(now).await {
                tracing::warn!("session expiry sweep failed: {}", e);
            }
        }
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            state.jwks_cache.sweep_expired().await;
        }
    });
}

pub async fn start(state: Arc<AppState>) -> anyhow::Result<()> {
    state.set_state(ApplicationState::Initializing);
    let router = build_router(state.clone());
    spawn_background_tasks(state.clone());

    let addr: SocketAddr = state
        .config
        .server
        .bind_address
        .parse()
        .context("parsing server.bind_address")?;

    let tls_material = load_tls_material(&state).await.ok();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if let Some(material) = tls_material {
        let certs = rustls_pemfile::certs(&mut material.certs.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .context("parsing TLS certs")?;
        let key = rustls_pemfile::private_key(&mut material.key.as_slice())
            .context("parsing TLS key")?
            .ok_or_else(|| anyhow::anyhow!("no private key found in TLS key file"))?;
        let rustls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building TLS server config")?;
        let acceptor = Arc::new(TlsAcceptor::from(Arc::new(rustls_config)));

        state.set_state(ApplicationState::Ready);
        tracing::info!("Listening on https://{}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let app = router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("TLS accept failed: {}", e);
                        return;
                    }
                };
                let service = TowerToHyperService::new(app);
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await;
            });
        }
    } else {
        state.set_state(ApplicationState::Ready);
        tracing::info!("Listening on http://{}", addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
