//! Gafaelfawr entry point.
//!
//! Parses CLI arguments, loads configuration, and either starts the
//! gateway's HTTP server or runs one of the key-material utility
//! subcommands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

use gafaelfawr::config::{GafaelfawrConfig, ProviderConfig};
use gafaelfawr::providers::{github::GithubProvider, oidc::OidcProvider};
use gafaelfawr::state::{AppState, Provider};
use gafaelfawr::store::Store;
use gafaelfawr::{crypto, metrics, server, signing};

/// Layer that filters out specific noisy error messages.
struct FilteringLayer<L> {
    inner: L,
}

impl<L, S> Layer<S> for FilteringLayer<L>
where
    L: Layer<S>,
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        if event.metadata().level() == &tracing::Level::ERROR
            && visitor.message.contains("Error reading from stream")
        {
            return;
        }
        self.inner.on_event(event, ctx);
    }

    fn enabled(
        &self,
        metadata: &tracing::Metadata<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) -> bool {
        self.inner.enabled(metadata, ctx)
    }

    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.inner.on_new_span(attrs, id, ctx);
    }

    fn on_record(
        &self,
        span: &tracing::Id,
        values: &tracing::span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.inner.on_record(span, values, ctx);
    }

    fn on_enter(&self, id: &tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_enter(id, ctx);
    }

    fn on_exit(&self, id: &tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_exit(id, ctx);
    }

    fn on_close(&self, id: tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_close(id, ctx);
    }
}

struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn new() -> Self {
        Self { message: String::new() }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "gafaelfawr", version, about = "Authentication and authorization gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway's HTTP server.
    Run {
        /// Config file path (overrides GAFAELFAWR_CONFIG_PATH)
        #[arg(long = "config-file", value_name = "FILE", env = "GAFAELFAWR_CONFIG_PATH")]
        config_file: PathBuf,
    },
    /// Generate a fresh RSA signing keypair and print it to stdout.
    GenerateKey,
    /// Generate a fresh session-cookie AEAD secret and print it to stdout.
    GenerateSessionSecret,
}

fn init_logging() {
    let env_filter = if let Ok(v) = std::env::var("RUST_LOG") {
        format!("{},log=warn", v)
    } else {
        "info,log=warn".to_string()
    };
    let fmt_layer = fmt::layer().with_target(false).compact();
    let filtering_layer = FilteringLayer { inner: fmt_layer };
    tracing_subscriber::registry()
        .with(filtering_layer)
        .with(tracing_subscriber::filter::EnvFilter::new(env_filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateKey => {
            let pem = signing::generate_keypair_pem()?;
            print!("{pem}");
            Ok(())
        }
        Commands::GenerateSessionSecret => {
            println!("{}", crypto::generate_session_secret());
            Ok(())
        }
        Commands::Run { config_file } => run(config_file).await,
    }
}

async fn run(config_file: PathBuf) -> anyhow::Result<()> {
    init_logging();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install AWS-LC crypto provider");

    let config = GafaelfawrConfig::load(&config_file)?;
    tracing::info!(issuer = %config.issuer.iss, "Configuration loaded");

    metrics::init();

    let signer = signing::load_pem_signer_from_paths(
        &config.issuer.signing_key_path,
        config.issuer.signing_cert_path.as_deref(),
    )?;

    let store = Store::new()?;

    let provider = match &config.provider {
        ProviderConfig::Github { client_id, client_secret } => {
            Provider::Github(GithubProvider::new(client_id.clone(), client_secret.clone()))
        }
        ProviderConfig::Oidc { issuer_url, client_id, client_secret, redirect_url } => {
            let oidc = OidcProvider::discover(
                issuer_url,
                client_id.clone(),
                client_secret.clone(),
                redirect_url.clone(),
            )
            .await?;
            Provider::Oidc(oidc)
        }
    };

    let state = Arc::new(AppState::new(config, signer, store, provider));

    match server::service::start(state).await {
        Ok(()) => tracing::info!("Server exited cleanly"),
        Err(e) => tracing::error!("Server execution failed: {e:?}"),
    }

    Ok(())
}
