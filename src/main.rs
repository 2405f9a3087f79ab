//! pairlink - pairing-session service
//!
//! Links a messaging account to a headless client through a QR code or a
//! numeric pairing code, archives the resulting credentials to object
//! storage and hands the user a short reference code for them.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use pairlink::{
    api,
    bridge::BridgeClient,
    config::{Config, ConfigError},
    creds::FileCredentialStore,
    notify::NotificationChannel,
    orchestrator::{Collaborators, OrchestratorSettings, PairingService},
    protocol::ConnectOptions,
    publish::HttpArtifactPublisher,
    reaper::Reaper,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
};

/// pairlink - pairing-session service
#[derive(ClapParser, Debug)]
#[command(name = "pairlink", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket API server (overrides config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// WebSocket URL of the protocol bridge (overrides config)
    #[arg(long, env = "PAIRLINK_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Object storage endpoint for credential artifacts (overrides config)
    #[arg(long, env = "PAIRLINK_STORAGE_ENDPOINT")]
    storage_endpoint: Option<String>,

    /// Bearer token for the object storage endpoint (overrides config)
    #[arg(long, env = "PAIRLINK_STORAGE_TOKEN", hide_env_values = true)]
    storage_token: Option<String>,
}

#[derive(Error, Debug)]
pub enum PairlinkError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), PairlinkError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().or_else(Config::default_path);
    let mut config = match config_path {
        Some(ref path) => Config::load(path)?.unwrap_or_default(),
        None => Config::default(),
    };
    apply_overrides(&mut config, cli);
    config.validate()?;

    run_server(config).await
}

fn apply_overrides(config: &mut Config, cli: Cli) {
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(url) = cli.bridge_url {
        config.protocol.bridge_url = url;
    }
    if cli.storage_endpoint.is_some() {
        config.storage.endpoint = cli.storage_endpoint;
    }
    if cli.storage_token.is_some() {
        config.storage.token = cli.storage_token;
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pairlink=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config: Config) -> Result<(), PairlinkError> {
    tracing::info!("pairlink starting");

    tokio::fs::create_dir_all(&config.temp_dir).await?;
    if config.storage.endpoint.is_none() {
        tracing::warn!("no storage endpoint configured, uploads will fail");
    }

    let registry = SessionRegistry::with_max_sessions(Some(config.max_sessions));
    let notifier = NotificationChannel::new();
    let shutdown = ShutdownCoordinator::new();
    let publisher = HttpArtifactPublisher::new(
        config.storage.endpoint.clone(),
        config.storage.token.clone(),
    )?;

    let settings = OrchestratorSettings {
        timings: config.timings.clone(),
        connect_options: ConnectOptions {
            browser: config.protocol.browser.clone(),
            query_timeout_ms: config.protocol.query_timeout_ms,
            ..ConnectOptions::default()
        },
        reference_prefix: config.storage.reference_prefix.clone(),
        branding: config.branding.clone(),
    };
    let deps = Collaborators {
        registry: registry.clone(),
        notifier: notifier.clone(),
        client: Arc::new(BridgeClient::new(config.protocol.bridge_url.clone())),
        creds: Arc::new(FileCredentialStore),
        publisher: Arc::new(publisher),
        settings: Arc::new(settings),
    };
    let service = Arc::new(PairingService::new(deps, config.temp_dir.clone()));

    let reaper = Reaper::spawn(
        registry.clone(),
        notifier.clone(),
        config.timings.reaper_interval(),
        config.timings.max_session_age(),
        config.timings.cleanup_grace(),
    );

    let state = api::AppState {
        service: service.clone(),
        shutdown: shutdown.clone(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: config.cors_origins.clone(),
            rate_limit: config.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    tracing::info!("pairlink ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // Signal push sockets to send close frames, then tear sessions down.
    shutdown.shutdown();
    reaper.shutdown();
    service.shutdown_all().await;
    if !shutdown.wait_for_all_closed(Duration::from_secs(2)).await {
        tracing::warn!(
            remaining = shutdown.active_connections(),
            "push connections still open at shutdown"
        );
    }

    let _ = server_shutdown_tx.send(());
    if let Err(e) = http_handle.await? {
        tracing::warn!(error = %e, "HTTP server exited with error");
    }
    reaper.join().await;

    tracing::info!("pairlink exiting");
    Ok(())
}
