use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use fleetwatch::api::{self, AppState, ListingPolicy};
use fleetwatch::auth::{ApiKeyGate, AuthGate, OpenGate};
use fleetwatch::clock::SystemClock;
use fleetwatch::config::Config;
use fleetwatch::db::Database;
use fleetwatch::mirror::MirrorHandle;
use fleetwatch::{FleetService, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    tracing::info!("Public transport tracker");
    tracing::info!(
        bind = %config.bind,
        staleness_secs = config.staleness().as_secs(),
        min_update_interval_ms = config.min_update_interval_ms,
        tracking_timeout_secs = config.tracking_timeout_secs,
        require_tracking = config.require_tracking,
        "Configuration loaded"
    );

    let mirror = match &config.database {
        Some(path) => {
            let path = path.to_str().context("Database path is not valid UTF-8")?;
            let db = Database::new(path).await?;
            tracing::info!(path, "Durable mirror ready");
            MirrorHandle::new(Arc::new(db), config.mirror_timeout())
        }
        None => {
            tracing::info!("No database configured, running memory-only");
            MirrorHandle::disabled()
        }
    };

    let registry = Arc::new(Registry::new(
        Arc::new(SystemClock),
        config.registry_settings(),
    ));
    let service = FleetService::new(registry, mirror);
    service.restore().await;

    let gate = ApiKeyGate::new(config.api_keys.iter().map(String::as_str));
    let auth: Arc<dyn AuthGate> = if gate.is_empty() {
        tracing::warn!("No API keys configured, write endpoints are open");
        Arc::new(OpenGate)
    } else {
        Arc::new(gate)
    };

    let shutdown = CancellationToken::new();
    let sweeper = service
        .sweeper(config.sweeper_settings())
        .spawn(shutdown.clone());

    let state = AppState::new(
        service.clone(),
        auth,
        ListingPolicy {
            require_tracking: config.require_tracking,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "Listening");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    api::serve(listener, state, shutdown.clone())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    sweeper.await.context("Sweeper task panicked")?;
    service.flush().await;
    tracing::info!("Stopped");
    Ok(())
}
