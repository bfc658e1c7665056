//! nostr-relay server entry point.
//!
//! Loads configuration, connects the event store and serves the relay
//! until SIGINT or SIGTERM.

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nostr_relay::app_state::AppState;
use nostr_relay::config::{LogFormat, RelayConfig, StoreBackend};
use nostr_relay::server;
use nostr_relay::store::{EventStore, MemoryEventStore, PgEventStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = RelayConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    // Initialize tracing
    init_tracing(config.log_format);
    tracing::info!(
        addr = %config.listen_addr,
        store = ?config.store,
        max_limit = config.max_limit,
        subscription_capacity = config.subscription_capacity,
        "starting nostr-relay"
    );

    match config.store {
        StoreBackend::Postgres => {
            tracing::info!(database = %config.redacted_database_url(), "connecting to PostgreSQL");
            let store = PgEventStore::connect(&config)
                .await
                .context("connecting to the event store")?;
            run(AppState::new(store, config)).await
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; events are lost on restart");
            run(AppState::new(MemoryEventStore::new(), config)).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run<S: EventStore>(state: AppState<S>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.listen_addr)
        .await
        .with_context(|| format!("binding {}", state.config.listen_addr))?;
    tokio::spawn(shutdown_signal(state.shutdown.clone()));
    server::serve(state, listener).await?;
    Ok(())
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}
