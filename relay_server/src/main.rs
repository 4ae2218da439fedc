use anyhow::Result;
use relay_core::{Coordinator, RelayConfig, http, spawn_reaper};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (PORT etc.)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env()?;
    // Fails fast if the OS entropy source is unavailable
    let coordinator = Arc::new(Coordinator::in_memory()?);
    let cancel_token = CancellationToken::new();

    let reaper = config.session_ttl.map(|ttl| {
        tracing::info!("Evicting idle sessions after {:?}", ttl);
        spawn_reaper(coordinator.clone(), ttl, cancel_token.clone())
    });

    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        shutdown.cancel();
    });

    let result = http::serve(config.socket_addr(), coordinator, Some(cancel_token.clone())).await;
    cancel_token.cancel();
    if let Some(handle) = reaper {
        let _ = handle.await;
    }

    if let Err(e) = &result {
        tracing::error!("Relay server error: {}", e);
    }
    result
}
