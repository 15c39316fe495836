use std::path::PathBuf;
use std::sync::Arc;

use prefstore_core::{PrefsContext, PrefsSettings};
use prefstore_helper::{
    HelperContext, HelperServer, LoggingRefresher, MemorySecretStore, Right, TokenAuthorizer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "/etc/prefstore/helper.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,prefstore_helper=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("prefstore helper starting...");

    // Configuration
    let config_path = std::env::var_os("PREFSTORE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut settings = PrefsSettings::load(&config_path)?;
    if let Some(socket) = std::env::var_os("PREFSTORE_SOCKET") {
        settings.helper_socket = PathBuf::from(socket);
    }
    let socket_path = settings.helper_socket.clone();

    tracing::info!("   Config:    {}", config_path.display());
    tracing::info!("   Documents: {}", settings.prefs_dir.display());
    tracing::info!("   Socket:    {}", socket_path.display());

    let mut authorizer = TokenAuthorizer::new().trust_uid(0);
    if let Ok(token) = std::env::var("PREFSTORE_TOKEN") {
        authorizer = authorizer.grant(token, &[Right::Prefs, Right::Secrets, Right::Refresh]);
        tracing::info!("   Token access enabled");
    }

    let ctx = HelperContext::new(
        PrefsContext::in_memory(settings),
        Arc::new(authorizer),
        Arc::new(MemorySecretStore::new()),
        Arc::new(LoggingRefresher::new()),
    );
    let server = HelperServer::new(ctx);

    let server_path = socket_path.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(&server_path).await {
            tracing::error!("helper server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = server_handle => {
            tracing::warn!("helper server stopped");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("could not remove {}: {}", socket_path.display(), e);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
