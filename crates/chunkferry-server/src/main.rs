mod cleanup;
mod config;
mod routes;

use std::sync::Arc;

use chunkferry_core::{Catalog, CredentialGate, FileStore, Ledger, StaticGate};
use tracing::info;

use crate::config::ServerConfig;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunkferry_server=debug,chunkferry_core=info,tower_http=debug".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            eprintln!("       Set CHUNKFERRY_USERS in your .env file and restart.");
            std::process::exit(1);
        }
    };

    // files/, staging/ and outbound/ must share a filesystem: finalize
    // commits by rename.
    let gate: Arc<dyn CredentialGate> = Arc::new(StaticGate::new(config.users.clone()));
    let store = Arc::new(FileStore::new(config.storage_dir.join("files")).await?);
    let ledger = Arc::new(
        Ledger::new(config.storage_dir.join("staging"), store.clone(), gate.clone()).await?,
    );
    let catalog = Arc::new(
        Catalog::new(
            config.storage_dir.join("outbound"),
            store,
            gate,
            config.download_chunk_size,
        )
        .await?,
    );

    tokio::spawn(cleanup::run_cleanup_loop(
        ledger.clone(),
        config.staging_ttl,
        config.cleanup_interval_secs,
    ));

    let app = routes::router(AppState { ledger, catalog }, config.max_chunk_bytes);

    let addr = config.addr()?;
    info!("Chunkferry server listening on {}", addr);
    info!(
        "Users: {}, download chunk size: {} bytes, staging TTL: {} hours",
        config.users.len(),
        config.download_chunk_size,
        config.staging_ttl.as_secs() / 3600
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
