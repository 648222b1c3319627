//! Wires the chunk store, merge engine and WebSocket server together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use slicedrop_server::{ServerConfig, StagingHandler, UploadServer};
use slicedrop_transfer::{ChunkStore, MergeEngine};

use crate::config::Config;

/// Runs the daemon until SIGINT or until the server stops on its own.
pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.upload_root)
        .with_context(|| format!("creating {}", config.upload_root.display()))?;

    let server = UploadServer::new(
        ServerConfig {
            host: config.host,
            port: config.port,
        },
        build_handler(&config),
    );

    let runner = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        joined = &mut server_task => {
            joined.context("server task panicked")?.context("server stopped")?;
            return Ok(());
        }
        signal = wait_then_ctrl_c(&server) => {
            signal.context("listening for SIGINT")?;
            tracing::info!("SIGINT received, shutting down");
        }
    }

    server.shutdown();
    server_task
        .await
        .context("server task panicked")?
        .context("server failed during shutdown")?;
    Ok(())
}

fn build_handler(config: &Config) -> StagingHandler {
    let store = ChunkStore::new(config.upload_root.clone());
    let merger = MergeEngine::for_store(&store).verify(config.verify_merge);
    let handler = StagingHandler::with_parts(store, merger);
    match &config.public_url {
        Some(url) => handler.with_public_url(url.clone()),
        None => handler,
    }
}

async fn wait_then_ctrl_c(server: &UploadServer<StagingHandler>) -> std::io::Result<()> {
    loop {
        if let Some(addr) = server.local_addr() {
            tracing::info!(%addr, "accepting uploads");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::signal::ctrl_c().await
}
