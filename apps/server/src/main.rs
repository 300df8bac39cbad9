//! filedepot server
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:50051, store into ./files_storage
//! filedepot-server
//!
//! # Custom address and storage directory
//! SERVER_ADDRESS=127.0.0.1:6000 STORAGE_DIR=/data/images filedepot-server
//!
//! # Tighter admission limits
//! filedepot-server --max-uploads 2 --max-downloads 4
//! ```

mod config;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use filedepot_rpc::FileServer;

use config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,filedepot=debug")),
        )
        .init();

    let args = Args::parse();
    let config = args.server_config();
    info!(
        listen = %config.listen_addr,
        storage = %config.storage_dir.display(),
        uploads = config.limits.upload,
        downloads = config.limits.download,
        lists = config.limits.list,
        "starting filedepot server"
    );

    let server = FileServer::new(config);
    let mut run = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("shutdown signal received");
            server.shutdown();
            run.await??;
        }
        // The server stopped on its own, e.g. the address was taken.
        result = &mut run => result??,
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
