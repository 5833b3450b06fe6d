use std::future::Future;
use std::io;

use tftpd::{ServerConfig, TftpServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            ServerConfig::from_file(&path)?
        }
        None => ServerConfig::default(),
    };

    let server = TftpServer::bind(config).await?;
    info!("Serving on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    server.run_until(shutdown).await?;
    Ok(())
}

/// Cancel `shutdown` when `signal` fires. If the signal handler cannot be
/// installed the server keeps running.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
        Err(e) => error!("Could not listen for Ctrl-C, running until stopped: {}", e),
    }
}
