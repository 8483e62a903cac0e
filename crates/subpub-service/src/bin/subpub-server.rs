//! Publish/subscribe server binary.

use subpub::SubPub;
use subpub_service::{Config, Error, SubPubServer, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    logging::init(&config.log_level);

    let bus = SubPub::<String>::with_queue_capacity(config.queue_capacity);
    let server = SubPubServer::new(config.listen_addr, bus.clone());
    server.start().await?;

    wait_for_shutdown_signal().await?;

    // Stop taking new requests, then let the bus deliver what it has.
    server.shutdown().await;

    if let Err(e) = bus.close_timeout(config.shutdown_timeout).await {
        error!("bus close interrupted: {}", e);
    }

    info!("subpub server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), Error> {
    tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
    info!("Received interrupt signal");

    Ok(())
}
