use crate::Error;
use crate::router::router;

use std::future::IntoFuture;
use std::net::SocketAddr;

use subpub::SubPub;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// HTTP/WebSocket front end for a [`SubPub`] bus.
///
/// The server only borrows the bus: shutting the server down stops accepting
/// requests but leaves closing the bus to its owner.
pub struct SubPubServer {
    listen_addr: SocketAddr,
    bus: SubPub<String>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl SubPubServer {
    /// Creates a new instance of `SubPubServer`.
    #[must_use]
    pub fn new(listen_addr: SocketAddr, bus: SubPub<String>) -> Self {
        Self {
            listen_addr,
            bus,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Binds the listener and starts serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding to port 0.
    ///
    /// # Errors
    /// Returns an error if the server was already started or binding fails.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(Error::Bind)?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;

        let router = router(self.bus.clone());
        let shutdown_token = self.shutdown_token.clone();

        self.task_tracker.spawn(async move {
            tokio::select! {
                e = axum::serve(listener, router.into_make_service()).into_future() => {
                    info!("subpub server exited {:?}", e);
                }
                () = shutdown_token.cancelled() => {}
            };
        });

        self.task_tracker.close();

        info!(%local_addr, "subpub server listening");

        Ok(local_addr)
    }

    /// Stops accepting requests and waits for the serve task to finish.
    pub async fn shutdown(&self) {
        info!("subpub server shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("subpub server shutdown");
    }
}
