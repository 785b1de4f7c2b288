//! TCP accept loop with graceful shutdown.
//!
//! Every accepted socket is handed to a connection handler on its own task.
//! On shutdown the loop stops accepting and waits, up to a deadline, for the
//! active handlers to finish.

use crate::error::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Bind a listener, logging the resolved address
#[instrument]
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Listening");
    Ok(listener)
}

/// Cancel `token` on CTRL+C
pub fn shutdown_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            token.cancel();
        }
    });
}

/// Accept until `shutdown` fires, running `handler` for each connection
#[instrument(skip(listener, shutdown, handler))]
pub async fn serve<F, Fut>(
    listener: TcpListener,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let active_connections = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down listener. Waiting for connections to close...");

                let timeout = tokio::time::sleep(shutdown_timeout);
                tokio::pin!(timeout);

                loop {
                    let connections = active_connections.load(Ordering::Acquire);
                    if connections == 0 {
                        info!("All connections closed");
                        break;
                    }
                    tokio::select! {
                        _ = &mut timeout => {
                            warn!(connections, "Shutdown timeout reached, forcing exit");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {
                            debug!(connections, "Waiting for connections to close");
                        }
                    }
                }
                return Ok(());
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let active_connections = active_connections.clone();
                        active_connections.fetch_add(1, Ordering::AcqRel);

                        let fut = handler(stream, peer);
                        tokio::spawn(async move {
                            fut.await;
                            active_connections.fetch_sub(1, Ordering::AcqRel);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}
