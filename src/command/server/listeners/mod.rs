use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::command::server::error::Error;

pub mod tls;

/// Pause after a failed `accept`, so descriptor exhaustion does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn build_listener(binding_address: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(binding_address)
        .await
        .map_err(|err| Error::Initialization(format!("Failed to bind to {binding_address}: {err}")))
}

/// Next incoming connection. Accept failures (EMFILE, ECONNABORTED, ...)
/// only affect the pending connection: they are logged and the listener
/// keeps going.
async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    next_connection(|| listener.accept()).await
}

async fn next_connection<S, F, Fut>(mut accept: F) -> (S, SocketAddr)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, remote_address)) => {
                debug!("Accepted connection from {remote_address}");
                return (stream, remote_address);
            }
            Err(err) => {
                warn!("Failed to accept incoming connection: {err}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
