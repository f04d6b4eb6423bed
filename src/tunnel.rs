//! `CONNECT` handling on a socket the dispatcher has taken away from HTTP parsing.

use std::sync::Arc;

use hyper::StatusCode;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::common::write_raw_response;
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::monitoring::ProxyMetrics;
use crate::prebuffered::Prebuffered;
use crate::relay::{TunnelHandle, spawn_tunnel};

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Opens a tunnel from `client` to `target` through `dialer`.
///
/// `head_len` bytes of request head are still buffered in `client` and are
/// dropped first; anything the client pipelined after them goes to the target.
/// The client sees the established banner only once the dial has succeeded.
/// When the dial fails the client is closed without a single byte written.
///
/// Every error has already been answered or closed on the client side by the
/// time it is returned.
pub async fn handle_connect<S>(
    mut client: Prebuffered<S>,
    head_len: usize,
    target: &str,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<ProxyMetrics>,
) -> Result<TunnelHandle, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = client.discard(head_len) {
        let _ = write_raw_response(&mut client, StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).await;
        let _ = client.shutdown().await;
        return Err(ProxyError::Io(e));
    }

    let upstream = match dialer.dial(target).await {
        Ok(stream) => stream,
        Err(e) => {
            let route = dialer.route().to_string();
            warn!("CONNECT {} via {} failed: {}", target, route, e);
            metrics.record_dial_failure(&route);
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    debug!("Tunnel to {} established via {}", target, dialer.route());

    Ok(spawn_tunnel(client, upstream, metrics))
}
