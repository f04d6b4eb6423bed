//! Byte relay between the two legs of a tunnel.
//!
//! Each direction runs as its own task. A leg is closed when either task
//! finishes: the finishing task fires the shared close signal, which makes its
//! mirror stop at its next read or write, and each task shuts down the write
//! half it owns. Firing the signal more than once is harmless.

use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::monitoring::{Direction, ProxyMetrics};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Copies `source` into `destination` until end of stream, an I/O error, or `close`.
///
/// On exit `close` is fired and `destination` is shut down, whatever ended the copy.
/// Returns the number of bytes copied.
pub async fn relay<W, R>(mut destination: W, mut source: R, close: CancellationToken) -> u64
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            res = source.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("relay read ended: {}", e);
                    break;
                }
            },
            _ = close.cancelled() => break,
        };

        let written = tokio::select! {
            res = destination.write_all(&buf[..n]) => res,
            _ = close.cancelled() => break,
        };
        if let Err(e) = written {
            debug!("relay write ended: {}", e);
            break;
        }
        copied += n as u64;
    }

    close.cancel();
    let _ = destination.shutdown().await;
    copied
}

/// Decrements the open-tunnel gauge once both relay tasks have let go of it.
struct TunnelGuard(Arc<ProxyMetrics>);

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.0.tunnel_closed();
    }
}

/// Join handles for the two directions of a running tunnel.
pub struct TunnelHandle {
    pub upload: JoinHandle<u64>,
    pub download: JoinHandle<u64>,
}

impl TunnelHandle {
    /// Waits for both directions and returns `(client_to_upstream, upstream_to_client)` byte counts.
    pub async fn join(self) -> (u64, u64) {
        let (up, down) = futures::future::join(self.upload, self.download).await;
        (up.unwrap_or(0), down.unwrap_or(0))
    }
}

/// Splits both streams and spawns one relay task per direction.
///
/// Returns as soon as the tasks are scheduled; the streams are owned by the
/// tasks from here on and dropped when both have exited.
pub fn spawn_tunnel<C, U>(client: C, upstream: U, metrics: Arc<ProxyMetrics>) -> TunnelHandle
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let close = CancellationToken::new();

    metrics.tunnel_opened();
    let guard = Arc::new(TunnelGuard(metrics.clone()));

    let upload = {
        let close = close.clone();
        let guard = guard.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let n = relay(upstream_write, client_read, close).await;
            metrics.record_relayed(Direction::Upload, n);
            drop(guard);
            n
        })
    };

    let download = tokio::spawn(async move {
        let n = relay(client_write, upstream_read, close).await;
        metrics.record_relayed(Direction::Download, n);
        drop(guard);
        n
    });

    TunnelHandle { upload, download }
}
