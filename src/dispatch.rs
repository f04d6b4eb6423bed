use std::sync::Arc;

use hyper::StatusCode;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::common::write_raw_response;
use crate::dialer::SelectDialer;
use crate::error::ProxyError;
use crate::forward::ForwardHandler;
use crate::monitoring::{ProxyMetrics, RequestKind};
use crate::parse::RequestHead;
use crate::prebuffered::Prebuffered;
use crate::tls::OriginTls;
use crate::tunnel::handle_connect;

/// Smallest read buffer hyper's HTTP/1 server accepts.
const MIN_HYPER_BUF_SIZE: usize = 8192;

/// Routes each inbound connection to the tunnel or the forward path.
///
/// The dialer is selected once per connection, after the request head has
/// been read and before any destination is contacted.
pub struct Dispatcher {
    selector: Arc<dyn SelectDialer>,
    metrics: Arc<ProxyMetrics>,
    origin_tls: OriginTls,
    max_header_size: usize,
}

impl Dispatcher {
    pub fn new(selector: Arc<dyn SelectDialer>, metrics: Arc<ProxyMetrics>, max_header_size: usize) -> Self {
        Self {
            selector,
            metrics,
            origin_tls: OriginTls::new(),
            max_header_size,
        }
    }

    /// Replaces the trust roots used for `https` origins.
    pub fn with_origin_tls(mut self, origin_tls: OriginTls) -> Self {
        self.origin_tls = origin_tls;
        self
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Serves one client connection to completion.
    ///
    /// For a tunnel this returns once the relay tasks are running. Errors are
    /// already answered on the connection; the caller only logs them.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Prebuffered::new(stream, self.max_header_size);

        let head = match RequestHead::peek(&mut conn).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.metrics.record_bad_request();
                let _ = write_raw_response(&mut conn, StatusCode::BAD_REQUEST, &e.to_string()).await;
                let _ = conn.shutdown().await;
                return Err(e);
            }
        };

        let dialer = self.selector.select();
        debug!("{} {} via {}", head.method, head.target_host(), dialer.route());

        if head.is_connect() {
            self.metrics.record_request(RequestKind::Tunnel);
            handle_connect(conn, head.len, &head.target, dialer, self.metrics.clone()).await?;
            return Ok(());
        }

        let handler = Arc::new(ForwardHandler::new(
            dialer,
            self.metrics.clone(),
            self.origin_tls.clone(),
        ));
        ServerBuilder::new()
            .keep_alive(false)
            .max_buf_size(self.max_header_size.max(MIN_HYPER_BUF_SIZE))
            .serve_connection(
                TokioIo::new(conn),
                service_fn(move |req| {
                    let handler = handler.clone();
                    async move { handler.handle_request(req).await }
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{BoxedStream, Dialer, Route};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, duplex};

    struct CountingSelector {
        calls: AtomicUsize,
    }

    struct NeverDialer;

    #[async_trait]
    impl Dialer for NeverDialer {
        async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
            Err(ProxyError::Connection(format!("{} unreachable", addr)))
        }

        fn route(&self) -> Route {
            Route::Direct
        }
    }

    impl SelectDialer for CountingSelector {
        fn select(&self) -> Arc<dyn Dialer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(NeverDialer)
        }
    }

    fn dispatcher(max_header_size: usize) -> (Dispatcher, Arc<CountingSelector>) {
        let selector = Arc::new(CountingSelector { calls: AtomicUsize::new(0) });
        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        (Dispatcher::new(selector.clone(), metrics, max_header_size), selector)
    }

    #[tokio::test]
    async fn test_garbage_head_gets_400() {
        let (dispatcher, selector) = dispatcher(1024);
        let (server, mut client) = duplex(1024);

        client.write_all(b"\x16\x03\x01\x00\x05hello\r\n\r\n").await.unwrap();
        assert!(dispatcher.serve_connection(server).await.is_err());

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(selector.calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.metrics().encode().unwrap().contains("bridge_bad_requests_total 1"));
    }

    #[tokio::test]
    async fn test_oversized_head_gets_400() {
        let (dispatcher, _) = dispatcher(32);
        let (server, mut client) = duplex(1024);

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaa\r\n\r\n")
            .await
            .unwrap();
        assert!(dispatcher.serve_connection(server).await.is_err());

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_silent_connection_is_noop() {
        let (dispatcher, selector) = dispatcher(1024);
        let (server, client) = duplex(1024);
        drop(client);

        dispatcher.serve_connection(server).await.unwrap();
        assert_eq!(selector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dialer_selected_once_per_connection() {
        let (dispatcher, selector) = dispatcher(1024);
        let (server, mut client) = duplex(1024);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        assert!(dispatcher.serve_connection(server).await.is_err());

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(selector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.metrics().dial_failures("direct"), 1);
    }
}
