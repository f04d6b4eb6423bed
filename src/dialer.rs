//! Outbound dialing: direct or through a SOCKS5 upstream.
//!
//! A [`Dialer`] is one connect-time decision. [`DialerSelector`] makes that
//! decision afresh for every inbound connection from the immutable
//! [`UpstreamSpec`]; nothing about a previous connection is remembered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::config::{Config, UpstreamSpec};
use crate::error::ProxyError;
use crate::monitoring::ProxyMetrics;

/// Duplex byte stream handed out by a dialer.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Path a dialer takes to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Direct,
    Socks5(String),
    /// No usable upstream was configured; every dial fails.
    Unavailable,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => write!(f, "direct"),
            Route::Socks5(addr) => write!(f, "socks5://{}", addr),
            Route::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a connection to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError>;

    fn route(&self) -> Route;
}

pub struct DirectDialer {
    timeout: Duration,
}

impl DirectDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::Timeout {
                addr: addr.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| ProxyError::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn route(&self) -> Route {
        Route::Direct
    }
}

/// Dials through a SOCKS5 proxy without authentication.
///
/// The proxy address is not checked here; a malformed one fails the dial.
pub struct Socks5Dialer {
    proxy_addr: String,
    timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            timeout,
        }
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        let connect = Socks5Stream::connect(self.proxy_addr.as_str(), addr);
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| ProxyError::Timeout {
                addr: addr.to_string(),
                secs: self.timeout.as_secs(),
            })??;
        Ok(Box::new(stream))
    }

    fn route(&self) -> Route {
        Route::Socks5(self.proxy_addr.clone())
    }
}

/// Stands in when an upstream pool is empty, so the failure surfaces per dial.
pub struct UnavailableDialer;

#[async_trait]
impl Dialer for UnavailableDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, ProxyError> {
        Err(ProxyError::Config(format!(
            "no upstream configured to reach {}",
            addr
        )))
    }

    fn route(&self) -> Route {
        Route::Unavailable
    }
}

/// Picks the dialer for one inbound connection.
pub trait SelectDialer: Send + Sync {
    fn select(&self) -> Arc<dyn Dialer>;
}

pub struct DialerSelector {
    spec: UpstreamSpec,
    timeout: Duration,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl DialerSelector {
    pub fn new(spec: UpstreamSpec, timeout: Duration) -> Self {
        Self {
            spec,
            timeout,
            metrics: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.upstream_spec(), config.dial_timeout())
    }

    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    /// Selects a dialer using `rng` for pool choices.
    pub fn select_with<R: Rng>(&self, rng: &mut R) -> Arc<dyn Dialer> {
        match &self.spec {
            UpstreamSpec::Direct => Arc::new(DirectDialer::new(self.timeout)),
            UpstreamSpec::Single(addr) => self.socks5(addr),
            UpstreamSpec::Pool(pool) => match pool.choose(rng) {
                Some(addr) => {
                    debug!("Using upstream {}", addr);
                    self.socks5(addr)
                }
                None => Arc::new(UnavailableDialer),
            },
        }
    }

    fn socks5(&self, addr: &str) -> Arc<dyn Dialer> {
        if let Some(metrics) = &self.metrics {
            metrics.record_selection(addr);
        }
        Arc::new(Socks5Dialer::new(addr, self.timeout))
    }
}

impl SelectDialer for DialerSelector {
    fn select(&self) -> Arc<dyn Dialer> {
        self.select_with(&mut rand::thread_rng())
    }
}
