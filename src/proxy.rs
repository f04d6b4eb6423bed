use crate::config::Config;
use crate::dialer::{DialerSelector, SelectDialer};
use crate::dispatch::Dispatcher;
use crate::error::ProxyError;
use crate::monitoring::ProxyMetrics;
use crate::tls::OriginTls;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// The listening side of the bridge: one task per accepted connection.
pub struct ProxyServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Binds the configured listen address with the selector the config describes.
    pub async fn bind(config: &Config, metrics: Arc<ProxyMetrics>) -> Result<Self, ProxyError> {
        let selector = DialerSelector::from_config(config).with_metrics(metrics.clone());
        Self::with_selector(config, Arc::new(selector), metrics).await
    }

    pub async fn with_selector(
        config: &Config,
        selector: Arc<dyn SelectDialer>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self, ProxyError> {
        let origin_tls = OriginTls::from_config(config)?;

        info!("Binding HTTP proxy listener to: {}", config.listen_addr());
        let listener = TcpListener::bind((config.bind_host(), config.listen_port))
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to bind {}: {}", config.listen_addr(), e)))?;

        let dispatcher = Dispatcher::new(selector, metrics, config.max_header_size)
            .with_origin_tls(origin_tls);
        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        info!("HTTP proxy listening on: http://{}", self.local_addr()?);

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let dispatcher = self.dispatcher.clone();

            tokio::spawn(async move {
                if let Err(err) = dispatcher.serve_connection(stream).await {
                    debug!("Connection from {} ended with error: {}", remote_addr, err);
                }
            });
        }
    }
}
