use crate::config::MonitoringConfig;
use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of proxied request, used as a metric label.
#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    Tunnel,
    Forward,
}

impl RequestKind {
    fn as_label(self) -> &'static str {
        match self {
            RequestKind::Tunnel => "tunnel",
            RequestKind::Forward => "forward",
        }
    }
}

/// Relay direction, used as a metric label.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn as_label(self) -> &'static str {
        match self {
            Direction::Upload => "client_to_upstream",
            Direction::Download => "upstream_to_client",
        }
    }
}

pub struct ProxyMetrics {
    registry: Registry,
    requests: IntCounterVec,
    dial_failures: IntCounterVec,
    bad_requests: IntCounter,
    active_tunnels: IntGauge,
    relayed_bytes: IntCounterVec,
    upstream_selections: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, ProxyError> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("bridge_requests_total", "Inbound requests by kind"),
            &["kind"],
        )?;
        let dial_failures = IntCounterVec::new(
            Opts::new("bridge_dial_failures_total", "Failed outbound dials by route"),
            &["route"],
        )?;
        let bad_requests = IntCounter::new(
            "bridge_bad_requests_total",
            "Connections rejected for an unreadable request head",
        )?;
        let active_tunnels = IntGauge::new("bridge_active_tunnels", "Open CONNECT tunnels")?;
        let relayed_bytes = IntCounterVec::new(
            Opts::new("bridge_relayed_bytes_total", "Bytes copied through tunnels"),
            &["direction"],
        )?;
        let upstream_selections = IntCounterVec::new(
            Opts::new("bridge_upstream_selections_total", "SOCKS5 upstream picks by address"),
            &["upstream"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(dial_failures.clone()))?;
        registry.register(Box::new(bad_requests.clone()))?;
        registry.register(Box::new(active_tunnels.clone()))?;
        registry.register(Box::new(relayed_bytes.clone()))?;
        registry.register(Box::new(upstream_selections.clone()))?;

        Ok(Self {
            registry,
            requests,
            dial_failures,
            bad_requests,
            active_tunnels,
            relayed_bytes,
            upstream_selections,
        })
    }

    pub fn record_request(&self, kind: RequestKind) {
        self.requests.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn record_dial_failure(&self, route: &str) {
        self.dial_failures.with_label_values(&[route]).inc();
    }

    pub fn record_bad_request(&self) {
        self.bad_requests.inc();
    }

    pub fn tunnel_opened(&self) {
        self.active_tunnels.inc();
    }

    pub fn tunnel_closed(&self) {
        self.active_tunnels.dec();
    }

    pub fn active_tunnels(&self) -> i64 {
        self.active_tunnels.get()
    }

    pub fn record_relayed(&self, direction: Direction, bytes: u64) {
        self.relayed_bytes.with_label_values(&[direction.as_label()]).inc_by(bytes);
    }

    pub fn relayed(&self, direction: Direction) -> u64 {
        self.relayed_bytes.with_label_values(&[direction.as_label()]).get()
    }

    pub fn record_selection(&self, upstream: &str) {
        self.upstream_selections.with_label_values(&[upstream]).inc();
    }

    pub fn requests(&self, kind: RequestKind) -> u64 {
        self.requests.with_label_values(&[kind.as_label()]).get()
    }

    pub fn dial_failures(&self, route: &str) -> u64 {
        self.dial_failures.with_label_values(&[route]).get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ProxyError::Metrics(e.to_string()))
    }
}

pub struct MonitoringServer {
    config: MonitoringConfig,
    metrics: Arc<ProxyMetrics>,
}

impl MonitoringServer {
    pub fn new(config: MonitoringConfig, metrics: Arc<ProxyMetrics>) -> Self {
        Self { config, metrics }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let addr = self.config.listen_address
            .unwrap_or_else(|| std::net::SocketAddr::from(([127, 0, 0, 1], 9900)));

        let listener = tokio::net::TcpListener::bind(&addr).await
            .map_err(ProxyError::Io)?;

        log::info!("Monitoring server listening on http://{}", addr);

        let state = Arc::new(MonitoringState {
            config: self.config,
            metrics: self.metrics,
        });

        loop {
            let (stream, remote_addr) = listener.accept().await
                .map_err(ProxyError::Io)?;
            let state = state.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = ServerBuilder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(state.route(&req)) }
                        }),
                    )
                    .await
                {
                    log::error!("Monitoring connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

struct MonitoringState {
    config: MonitoringConfig,
    metrics: Arc<ProxyMetrics>,
}

impl MonitoringState {
    fn route(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        route_path(&self.config, &self.metrics, req.uri().path())
    }
}

fn route_path(config: &MonitoringConfig, metrics: &ProxyMetrics, path: &str) -> Response<Full<Bytes>> {
    if path == config.metrics_endpoint {
        return match metrics.encode() {
            Ok(payload) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(payload)))
                .unwrap_or_else(|_| internal_error()),
            Err(e) => {
                log::error!("Failed to encode Prometheus metrics: {}", e);
                internal_error()
            }
        };
    }

    if path == config.health_endpoint {
        let payload = json!({
            "status": "healthy",
            "timestamp": current_timestamp(),
            "active_tunnels": metrics.active_tunnels(),
            "tunnel_requests": metrics.requests(RequestKind::Tunnel),
            "forward_requests": metrics.requests(RequestKind::Forward),
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
            .unwrap_or_else(|_| internal_error());
    }

    let mut response = Response::new(Full::new(Bytes::from("Monitoring endpoint not found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn internal_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from("metrics unavailable")));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.record_request(RequestKind::Tunnel);
        metrics.record_request(RequestKind::Tunnel);
        metrics.record_dial_failure("direct");
        metrics.record_selection("127.0.0.1:1080");
        metrics.record_relayed(Direction::Download, 512);

        let text = metrics.encode().unwrap();
        assert!(text.contains("bridge_requests_total{kind=\"tunnel\"} 2"));
        assert!(text.contains("bridge_dial_failures_total{route=\"direct\"} 1"));
        assert!(text.contains("bridge_upstream_selections_total{upstream=\"127.0.0.1:1080\"} 1"));
        assert!(text.contains("bridge_relayed_bytes_total{direction=\"upstream_to_client\"} 512"));
    }

    #[test]
    fn test_tunnel_gauge() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.tunnel_opened();
        metrics.tunnel_opened();
        metrics.tunnel_closed();
        assert_eq!(metrics.active_tunnels(), 1);
    }

    #[tokio::test]
    async fn test_routes() {
        let config = MonitoringConfig::default();
        let metrics = ProxyMetrics::new().unwrap();
        metrics.record_request(RequestKind::Forward);

        let health = route_path(&config, &metrics, "/health");
        assert_eq!(health.status(), StatusCode::OK);
        let body = health.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["forward_requests"], 1);

        assert_eq!(route_path(&config, &metrics, "/metrics").status(), StatusCode::OK);
        assert_eq!(route_path(&config, &metrics, "/nope").status(), StatusCode::NOT_FOUND);
    }
}
