//! Plain HTTP forwarding over a one-shot upstream connection.
//!
//! Every request gets its own dial through the connection's dialer and its own
//! HTTP/1.1 client handshake on top of it. `https` targets get a client TLS
//! handshake in between. Nothing is pooled; the upstream connection goes away
//! with the response body.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use url::Url;

use crate::common::{ProxyBody, ResponseBuilder};
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::monitoring::{ProxyMetrics, RequestKind};
use crate::tls::OriginTls;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ForwardHandler {
    dialer: Arc<dyn Dialer>,
    metrics: Arc<ProxyMetrics>,
    origin_tls: OriginTls,
}

impl ForwardHandler {
    pub fn new(dialer: Arc<dyn Dialer>, metrics: Arc<ProxyMetrics>, origin_tls: OriginTls) -> Self {
        Self {
            dialer,
            metrics,
            origin_tls,
        }
    }

    /// Forwards one request and answers with the upstream response, or a 503
    /// carrying the error text when the upstream cannot be reached.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() == Method::CONNECT {
            let e = ProxyError::UnsupportedOperation("Hijacking not supported".to_string());
            warn!("CONNECT {} reached the HTTP forwarder: {}", req.uri(), e);
            return Ok(ResponseBuilder::internal_server_error(&e.to_string()));
        }

        self.metrics.record_request(RequestKind::Forward);
        match self.process_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Forward via {} failed: {}", self.dialer.route(), e);
                Ok(ResponseBuilder::service_unavailable(&e.to_string()))
            }
        }
    }

    async fn process_request<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target_uri = extract_target_uri(&req)?;
        let use_tls = match target_uri.scheme_str().unwrap_or("http") {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::UnsupportedOperation(format!(
                    "cannot forward {} request to {}",
                    other, target_uri
                )));
            }
        };
        let host = target_uri
            .host()
            .ok_or_else(|| ProxyError::Uri(format!("no host in {}", target_uri)))?;
        let default_port = if use_tls { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT };
        let addr = format!("{}:{}", host, target_uri.port_u16().unwrap_or(default_port));

        debug!("{} {} via {}", req.method(), target_uri, self.dialer.route());

        let stream = match self.dialer.dial(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.metrics.record_dial_failure(&self.dialer.route().to_string());
                return Err(e);
            }
        };
        let stream = if use_tls {
            self.origin_tls.connect(host, stream).await?
        } else {
            stream
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Upstream connection closed with error: {}", err);
            }
        });

        reconstruct_request(&mut req, &target_uri)?;
        let response = sender.send_request(req).await?;
        debug!("{} answered {}", target_uri, response.status());

        Ok(copy_response(response))
    }
}

/// Resolves where a proxied request is going: the absolute-form URI when the
/// client sent one, otherwise `http://` plus the Host header plus the path.
pub fn extract_target_uri<B>(req: &Request<B>) -> Result<Uri, ProxyError> {
    let original_uri = req.uri();

    if original_uri.scheme().is_some() && original_uri.authority().is_some() {
        return Ok(original_uri.clone());
    }

    if let Some(host) = req.headers().get(HOST) {
        let host_str = host
            .to_str()
            .map_err(|e| ProxyError::Http(format!("Invalid Host header: {}", e)))?;

        let path = original_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = Url::parse(&format!("http://{}{}", host_str, path))?;
        return url
            .as_str()
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Uri(e.to_string()));
    }

    Err(ProxyError::Http("Cannot determine target URI".to_string()))
}

/// Rewrites the request for the origin: origin-form URI, Host present,
/// hop-by-hop headers removed.
fn reconstruct_request<B>(req: &mut Request<B>, target_uri: &Uri) -> Result<(), ProxyError> {
    let path = target_uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    *req.uri_mut() = path
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Uri(e.to_string()))?;

    strip_hop_by_hop(req.headers_mut());

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = target_uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::Http(format!("Invalid Host header: {}", e)))?;
            req.headers_mut().insert(HOST, value);
        }
    }
    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copies status, every end-to-end header value, and the streamed body.
fn copy_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = response.into_parts();
    let mut out = Response::new(body.boxed());
    *out.status_mut() = parts.status;

    let headers = out.headers_mut();
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    out
}
