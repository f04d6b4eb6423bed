use std::io;

use http::{Method, Uri};
use tokio::io::AsyncRead;

use crate::error::ProxyError;
use crate::prebuffered::Prebuffered;

const MAX_HEADERS: usize = 96;

/// Request line and routing headers of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target as sent: authority-form for CONNECT, usually absolute-form otherwise.
    pub target: String,
    pub host_header: Option<String>,
    /// Byte length of the request line plus header section.
    pub len: usize,
}

impl RequestHead {
    /// Buffers until a complete request head is available and parses it.
    ///
    /// Does not consume anything from `conn`. Returns `Ok(None)` when the client
    /// closes before sending a single byte.
    pub async fn peek<S: AsyncRead + Unpin>(
        conn: &mut Prebuffered<S>,
    ) -> Result<Option<Self>, ProxyError> {
        loop {
            if let Some(head) = Self::parse(conn.buffer())? {
                return Ok(Some(head));
            }
            if conn.is_full() {
                return Err(ProxyError::Http(
                    "request header section exceeds size limit".to_string(),
                ));
            }
            if conn.buffer_more().await? == 0 {
                if conn.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request head",
                )));
            }
        }
    }

    /// Parses a request head, returning `None` while it is incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req
            .parse(buf)
            .map_err(|e| ProxyError::Http(format!("Invalid HTTP request: {}", e)))?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::Http("Missing HTTP method".to_string()))?
            .parse::<Method>()
            .map_err(|e| ProxyError::Http(format!("Invalid HTTP method: {}", e)))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::Http("Missing request target".to_string()))?
            .to_string();
        let host_header = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(|v| v.trim().to_string());

        Ok(Some(Self {
            method,
            target,
            host_header,
            len,
        }))
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Destination host as a client would name it: the CONNECT authority,
    /// the absolute URI's authority, or the Host header.
    pub fn target_host(&self) -> String {
        if self.is_connect() {
            return self.target.clone();
        }
        if let Some(host) = &self.host_header {
            return host.clone();
        }
        self.target
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }
}
