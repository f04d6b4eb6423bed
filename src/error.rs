use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Dial {addr} timed out after {secs}s")]
    Timeout { addr: String, secs: u64 },

    #[error("SOCKS5 error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Hyper error: {0}")]
    Hyper(String),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Hyper(e.to_string())
    }
}

impl From<prometheus::Error> for ProxyError {
    fn from(e: prometheus::Error) -> Self {
        ProxyError::Metrics(e.to_string())
    }
}
