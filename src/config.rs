use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 4099;
pub const DEFAULT_UPSTREAM: &str = "127.0.0.1:3999";
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
/// Same ceiling Go's net/http server applies to a request head.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1 << 20;

/// Listen host alias for every interface.
const ALL_INTERFACES: &str = "all";
const LOOPBACK: &str = "127.0.0.1";

fn default_listen_host() -> String {
    DEFAULT_LISTEN_HOST.to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_string()
}

fn default_dial_timeout_secs() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

/// Multi-target logging section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub listen_address: Option<SocketAddr>,
    #[serde(default = "default_metrics_endpoint")]
    pub metrics_endpoint: String,
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            metrics_endpoint: default_metrics_endpoint(),
            health_endpoint: default_health_endpoint(),
        }
    }
}

/// Where outbound connections go. Exactly one mode is active per instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSpec {
    /// Dial destinations directly.
    Direct,
    /// Every connection goes through one SOCKS5 proxy.
    Single(String),
    /// Each connection picks one SOCKS5 proxy at random. An empty pool fails every dial.
    Pool(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Single SOCKS5 upstream, used when no list is configured.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// SOCKS5 upstreams picked at random per connection. Wins over `upstream`.
    #[serde(default)]
    pub upstream_list: Vec<String>,
    /// Skip SOCKS5 entirely. Wins over both upstream settings.
    #[serde(default)]
    pub bypass: bool,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Extra PEM roots trusted for `https` origins, on top of the platform roots.
    #[serde(default)]
    pub origin_ca_file: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            upstream: default_upstream(),
            upstream_list: Vec::new(),
            bypass: false,
            dial_timeout_secs: default_dial_timeout_secs(),
            max_header_size: default_max_header_size(),
            origin_ca_file: None,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            logging: None,
            monitoring: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Host to bind, with `all` mapped to the wildcard address.
    pub fn bind_host(&self) -> &str {
        if self.listen_host == ALL_INTERFACES {
            "0.0.0.0"
        } else {
            &self.listen_host
        }
    }

    pub fn listen_addr(&self) -> String {
        let host = self.bind_host();
        if host.contains(':') {
            format!("[{}]:{}", host, self.listen_port)
        } else {
            format!("{}:{}", host, self.listen_port)
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Resolves the active upstream mode: bypass, then a non-empty list, then the single address.
    pub fn upstream_spec(&self) -> UpstreamSpec {
        if self.bypass {
            return UpstreamSpec::Direct;
        }

        let pool: Vec<String> = self
            .upstream_list
            .iter()
            .filter_map(|entry| normalize_upstream(entry))
            .collect();

        if pool.is_empty() {
            UpstreamSpec::Single(self.upstream.clone())
        } else {
            UpstreamSpec::Pool(pool)
        }
    }
}

/// Normalizes one upstream list entry.
///
/// Returns `None` for blank entries. An all-digit entry is a port on the loopback address.
pub fn normalize_upstream(entry: &str) -> Option<String> {
    let item = entry.trim();
    if item.is_empty() {
        return None;
    }
    if item.bytes().all(|b| b.is_ascii_digit()) {
        return Some(format!("{}:{}", LOOPBACK, item));
    }
    Some(item.to_string())
}

/// Parses a comma-separated upstream list such as `1080,192.168.1.1:1081`.
pub fn parse_upstream_list(value: &str) -> Vec<String> {
    value.split(',').filter_map(normalize_upstream).collect()
}
