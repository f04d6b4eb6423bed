//! Startup validation of a loaded [`Config`].
//!
//! Errors abort startup. Warnings and suggestions are logged and ignored.
//! A malformed upstream address is only a warning: it fails when dialed.

use std::path::Path;

use crate::config::{Config, normalize_upstream};

const MIN_HEADER_SIZE: usize = 1024;

/// Validation outcome
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_listener(&mut result);
        self.validate_upstreams(&mut result);
        self.validate_limits(&mut result);
        self.validate_monitoring(&mut result);

        result
    }

    fn validate_listener(&self, result: &mut ValidationResult) {
        if self.config.listen_host.trim().is_empty() {
            result.add_error("Listen host cannot be empty".to_string());
        }

        match self.config.listen_port {
            0 => result.add_error("Listen port cannot be 0".to_string()),
            port if port < 1024 => result.add_warning(format!(
                "Using privileged port {} - may require elevated privileges",
                port
            )),
            _ => {}
        }
    }

    fn validate_upstreams(&self, result: &mut ValidationResult) {
        let list: Vec<String> = self
            .config
            .upstream_list
            .iter()
            .filter_map(|entry| normalize_upstream(entry))
            .collect();

        if self.config.bypass {
            if !list.is_empty() {
                result.add_warning(
                    "Upstream list is ignored because bypass is enabled".to_string(),
                );
            }
            return;
        }

        if list.is_empty() {
            if !self.config.upstream_list.is_empty() {
                result.add_warning(format!(
                    "Upstream list has no usable entries, falling back to {}",
                    self.config.upstream
                ));
            }
            if let Err(e) = validate_upstream_addr(&self.config.upstream) {
                result.add_warning(format!(
                    "Upstream '{}' looks invalid ({}); requests will fail when dialing it",
                    self.config.upstream, e
                ));
            }
            return;
        }

        for entry in &list {
            if let Err(e) = validate_upstream_addr(entry) {
                result.add_warning(format!(
                    "Upstream list entry '{}' looks invalid ({}); connections that pick it will fail",
                    entry, e
                ));
            }
        }

        if self.config.upstream != crate::config::DEFAULT_UPSTREAM {
            result.add_warning(format!(
                "Single upstream {} is ignored because an upstream list is configured",
                self.config.upstream
            ));
        }
        if list.len() == 1 {
            result.add_suggestion(
                "An upstream list with one entry behaves like a single upstream".to_string(),
            );
        }
    }

    fn validate_limits(&self, result: &mut ValidationResult) {
        if self.config.dial_timeout_secs == 0 {
            result.add_error("Dial timeout must be at least 1 second".to_string());
        } else if self.config.dial_timeout_secs > 120 {
            result.add_warning(format!(
                "Dial timeout of {}s leaves clients waiting a long time on dead upstreams",
                self.config.dial_timeout_secs
            ));
        }

        if self.config.max_header_size < MIN_HEADER_SIZE {
            result.add_error(format!(
                "Max header size {} is below the minimum of {} bytes",
                self.config.max_header_size, MIN_HEADER_SIZE
            ));
        }

        if let Some(path) = &self.config.origin_ca_file {
            if !Path::new(path).is_file() {
                result.add_error(format!("Origin CA file not found: {}", path));
            }
        }
    }

    fn validate_monitoring(&self, result: &mut ValidationResult) {
        let Some(monitoring) = &self.config.monitoring else {
            return;
        };

        if let Some(addr) = monitoring.listen_address {
            if addr.port() == self.config.listen_port && addr.port() != 0 {
                result.add_error(format!(
                    "Monitoring port {} conflicts with the proxy listen port",
                    addr.port()
                ));
            }
        }

        for endpoint in [&monitoring.metrics_endpoint, &monitoring.health_endpoint] {
            if !endpoint.starts_with('/') {
                result.add_error(format!("Monitoring endpoint '{}' must start with '/'", endpoint));
            }
        }
        if monitoring.metrics_endpoint == monitoring.health_endpoint {
            result.add_error("Metrics and health endpoints must differ".to_string());
        }
    }
}

/// Checks that `addr` is `host:port` with a non-zero port.
fn validate_upstream_addr(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}'", port)),
        Ok(_) => Ok(()),
    }
}
