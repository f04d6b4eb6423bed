use anyhow::{Context, anyhow, bail};
use clap::Parser;
use log::{error, info, warn};
use socks_bridge::config::{Config, LogFormat, LogLevel, MonitoringConfig, UpstreamSpec, parse_upstream_list};
use socks_bridge::config_validation::ConfigValidator;
use socks_bridge::logging::{self, CustomLogger};
use socks_bridge::monitoring::{MonitoringServer, ProxyMetrics};
use socks_bridge::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "HTTP proxy front end that sends all outbound traffic through SOCKS5 upstreams"
)]
struct Args {
    #[clap(long, value_name = "HOST", help = "Listen on host (ip / domain); 'all' listens on 0.0.0.0")]
    host: Option<String>,

    #[clap(long, value_name = "PORT", help = "Listen on port")]
    port: Option<u16>,

    #[clap(long, value_name = "ADDR", help = "Upstream SOCKS5 address")]
    from: Option<String>,

    #[clap(
        long,
        value_name = "LIST",
        help = "Comma-separated SOCKS5 upstreams picked at random per connection; a bare number is a localhost port. Overrides --from"
    )]
    fromlist: Vec<String>,

    #[clap(long, help = "Connect to destinations directly instead of through SOCKS5")]
    bypass: bool,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    loglevel: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for each outbound dial")]
    dial_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP request header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "FILE", help = "Extra PEM CA certificates trusted for https origins")]
    origin_ca_file: Option<String>,

    #[clap(long, value_name = "ADDR", help = "Serve /metrics and /health on this address")]
    monitoring_addr: Option<SocketAddr>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)
            .map_err(|e| anyhow!("Failed to load {}: {}", config_file, e))?
    } else {
        create_config_from_args(&args)
    };

    init_logging(&config)?;

    let validation = ConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("{}", suggestion);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    info!("Listening on {}", config.listen_addr());
    info!("Log level: {}", config.log_level);
    match config.upstream_spec() {
        UpstreamSpec::Direct => info!("Bypassing the socks5 proxy"),
        UpstreamSpec::Single(addr) => info!("Using the socks5 proxy at {}", addr),
        UpstreamSpec::Pool(pool) => info!("Upstream proxy list: {:?}", pool),
    }

    let metrics = Arc::new(ProxyMetrics::new()?);

    if let Some(monitoring) = config.monitoring.clone() {
        let server = MonitoringServer::new(monitoring, metrics.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Monitoring server error: {}", e);
            }
        });
    }

    let server = ProxyServer::bind(&config, metrics)
        .await
        .context("Server failed to start")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server.run() => {
            result.context("Server stopped")?;
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let result = match &config.logging {
        Some(logging_config) => CustomLogger::init(logging_config.clone(), config.log_level),
        None => logging::init_fallback(config.log_level, config.log_format),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let mut config = Config::default();
    config.upstream_list = vec!["1080".to_string(), "192.168.1.1:1081".to_string()];
    config.logging = Some(Default::default());
    config.monitoring = Some(MonitoringConfig {
        listen_address: Some(SocketAddr::from(([127, 0, 0, 1], 9900))),
        ..MonitoringConfig::default()
    });

    config
        .to_file(file_path)
        .map_err(|e| anyhow!("Failed to write {}: {}", file_path, e))
}

fn create_config_from_args(args: &Args) -> Config {
    let mut config = Config::default();

    if let Some(host) = &args.host {
        config.listen_host = host.clone();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(from) = &args.from {
        config.upstream = from.clone();
    }
    config.upstream_list = args
        .fromlist
        .iter()
        .flat_map(|list| parse_upstream_list(list))
        .collect();
    config.bypass = args.bypass;
    if let Some(level) = args.loglevel {
        config.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Some(secs) = args.dial_timeout {
        config.dial_timeout_secs = secs;
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = size;
    }
    if let Some(path) = &args.origin_ca_file {
        config.origin_ca_file = Some(path.clone());
    }
    if let Some(addr) = args.monitoring_addr {
        config.monitoring = Some(MonitoringConfig {
            listen_address: Some(addr),
            ..MonitoringConfig::default()
        });
    }

    config
}
