use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger writing every record to several targets, each with its own level.
pub struct CustomLogger {
    targets: Vec<LogTarget>,
    format: LogFormat,
    default_level: LogLevel,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    /// Opens every target. Targets without a level use `default_level`.
    pub fn new(config: LoggingConfig, default_level: LogLevel) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::new();

        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref()
                        .ok_or("File output type requires path")?;
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            format,
            default_level,
            writers,
        })
    }

    pub fn init(config: LoggingConfig, default_level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config, default_level)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Most verbose level any target accepts.
    pub fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|target| self.target_filter(target))
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn target_filter(&self, target: &LogTarget) -> LevelFilter {
        target.level.unwrap_or(self.default_level).to_level_filter()
    }

    fn should_log(&self, level: log::Level, target: &LogTarget) -> bool {
        level <= self.target_filter(target)
    }

    fn format_record(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| self.should_log(metadata.level(), target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = self.format_record(record);

        for (i, target) in self.targets.iter().enumerate() {
            if self.should_log(record.level(), target) {
                if let Ok(mut writer) = self.writers[i].lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn format_text(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level().to_string().to_uppercase(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

/// Plain `env_logger` setup used when the config carries no `logging` section.
///
/// `RUST_LOG` still overrides `level`.
pub fn init_fallback(level: LogLevel, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string()),
    );

    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }

    builder.try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn stdout_target(level: Option<LogLevel>) -> LogTarget {
        LogTarget {
            output_type: LogOutputType::Stdout,
            path: None,
            level,
        }
    }

    #[test]
    fn test_target_levels() {
        let config = LoggingConfig {
            format: Some(LogFormat::Text),
            targets: Some(vec![stdout_target(Some(LogLevel::Warn)), stdout_target(None)]),
        };
        let logger = CustomLogger::new(config, LogLevel::Info).unwrap();

        assert!(logger.should_log(log::Level::Error, &logger.targets[0]));
        assert!(!logger.should_log(log::Level::Info, &logger.targets[0]));
        assert!(logger.should_log(log::Level::Info, &logger.targets[1]));
        assert!(!logger.should_log(log::Level::Debug, &logger.targets[1]));
        assert_eq!(logger.max_level(), LevelFilter::Info);
    }

    #[test]
    fn test_json_line() {
        let line = format_json(
            &Record::builder()
                .args(format_args!("Using upstream {}", "127.0.0.1:1080"))
                .level(log::Level::Debug)
                .target("socks_bridge::dialer")
                .build(),
        );

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "debug");
        assert_eq!(value["target"], "socks_bridge::dialer");
        assert_eq!(value["message"], "Using upstream 127.0.0.1:1080");
    }

    #[test]
    fn test_file_target_receives_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.log");
        let config = LoggingConfig {
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: Some(path.clone()),
                level: Some(LogLevel::Info),
            }]),
        };
        let logger = CustomLogger::new(config, LogLevel::Info).unwrap();

        logger.log(
            &Record::builder()
                .args(format_args!("listening"))
                .level(log::Level::Info)
                .target("socks_bridge")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("noisy"))
                .level(log::Level::Debug)
                .target("socks_bridge")
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[INFO] [socks_bridge] listening"));
        assert!(!written.contains("noisy"));
    }

    #[test]
    fn test_file_target_requires_path() {
        let config = LoggingConfig {
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        };
        assert!(CustomLogger::new(config, LogLevel::Info).is_err());
    }
}
