//! Structured logging setup shared by the CLI and library consumers.

use crate::config::{AppConfig, ConfigError, Environment};
use std::io;
use std::str::FromStr;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::invalid_value("log_format", s, "text, pretty, or json")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    pub format: LogFormat,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports directives like "strata_orm=debug,sqlx=warn")
    pub env_filter: Option<String>,
    pub service_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            include_location: false,
            env_filter: None,
            service_name: None,
        }
    }
}

impl LoggingConfig {
    /// Create production logging configuration
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_location: false,
            env_filter: Some("info,sqlx=warn".to_string()),
            service_name: None,
        }
    }

    /// Create test logging configuration (minimal output)
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            format: LogFormat::Text,
            include_location: false,
            env_filter: None,
            service_name: None,
        }
    }

    /// Derive logging settings from the application configuration.
    ///
    /// Production switches to JSON unless a format was set explicitly.
    pub fn from_app_config(config: &AppConfig) -> Self {
        let base = match config.environment {
            Environment::Production => Self::production(),
            Environment::Testing => Self::test(),
            Environment::Development => Self::default(),
        };

        let format = if config.environment.is_production() && config.log_format == LogFormat::Text
        {
            LogFormat::Json
        } else {
            config.log_format
        };

        Self {
            level: config.log_level.clone(),
            format,
            env_filter: None,
            ..base
        }
    }

    /// Set service name
    pub fn with_service(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn filter_directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize structured logging.
///
/// Logs are written to stderr so command output on stdout stays clean.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    let base = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(base.json())
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(base.pretty())
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(base)
            .try_init()?,
    }

    tracing::debug!(
        target: "strata::logging",
        level = %config.level,
        format = ?config.format,
        service = config.service_name.as_deref().unwrap_or("strata"),
        "Structured logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_production_defaults_to_json() {
        let app = AppConfig {
            environment: Environment::Production,
            ..AppConfig::default()
        };
        let logging = LoggingConfig::from_app_config(&app);
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(logging.level, "info");

        let app = AppConfig {
            environment: Environment::Production,
            log_format: LogFormat::Pretty,
            ..AppConfig::default()
        };
        assert_eq!(LoggingConfig::from_app_config(&app).format, LogFormat::Pretty);
    }

    #[test]
    fn test_filter_directive_prefers_explicit_filter() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter_directive(), "info");

        let config = config.with_env_filter("strata_orm=trace");
        assert_eq!(config.filter_directive(), "strata_orm=trace");
    }

    #[test]
    fn test_init_twice_reports_error() {
        let first = init_logging(LoggingConfig::test());
        let second = init_logging(LoggingConfig::test());
        // Only one global subscriber can be installed per process.
        assert!(first.is_err() || second.is_err());
    }
}
