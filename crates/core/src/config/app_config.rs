use crate::config::{validate_identifier, ConfigError};
use crate::logging::LogFormat;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::invalid_value(
                "environment",
                s,
                "development, testing, or production",
            )),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_str = match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Production => "production",
        };
        write!(f, "{}", env_str)
    }
}

impl Environment {
    /// Check if environment is production
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// TLS mode used when `DATABASE_SSL_MODE` is not set
    pub fn default_tls_mode(&self) -> TlsMode {
        if self.is_production() {
            TlsMode::Require
        } else {
            TlsMode::Disable
        }
    }
}

/// TLS negotiation mode handed to the database driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Disable,
    Prefer,
    Require,
}

impl FromStr for TlsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "off" | "false" => Ok(TlsMode::Disable),
            "prefer" => Ok(TlsMode::Prefer),
            "require" | "on" | "true" => Ok(TlsMode::Require),
            _ => Err(ConfigError::invalid_value(
                "database_ssl_mode",
                s,
                "disable, prefer, or require",
            )),
        }
    }
}

/// Connection and pool settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub tls_mode: TlsMode,
    pub max_connections: u32,
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
    /// Include raw parameter values in statement logs
    pub log_query_params: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            tls_mode: TlsMode::Disable,
            max_connections: 20,
            idle_timeout: Some(Duration::from_millis(30_000)),
            acquire_timeout: Duration::from_millis(2_000),
            log_query_params: false,
        }
    }
}

impl DatabaseConfig {
    /// The configured URL, or an error naming the variable to set
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url.as_deref().ok_or_else(|| {
            ConfigError::missing_required(
                "database_url",
                "Set DATABASE_URL or pass --database-url",
            )
        })
    }
}

/// Where migration files live and which table tracks them
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub directory: PathBuf,
    pub table: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            table: "migrations".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub migrations: MigrationSettings,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig::default(),
            migrations: MigrationSettings::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(env_str) = get("ENVIRONMENT") {
            config.environment = env_str.parse()?;
        }

        config.database.url = get("DATABASE_URL");
        config.database.tls_mode = match get("DATABASE_SSL_MODE") {
            Some(mode) => mode.parse()?,
            None => config.environment.default_tls_mode(),
        };

        if let Some(max) = get("DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = parse_number(
                "database_max_connections",
                &max,
                "a positive integer",
            )?;
        }

        if let Some(idle) = get("DATABASE_IDLE_TIMEOUT_MS") {
            let millis: u64 =
                parse_number("database_idle_timeout_ms", &idle, "milliseconds (0 disables)")?;
            config.database.idle_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Some(acquire) = get("DATABASE_ACQUIRE_TIMEOUT_MS") {
            let millis: u64 =
                parse_number("database_acquire_timeout_ms", &acquire, "milliseconds")?;
            config.database.acquire_timeout = Duration::from_millis(millis);
        }

        if let Some(flag) = get("DATABASE_LOG_QUERY_PARAMS") {
            config.database.log_query_params = parse_flag("database_log_query_params", &flag)?;
        }

        if let Some(dir) = get("MIGRATIONS_DIR") {
            config.migrations.directory = PathBuf::from(dir);
        }

        if let Some(table) = get("MIGRATIONS_TABLE") {
            config.migrations.table = table;
        }

        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        if let Some(format) = get("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid_value(
                "database_max_connections",
                "0",
                "at least 1",
            ));
        }

        if self.database.acquire_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "database_acquire_timeout_ms",
                "0",
                "a timeout greater than zero",
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::invalid_value(
                "log_level",
                self.log_level.clone(),
                format!("one of: {}", valid_levels.join(", ")),
            ));
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::invalid_value(
                    "database_url",
                    redact_url(url),
                    "a postgres:// or postgresql:// URL",
                ));
            }
        }

        validate_identifier("migrations_table", &self.migrations.table)
    }
}

fn parse_number<T: FromStr>(field: &str, value: &str, expected: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_value(field, value, expected))
}

fn parse_flag(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid_value(field, value, "true or false")),
    }
}

/// Strip the password from a connection URL so it can be logged
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}
