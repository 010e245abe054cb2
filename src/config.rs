//! Application configuration loading and validation.
//!
//! Reads a single TOML file, applies defaults for anything unspecified, and
//! rejects invalid combinations before any connection is opened.

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Drivers the built-in store registry knows about.
pub const SUPPORTED_DRIVERS: &[&str] = &["sqlx", "memory"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported database driver {driver:?}: must be one of {SUPPORTED_DRIVERS:?}")]
    UnsupportedDriver { driver: String },
    #[error(
        "leader election timings must satisfy retry_period < renew_deadline < lease_duration"
    )]
    InvalidLeaseTimings,
    #[error("leader election requires the \"sqlx\" database driver")]
    LeaderElectionRequiresSqlx,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub chat: ChatConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub telemetry: Option<TelemetryConfig>,
    pub leader_election: LeaderElectionConfig,
}

/// Chat-platform credentials. The token authenticates the gateway session;
/// slash commands are registered against the given guild.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ChatConfig {
    pub token: String,
    pub guild_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
    pub driver: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            sslmode: "disable".to_string(),
            driver: "sqlx".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Postgres connection options for this config.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let ssl_mode: PgSslMode = self.sslmode.parse()?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
            .ssl_mode(ssl_mode))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub port: u16,
    /// Seconds to wait for in-flight work on shutdown.
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            shutdown_timeout: 15,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// OTLP collector endpoint. Span export is disabled when empty.
    pub otlp_endpoint: String,
    /// Allow plain HTTP export when the endpoint carries no scheme.
    pub insecure: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "dkpbot".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: String::new(),
            insecure: false,
        }
    }
}

/// Leader election settings. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    /// How long a holder keeps the lease without renewing it.
    pub lease_duration: u64,
    /// How long the leader keeps retrying a failed renewal before giving up.
    pub renew_deadline: u64,
    /// Time between acquire/renew attempts.
    pub retry_period: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "dkpbot-leader".to_string(),
            lease_namespace: "default".to_string(),
            lease_duration: 15,
            renew_deadline: 10,
            retry_period: 2,
        }
    }
}

impl LeaderElectionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period)
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_DRIVERS.contains(&self.database.driver.as_str()) {
            return Err(ConfigError::UnsupportedDriver {
                driver: self.database.driver.clone(),
            });
        }

        let le = &self.leader_election;
        if !(le.retry_period < le.renew_deadline && le.renew_deadline < le.lease_duration) {
            return Err(ConfigError::InvalidLeaseTimings);
        }
        if le.enabled && self.database.driver != "sqlx" {
            return Err(ConfigError::LeaderElectionRequiresSqlx);
        }
        Ok(())
    }
}
