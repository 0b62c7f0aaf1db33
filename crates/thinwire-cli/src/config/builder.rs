//! Configuration builder

use std::time::Duration;

use thinwire::{ConnectDescriptor, Credentials, PoolConfig, SecurityOptions, SessionOptions};
use url::Url;

use crate::{Error, Result};

const DEFAULT_LOG_LEVEL: &str = "warn";

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub descriptor: ConnectDescriptor,
    pub credentials: Credentials,
    pub session: SessionOptions,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }
}

/// Collects settings from file, environment and flags; later calls win.
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    connection_url: Option<Url>,
    username: Option<String>,
    password: Option<String>,
    encryption: Option<bool>,
    network_timeout: Option<Duration>,
    pool_min: Option<usize>,
    pool_max: Option<usize>,
    pool_increment: Option<usize>,
    idle_timeout: Option<Duration>,
    prefetch_rows: Option<u32>,
    autocommit: Option<bool>,
    log_level: Option<String>,
    json_logs: Option<bool>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection_url(mut self, url: Url) -> Self {
        self.connection_url = Some(url);
        self
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub const fn encryption(mut self, encryption: bool) -> Self {
        self.encryption = Some(encryption);
        self
    }

    #[must_use]
    pub const fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn pool_min(mut self, min: usize) -> Self {
        self.pool_min = Some(min);
        self
    }

    #[must_use]
    pub const fn pool_max(mut self, max: usize) -> Self {
        self.pool_max = Some(max);
        self
    }

    #[must_use]
    pub const fn pool_increment(mut self, increment: usize) -> Self {
        self.pool_increment = Some(increment);
        self
    }

    /// Idle sessions older than this are closed. Zero keeps them forever.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn prefetch_rows(mut self, rows: u32) -> Self {
        self.prefetch_rows = Some(rows);
        self
    }

    #[must_use]
    pub const fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = Some(autocommit);
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    #[must_use]
    pub const fn json_logs(mut self, json: bool) -> Self {
        self.json_logs = Some(json);
        self
    }

    /// Resolve the collected settings.
    ///
    /// Credentials set explicitly take precedence over the URL userinfo.
    pub fn build(self) -> Result<Config> {
        let mut url = self
            .connection_url
            .ok_or_else(|| Error::Config("connection URL is required".into()))?;

        let mut descriptor = ConnectDescriptor::from_url(&url)?;
        if let Some(encryption) = self.encryption {
            let security = SecurityOptions {
                encryption,
                ..descriptor.security().clone()
            };
            descriptor = descriptor.with_security(security);
        }

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|()| Error::Config("failed to set username in URL".into()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| Error::Config("failed to set password in URL".into()))?;
        }
        let credentials = Credentials::from_url(&url)
            .ok_or_else(|| Error::Config("username is required".into()))?;

        let mut session = SessionOptions::default().program("thinwire-cli");
        if let Some(timeout) = self.network_timeout {
            session = session.network_timeout((!timeout.is_zero()).then_some(timeout));
        }
        if let Some(rows) = self.prefetch_rows {
            session = session.prefetch_rows(rows);
        }
        if let Some(autocommit) = self.autocommit {
            session = session.autocommit(autocommit);
        }

        let defaults = PoolConfig::default();
        let min = self.pool_min.unwrap_or(defaults.min);
        let max = self.pool_max.unwrap_or_else(|| defaults.max.max(min));
        let mut pool = defaults
            .size(min, max)
            .increment(self.pool_increment.unwrap_or(1));
        if let Some(timeout) = self.idle_timeout {
            pool = pool.max_idle_time((!timeout.is_zero()).then_some(timeout));
        }
        pool.validate()?;

        let logging = LoggingConfig {
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            json_logs: self.json_logs.unwrap_or(false),
        };

        Ok(Config {
            descriptor,
            credentials,
            session,
            pool,
            logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_build_requires_url() {
        let err = ConfigBuilder::new().build().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_build_requires_username() {
        let err = ConfigBuilder::new()
            .connection_url(url("thin://db:1521/orcl"))
            .build()
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_credentials_from_url() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://scott:tiger@db:1521/orcl"))
            .build()
            .unwrap();
        assert_eq!(config.credentials.username(), "scott");
        assert_eq!(config.descriptor.service(), "orcl");
    }

    #[test]
    fn test_explicit_username_overrides_url() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://scott:tiger@db:1521/orcl"))
            .username("hr")
            .build()
            .unwrap();
        assert_eq!(config.credentials.username(), "hr");
    }

    #[test]
    fn test_encryption_override() {
        let config = ConfigBuilder::new()
            .connection_url(url("thins://u@db/orcl"))
            .encryption(false)
            .build()
            .unwrap();
        assert!(!config.descriptor.security().encryption);
    }

    #[test]
    fn test_pool_settings() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://u@db/orcl"))
            .pool_min(2)
            .pool_max(6)
            .pool_increment(2)
            .idle_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.pool.min, 2);
        assert_eq!(config.pool.max, 6);
        assert_eq!(config.pool.increment, 2);
        assert_eq!(config.pool.max_idle_time, None);
    }

    #[test]
    fn test_pool_max_defaults_to_at_least_min() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://u@db/orcl"))
            .pool_min(12)
            .build()
            .unwrap();
        assert_eq!(config.pool.max, 12);
    }

    #[test]
    fn test_inconsistent_pool_rejected() {
        let err = ConfigBuilder::new()
            .connection_url(url("thin://u@db/orcl"))
            .pool_min(4)
            .pool_max(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Database(ref e) if e.is_config()));
    }

    #[test]
    fn test_zero_network_timeout_blocks_forever() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://u@db/orcl"))
            .network_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.session.network_timeout, None);
    }

    #[test]
    fn test_logging_defaults() {
        let config = ConfigBuilder::new()
            .connection_url(url("thin://u@db/orcl"))
            .build()
            .unwrap();
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
