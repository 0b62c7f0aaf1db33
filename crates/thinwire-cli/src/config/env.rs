//! Environment variable loading for configuration

use std::env;
use std::time::Duration;

use url::Url;

use super::builder::ConfigBuilder;
use crate::{Error, Result};

/// Environment variable names
mod vars {
    pub const URL: &str = "THINWIRE_URL";
    pub const USER: &str = "THINWIRE_USER";
    pub const PASSWORD: &str = "THINWIRE_PASSWORD";
    pub const POOL_MIN: &str = "THINWIRE_POOL_MIN";
    pub const POOL_MAX: &str = "THINWIRE_POOL_MAX";
    pub const POOL_INCREMENT: &str = "THINWIRE_POOL_INCREMENT";
    pub const IDLE_TIMEOUT_SECS: &str = "THINWIRE_IDLE_TIMEOUT_SECS";
    pub const NETWORK_TIMEOUT_SECS: &str = "THINWIRE_NETWORK_TIMEOUT_SECS";
    pub const ENCRYPTION: &str = "THINWIRE_ENCRYPTION";
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const JSON_LOGS: &str = "THINWIRE_JSON_LOGS";

    #[cfg(test)]
    pub const ALL: &[&str] = &[
        URL,
        USER,
        PASSWORD,
        POOL_MIN,
        POOL_MAX,
        POOL_INCREMENT,
        IDLE_TIMEOUT_SECS,
        NETWORK_TIMEOUT_SECS,
        ENCRYPTION,
        RUST_LOG,
        JSON_LOGS,
    ];
}

/// Load configuration from environment variables
pub fn load_from_env(mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    if let Ok(url_str) = env::var(vars::URL) {
        let url = Url::parse(&url_str)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", vars::URL, e)))?;
        builder = builder.connection_url(url);
    }

    if let Ok(user) = env::var(vars::USER) {
        builder = builder.username(user);
    }
    if let Ok(password) = env::var(vars::PASSWORD) {
        builder = builder.password(password);
    }

    if let Some(min) = parse_var::<usize>(vars::POOL_MIN)? {
        builder = builder.pool_min(min);
    }
    if let Some(max) = parse_var::<usize>(vars::POOL_MAX)? {
        builder = builder.pool_max(max);
    }
    if let Some(increment) = parse_var::<usize>(vars::POOL_INCREMENT)? {
        builder = builder.pool_increment(increment);
    }
    if let Some(secs) = parse_var::<u64>(vars::IDLE_TIMEOUT_SECS)? {
        builder = builder.idle_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = parse_var::<u64>(vars::NETWORK_TIMEOUT_SECS)? {
        builder = builder.network_timeout(Duration::from_secs(secs));
    }

    if let Ok(val) = env::var(vars::ENCRYPTION) {
        builder = builder.encryption(parse_bool(&val));
    }

    if let Ok(level) = env::var(vars::RUST_LOG) {
        builder = builder.log_level(level);
    }
    if let Ok(val) = env::var(vars::JSON_LOGS) {
        builder = builder.json_logs(parse_bool(&val));
    }

    Ok(builder)
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid {name}: '{raw}' is not a number"))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
