//! TOML configuration file loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::builder::ConfigBuilder;
use crate::{Error, Result};

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &["./thinwire.toml", "~/.config/thinwire/config.toml"];

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path, builder: ConfigBuilder) -> Result<ConfigBuilder> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let file_config: FileConfig = toml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    apply_file_config(builder, file_config)
}

fn apply_file_config(mut builder: ConfigBuilder, config: FileConfig) -> Result<ConfigBuilder> {
    if let Some(conn) = config.connection {
        if let Some(url_str) = conn.url {
            let url = Url::parse(&url_str)
                .map_err(|e| Error::Config(format!("Invalid connection URL: {e}")))?;
            builder = builder.connection_url(url);
        }
        if let Some(user) = conn.user {
            builder = builder.username(user);
        }
        if let Some(password) = conn.password {
            builder = builder.password(password);
        }
        if let Some(encryption) = conn.encryption {
            builder = builder.encryption(encryption);
        }
        if let Some(secs) = conn.network_timeout_secs {
            builder = builder.network_timeout(Duration::from_secs(secs));
        }
        if let Some(rows) = conn.prefetch_rows {
            builder = builder.prefetch_rows(rows);
        }
        if let Some(autocommit) = conn.autocommit {
            builder = builder.autocommit(autocommit);
        }
    }

    if let Some(pool) = config.pool {
        if let Some(min) = pool.min {
            builder = builder.pool_min(min);
        }
        if let Some(max) = pool.max {
            builder = builder.pool_max(max);
        }
        if let Some(increment) = pool.increment {
            builder = builder.pool_increment(increment);
        }
        if let Some(secs) = pool.idle_timeout_secs {
            builder = builder.idle_timeout(Duration::from_secs(secs));
        }
    }

    if let Some(logging) = config.logging {
        if let Some(level) = logging.level {
            builder = builder.log_level(level);
        }
        if let Some(json) = logging.json {
            builder = builder.json_logs(json);
        }
    }

    Ok(builder)
}

/// Root configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    connection: Option<ConnectionSection>,
    pool: Option<PoolSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectionSection {
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    encryption: Option<bool>,
    network_timeout_secs: Option<u64>,
    prefetch_rows: Option<u32>,
    autocommit: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    min: Option<usize>,
    max: Option<usize>,
    increment: Option<usize>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingSection {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = create_temp_config(
            r#"
[connection]
url = "thin://db.example.com:1521/orcl"
user = "scott"
password = "tiger"
encryption = true
network_timeout_secs = 5
prefetch_rows = 50
autocommit = true

[pool]
min = 2
max = 5
increment = 2
idle_timeout_secs = 60

[logging]
level = "debug"
json = true
"#,
        );

        let config = load_from_file(file.path(), ConfigBuilder::new())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.descriptor.host(), "db.example.com");
        assert!(config.descriptor.security().encryption);
        assert_eq!(config.credentials.username(), "scott");
        assert_eq!(config.session.network_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.session.prefetch_rows, 50);
        assert!(config.session.autocommit);
        assert_eq!(config.pool.min, 2);
        assert_eq!(config.pool.max, 5);
        assert_eq!(config.pool.increment, 2);
        assert_eq!(config.pool.max_idle_time, Some(Duration::from_secs(60)));
        assert_eq!(config.logging.log_level, "debug");
        assert!(config.logging.json_logs);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let file = create_temp_config(
            r#"
[connection]
url = "thin://scott@db/orcl"
"#,
        );

        let config = load_from_file(file.path(), ConfigBuilder::new())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.pool.min, 1);
        assert!(!config.logging.json_logs);
    }

    #[test]
    fn test_invalid_url() {
        let file = create_temp_config(
            r#"
[connection]
url = "not a url"
"#,
        );

        let err = load_from_file(file.path(), ConfigBuilder::new()).unwrap_err();
        assert!(err.to_string().contains("Invalid connection URL"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let file = create_temp_config(
            r"
[pool]
maximum = 3
",
        );

        let err = load_from_file(file.path(), ConfigBuilder::new()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_from_file(
            Path::new("/nonexistent/thinwire.toml"),
            ConfigBuilder::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
