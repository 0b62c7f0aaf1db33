//! Configuration management
//!
//! Sources are applied in order, later ones overriding earlier ones: config
//! file, environment, command-line flags.

mod builder;
mod env;
mod file;

pub use builder::{Config, ConfigBuilder, LoggingConfig};
pub use file::find_config_file;

use crate::Result;

/// Load the first config file found, then the environment.
pub fn load_config() -> Result<ConfigBuilder> {
    let mut builder = ConfigBuilder::new();

    if let Some(path) = file::find_config_file() {
        builder = file::load_from_file(&path, builder)?;
    }

    env::load_from_env(builder)
}

/// Load a specific config file, then the environment.
pub fn load_config_from_path(path: &std::path::Path) -> Result<ConfigBuilder> {
    let builder = file::load_from_file(path, ConfigBuilder::new())?;
    env::load_from_env(builder)
}
