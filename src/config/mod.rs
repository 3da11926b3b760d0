//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, the optional
//! `config/default.{toml,json,yaml}` file, then `STREAMHUB__*` environment
//! variables (`STREAMHUB__SERVER__PORT=9000`).

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    ClientSettings, ConnectionSettings, EngineSettings, LoggingSettings, ServerSettings, Settings,
};

pub const ENV_PREFIX: &str = "STREAMHUB";

/// Loads the configuration from the default file and environment variables
/// and merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}

#[cfg(test)]
mod tests;
