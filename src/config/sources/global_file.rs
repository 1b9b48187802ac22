//! Global config file source: $XDG_CONFIG_HOME/komagen/config.toml (platform config dir elsewhere).

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::debug;

/// Path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "komagen").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add the global config file to the builder if it exists.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if let Some(path) = global_config_path() {
        if path.exists() {
            builder = builder.add_source(File::from(path).required(false));
        } else {
            debug!(
                config_path = %path.display(),
                "No global configuration file; using defaults"
            );
        }
    }
    Ok(builder)
}
