//! Project config file source: komagen.toml and config/{env}.toml under the project root.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = "komagen.toml";

pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_CONFIG_FILE)
}

/// Add project config files to the builder.
/// Precedence: komagen.toml (base) then config/{KOMAGEN_ENV}.toml (env-specific).
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    project_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let env_name = std::env::var("KOMAGEN_ENV").unwrap_or_else(|_| "development".to_string());
    let mut builder = builder;

    let base_config_path = project_config_path(project_root);
    if base_config_path.exists() {
        builder = builder.add_source(File::from(base_config_path).required(false));
    }

    let env_config_path = project_root
        .join("config")
        .join(format!("{}.toml", env_name));
    if env_config_path.exists() {
        builder = builder.add_source(File::from(env_config_path).required(false));
    }

    Ok(builder)
}
