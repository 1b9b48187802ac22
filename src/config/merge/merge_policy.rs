//! Merge rules: defaults first, later sources override earlier ones key by key.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("service.base_url", "http://127.0.0.1:7860")?
        .set_default("orchestrator.max_concurrent", 2)?
        .set_default("orchestrator.max_retries", 1)?
        .set_default("orchestrator.missing_character", "degrade")
}
