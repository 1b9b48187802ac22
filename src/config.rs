//! Configuration System
//!
//! Layered configuration for the service endpoint, the orchestrator and generation defaults.
//! Sources merge in order: built-in defaults, global file, project files, environment.

use crate::error::ApiError;
use crate::logging::{validate_logging_config, LoggingConfig};
use crate::types::{SamplingParams, SplitDirection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod merge;
mod sources;

pub use sources::global_file::global_config_path;
pub use sources::project_file::{project_config_path, PROJECT_CONFIG_FILE};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KomagenConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub generation: GenerationDefaults,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Generation service endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-call limit for a generation request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Per-call limit for each capability probe call
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:7860".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// What to do when a request cites a character the project does not define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingCharacterPolicy {
    /// Generate without that character's consistency data
    #[default]
    Degrade,
    /// Fail the request with `CharacterNotFound`
    Fail,
}

/// Batch orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrency cap K shared by every job of one orchestrator
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Automatic retries R per request, for timeouts and unreachable service only
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before each retry (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub missing_character: MissingCharacterPolicy,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            missing_character: MissingCharacterPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Defaults applied when planning requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    /// Appended to every panel and reference prompt
    #[serde(default)]
    pub common_prompt: String,

    #[serde(default = "default_common_negative")]
    pub common_negative_prompt: String,

    #[serde(default = "default_steps")]
    pub steps: u32,

    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,

    #[serde(default = "default_sampler")]
    pub sampler: String,

    #[serde(default = "default_portrait_size")]
    pub portrait_size: ImageSize,

    #[serde(default = "default_landscape_size")]
    pub landscape_size: ImageSize,

    /// Resolution for character reference sheets
    #[serde(default = "default_reference_size")]
    pub reference_size: ImageSize,

    /// Split direction for multi-character panels
    #[serde(default)]
    pub region_split: SplitDirection,

    /// Face correction pass for multi-character panels
    #[serde(default = "default_true")]
    pub face_correction: bool,

    /// Generate references even for characters that already have one
    #[serde(default)]
    pub regenerate_references: bool,
}

fn default_common_negative() -> String {
    "lowres, bad anatomy, bad hands, text, error, missing fingers, worst quality, low quality"
        .to_string()
}

fn default_steps() -> u32 {
    20
}

fn default_cfg_scale() -> f32 {
    6.0
}

fn default_sampler() -> String {
    "Euler a".to_string()
}

fn default_portrait_size() -> ImageSize {
    ImageSize::new(832, 1216)
}

fn default_landscape_size() -> ImageSize {
    ImageSize::new(1216, 832)
}

fn default_reference_size() -> ImageSize {
    ImageSize::new(768, 1024)
}

fn default_true() -> bool {
    true
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            common_prompt: String::new(),
            common_negative_prompt: default_common_negative(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            sampler: default_sampler(),
            portrait_size: default_portrait_size(),
            landscape_size: default_landscape_size(),
            reference_size: default_reference_size(),
            region_split: SplitDirection::default(),
            face_correction: default_true(),
            regenerate_references: false,
        }
    }
}

impl GenerationDefaults {
    /// Sampling parameters at the given size with the configured steps, scale and sampler.
    pub fn sampling(&self, size: ImageSize) -> SamplingParams {
        SamplingParams {
            width: size.width,
            height: size.height,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            sampler: self.sampler.clone(),
            seed: None,
            batch_size: 1,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Service(String),
    Orchestrator(String),
    Generation(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Service(msg) => write!(f, "service: {}", msg),
            ValidationError::Orchestrator(msg) => write!(f, "orchestrator: {}", msg),
            ValidationError::Generation(msg) => write!(f, "generation: {}", msg),
            ValidationError::Logging(msg) => write!(f, "logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl KomagenConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !(self.service.base_url.starts_with("http://")
            || self.service.base_url.starts_with("https://"))
        {
            errors.push(ValidationError::Service(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.service.base_url
            )));
        }
        if self.service.request_timeout_secs == 0 || self.service.probe_timeout_secs == 0 {
            errors.push(ValidationError::Service(
                "timeouts must be at least one second".to_string(),
            ));
        }

        if self.orchestrator.max_concurrent == 0 {
            errors.push(ValidationError::Orchestrator(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let generation = &self.generation;
        for (name, size) in [
            ("portrait_size", generation.portrait_size),
            ("landscape_size", generation.landscape_size),
            ("reference_size", generation.reference_size),
        ] {
            if size.width == 0 || size.height == 0 || size.width % 8 != 0 || size.height % 8 != 0
            {
                errors.push(ValidationError::Generation(format!(
                    "{} must be positive multiples of 8, got {}x{}",
                    name, size.width, size.height
                )));
            }
        }
        if generation.steps == 0 {
            errors.push(ValidationError::Generation(
                "steps must be at least 1".to_string(),
            ));
        }
        if !(generation.cfg_scale > 0.0) {
            errors.push(ValidationError::Generation(
                "cfg_scale must be positive".to_string(),
            ));
        }

        if let Err(msg) = validate_logging_config(&self.logging) {
            errors.push(ValidationError::Logging(msg));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold all problems into one error.
    pub fn ensure_valid(&self) -> Result<(), ApiError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })
    }

    pub fn to_toml(&self) -> Result<String, ApiError> {
        toml::to_string_pretty(self)
            .map_err(|e| ApiError::SerializationError(format!("Failed to render config: {}", e)))
    }
}

/// Loads configuration from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a project directory.
    pub fn load(project_root: &Path) -> Result<KomagenConfig, ApiError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::project_file::add_to_builder(builder, project_root)?;
        let builder = sources::environment::add_to_builder(builder);
        let config: KomagenConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from one explicit file, still honoring environment overrides.
    pub fn load_from_file(path: &Path) -> Result<KomagenConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path.to_path_buf()).required(true));
        let builder = sources::environment::add_to_builder(builder);
        let config: KomagenConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
