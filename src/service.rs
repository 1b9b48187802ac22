//! Service Client
//!
//! Protocol adapter for the external text-to-image service. Callers hand over fully
//! resolved payloads; the client only encodes them, enforces per-call timeouts and maps
//! every failure into a [`ServiceError`]. It never retries.

use crate::error::ServiceError;
use crate::types::{SamplingParams, SplitDirection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod http;
pub mod scripted;
mod wire;

pub use http::ForgeClient;
pub use scripted::{CallPhase, ScriptedOutcome, ScriptedService, ServiceCall};

/// Model used for the feature adapter when the probe could not name one.
pub const DEFAULT_ADAPTER_MODEL: &str = "ip-adapter-plus_sdxl_vit-h";
/// Model used for pose conditioning when the probe could not name one.
pub const DEFAULT_POSE_MODEL: &str = "control_v11p_sd15_openpose";

/// Reference image and strength for the feature adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterAttachment {
    pub image: Arc<Vec<u8>>,
    pub strength: f32,
    pub model: String,
}

/// Skeleton image constraining the composition.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseAttachment {
    pub image: Vec<u8>,
    pub weight: f32,
    pub model: String,
}

/// Per-region prompts for multi-character composition. `ratios` sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionAttachment {
    pub direction: SplitDirection,
    pub ratios: Vec<f32>,
    pub region_prompts: Vec<String>,
}

/// A fully resolved generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePayload {
    /// Shared prompt; with regions attached it covers background and composition
    pub prompt: String,
    pub negative_prompt: String,
    pub sampling: SamplingParams,
    pub feature_adapter: Option<AdapterAttachment>,
    pub pose: Option<PoseAttachment>,
    pub regions: Option<RegionAttachment>,
    pub face_correction: bool,
}

impl ServicePayload {
    pub fn text_only(prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            sampling,
            feature_adapter: None,
            pose: None,
            regions: None,
            face_correction: false,
        }
    }
}

/// Images returned by one call, with the seeds the service reported.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawImageSet {
    pub images: Vec<Vec<u8>>,
    pub seeds: Vec<i64>,
}

impl RawImageSet {
    /// Seed of image `index`; services that report one seed use it for every image.
    pub fn seed_for(&self, index: usize) -> Option<i64> {
        self.seeds.get(index).or_else(|| self.seeds.first()).copied()
    }
}

/// Optional extensions discovered by the availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceCapabilities {
    /// Feature adapter model, when one is installed
    pub feature_adapter: Option<String>,
    /// Pose conditioning model, when one is installed
    pub pose_conditioning: Option<String>,
    pub multi_region: bool,
    pub face_correction: bool,
}

impl ServiceCapabilities {
    /// Everything on, with default model names. Used when the probe itself failed.
    pub fn assumed() -> Self {
        Self {
            feature_adapter: Some(DEFAULT_ADAPTER_MODEL.to_string()),
            pose_conditioning: Some(DEFAULT_POSE_MODEL.to_string()),
            multi_region: true,
            face_correction: true,
        }
    }
}

/// Snapshot of the service as last probed. Jobs hold one snapshot for their whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpointConfig {
    pub base_url: String,
    /// Answered the reachability probe
    pub available: bool,
    /// Loaded checkpoint, if reported
    pub model: Option<String>,
    pub capabilities: ServiceCapabilities,
    pub checked_at: DateTime<Utc>,
}

impl ServiceEndpointConfig {
    /// Snapshot for a service that has not been (or could not be) probed.
    pub fn assumed(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            available: false,
            model: None,
            capabilities: ServiceCapabilities::assumed(),
            checked_at: Utc::now(),
        }
    }
}

/// Generation service client trait
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Issue one text-to-image call.
    async fn generate(&self, payload: &ServicePayload) -> Result<RawImageSet, ServiceError>;

    /// Probe reachability and installed capabilities.
    async fn check_availability(&self) -> Result<ServiceEndpointConfig, ServiceError>;

    /// Base URL or other label identifying the service in logs.
    fn endpoint_label(&self) -> &str;
}
