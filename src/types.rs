//! Shared data model: identifiers, characters, generation requests and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Character identifier, unique within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(String);

impl CharacterId {
    pub fn new(id: impl Into<String>) -> Self {
        CharacterId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CharacterId {
    fn from(value: &str) -> Self {
        CharacterId(value.to_string())
    }
}

impl From<String> for CharacterId {
    fn from(value: String) -> Self {
        CharacterId(value)
    }
}

/// Request ID for tracking a generation request through a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Generate the next request ID
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RequestId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Batch job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Content address of a candidate image (blake3 of its bytes, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        CandidateId(hex::encode(blake3::hash(bytes).as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, enough to tell candidates apart in listings.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const DEFAULT_ADAPTER_STRENGTH: f32 = 0.8;

fn default_adapter_strength() -> f32 {
    DEFAULT_ADAPTER_STRENGTH
}

/// A project character. Read-only to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: String,
    /// Prompt fragment that describes the character to the service
    #[serde(default, alias = "prompt")]
    pub base_prompt: String,
    /// Reference images, most canonical first
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    /// Feature adapter strength, 0.0-1.0
    #[serde(default = "default_adapter_strength")]
    pub adapter_strength: f32,
}

impl Character {
    pub fn new(id: impl Into<CharacterId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            appearance: String::new(),
            personality: String::new(),
            base_prompt: String::new(),
            reference_images: Vec::new(),
            adapter_strength: DEFAULT_ADAPTER_STRENGTH,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_prompt = prompt.into();
        self
    }

    pub fn with_reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_images.push(path.into());
        self
    }

    pub fn with_adapter_strength(mut self, strength: f32) -> Self {
        self.adapter_strength = strength;
        self
    }

    /// Strength clamped into the valid range; out-of-range values come from hand-edited files.
    pub fn effective_strength(&self) -> f32 {
        if self.adapter_strength.is_nan() {
            return DEFAULT_ADAPTER_STRENGTH;
        }
        self.adapter_strength.clamp(0.0, 1.0)
    }
}

/// Position of a panel within a story: page number and panel index on that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PanelRef {
    pub page: u32,
    pub panel: u32,
}

impl PanelRef {
    pub fn new(page: u32, panel: u32) -> Self {
        Self { page, panel }
    }
}

impl fmt::Display for PanelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} panel {}", self.page, self.panel)
    }
}

/// What a request produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPurpose {
    /// Canonical look of a character, consumed by later panel requests
    CharacterReference { character: CharacterId },
    /// Image for a story panel
    Panel { target: PanelRef },
}

impl RequestPurpose {
    pub fn is_reference(&self) -> bool {
        matches!(self, RequestPurpose::CharacterReference { .. })
    }

    pub fn label(&self) -> String {
        match self {
            RequestPurpose::CharacterReference { character } => format!("reference {}", character),
            RequestPurpose::Panel { target } => target.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    /// None lets the service choose; the chosen seed is reported back on the result
    #[serde(default)]
    pub seed: Option<i64>,
    /// Number of candidates requested
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_batch_size() -> u32 {
    1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            width: 832,
            height: 1216,
            steps: 20,
            cfg_scale: 6.0,
            sampler: "Euler a".to_string(),
            seed: None,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseConditioning {
    pub image: PathBuf,
    pub weight: f32,
}

/// A character present in a panel, optionally pinned to a region of the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterBinding {
    pub character: CharacterId,
    #[serde(default)]
    pub region: Option<usize>,
    #[serde(default)]
    pub prompt_override: Option<String>,
}

impl CharacterBinding {
    pub fn new(character: impl Into<CharacterId>) -> Self {
        Self {
            character: character.into(),
            region: None,
            prompt_override: None,
        }
    }

    pub fn in_region(mut self, region: usize) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_override(mut self, prompt: impl Into<String>) -> Self {
        self.prompt_override = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDirection {
    #[default]
    Columns,
    Rows,
}

impl SplitDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitDirection::Columns => "Columns",
            SplitDirection::Rows => "Rows",
        }
    }
}

/// Region partition for multi-character panels. Empty weights mean an even split.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionLayout {
    pub direction: SplitDirection,
    #[serde(default)]
    pub weights: Vec<f32>,
}

impl RegionLayout {
    pub fn even(direction: SplitDirection) -> Self {
        Self {
            direction,
            weights: Vec::new(),
        }
    }

    pub fn weighted(direction: SplitDirection, weights: Vec<f32>) -> Self {
        Self { direction, weights }
    }
}

/// One unit of work for the generation service. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub purpose: RequestPurpose,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub pose: Option<PoseConditioning>,
    #[serde(default)]
    pub characters: Vec<CharacterBinding>,
    #[serde(default)]
    pub layout: Option<RegionLayout>,
    pub sampling: SamplingParams,
    /// Ask the service to run its face correction pass, when installed
    #[serde(default)]
    pub face_correction: bool,
}

impl GenerationRequest {
    pub fn panel(target: PanelRef, prompt: impl Into<String>) -> Self {
        Self::with_purpose(RequestPurpose::Panel { target }, prompt)
    }

    /// Reference request for `character`. The character is bound so its prompt fragment applies.
    pub fn reference(character: impl Into<CharacterId>, prompt: impl Into<String>) -> Self {
        let character = character.into();
        let mut request = Self::with_purpose(
            RequestPurpose::CharacterReference {
                character: character.clone(),
            },
            prompt,
        );
        request.characters.push(CharacterBinding::new(character));
        request
    }

    fn with_purpose(purpose: RequestPurpose, prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            purpose,
            prompt: prompt.into(),
            negative_prompt: String::new(),
            pose: None,
            characters: Vec::new(),
            layout: None,
            sampling: SamplingParams::default(),
            face_correction: false,
        }
    }

    pub fn with_negative(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    pub fn with_character(mut self, binding: CharacterBinding) -> Self {
        self.characters.push(binding);
        self
    }

    pub fn with_layout(mut self, layout: RegionLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_pose(mut self, pose: PoseConditioning) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_face_correction(mut self, enabled: bool) -> Self {
        self.face_correction = enabled;
        self
    }

    /// Same request under a fresh id, used when failed work is resubmitted as a new job.
    pub fn resubmitted(&self) -> Self {
        Self {
            id: RequestId::next(),
            ..self.clone()
        }
    }

    pub fn cited_characters(&self) -> impl Iterator<Item = &CharacterId> {
        self.characters.iter().map(|binding| &binding.character)
    }

    /// The character this request produces a reference for, if any.
    pub fn reference_for(&self) -> Option<&CharacterId> {
        match &self.purpose {
            RequestPurpose::CharacterReference { character } => Some(character),
            RequestPurpose::Panel { .. } => None,
        }
    }
}

/// One generated image with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub seed: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(bytes: Vec<u8>, seed: Option<i64>) -> Self {
        Self {
            id: CandidateId::for_bytes(&bytes),
            bytes,
            seed,
            created_at: Utc::now(),
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: RequestId,
    pub candidates: Vec<Candidate>,
    /// Wall time of the successful service call
    #[serde(with = "duration_millis")]
    pub generation_time: Duration,
    /// Attempts spent, including the successful one
    pub attempts: u32,
}

impl GenerationResult {
    pub fn seed(&self) -> Option<i64> {
        self.candidates.first().and_then(|c| c.seed)
    }
}

/// Failed outcome of a request, kept for diagnostics and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub request_id: RequestId,
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
