//! Character Consistency Resolver
//!
//! Turns the characters cited by a request into prompt fragments and reference-image
//! payloads. Read-only over character data; job-local reference images produced earlier
//! in the same job arrive as [`ReferenceOverrides`].

use crate::character::layout::{order_bindings, region_fractions};
use crate::character::CharacterSet;
use crate::error::ResolutionError;
use crate::types::{Character, CharacterBinding, CharacterId, RegionLayout, SplitDirection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Job-local reference state for a character.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceOverride {
    /// Reference produced by a reference request earlier in the job
    Generated(Arc<Vec<u8>>),
    /// The reference request failed; fall back to stored references, if any
    Unavailable,
}

pub type ReferenceOverrides = HashMap<CharacterId, ReferenceOverride>;

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceSource {
    File(PathBuf),
    Generated,
}

/// Reference image bytes and adapter strength for one character.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterReference {
    pub character: CharacterId,
    pub image: Arc<Vec<u8>>,
    pub strength: f32,
    pub source: ReferenceSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionBinding {
    pub character: CharacterId,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCharacterPayload {
    /// No characters cited
    Empty,
    /// One character: prompt fragment plus an adapter payload when a reference exists
    Single {
        character: CharacterId,
        prompt: String,
        adapter: Option<AdapterReference>,
    },
    /// Several characters, one region each. Regions carry no adapter payload.
    MultiRegion {
        direction: SplitDirection,
        ratios: Vec<f32>,
        regions: Vec<RegionBinding>,
    },
}

impl ResolvedCharacterPayload {
    pub fn adapter(&self) -> Option<&AdapterReference> {
        match self {
            ResolvedCharacterPayload::Single { adapter, .. } => adapter.as_ref(),
            _ => None,
        }
    }
}

/// Outcome of a lenient resolve: whatever could be resolved plus the dangling ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub payload: ResolvedCharacterPayload,
    pub missing: Vec<CharacterId>,
}

#[derive(Debug, Clone)]
pub struct ConsistencyResolver {
    characters: Arc<CharacterSet>,
}

impl ConsistencyResolver {
    pub fn new(characters: Arc<CharacterSet>) -> Self {
        Self { characters }
    }

    pub fn characters(&self) -> &CharacterSet {
        &self.characters
    }

    /// Resolve every binding; the first dangling id is an error.
    pub async fn resolve(
        &self,
        bindings: &[CharacterBinding],
        layout: Option<&RegionLayout>,
        overrides: &ReferenceOverrides,
    ) -> Result<ResolvedCharacterPayload, ResolutionError> {
        let resolution = self.resolve_available(bindings, layout, overrides).await;
        match resolution.missing.into_iter().next() {
            Some(id) => Err(ResolutionError::CharacterNotFound(id)),
            None => Ok(resolution.payload),
        }
    }

    /// Resolve the bindings whose characters exist and report the rest as missing.
    pub async fn resolve_available(
        &self,
        bindings: &[CharacterBinding],
        layout: Option<&RegionLayout>,
        overrides: &ReferenceOverrides,
    ) -> Resolution {
        let mut missing = Vec::new();
        let mut present: Vec<(&CharacterBinding, &Character)> = Vec::new();
        for binding in order_bindings(bindings) {
            match self.characters.get(&binding.character) {
                Some(character) => present.push((binding, character)),
                None => {
                    warn!(character = %binding.character, "Character not found in project");
                    missing.push(binding.character.clone());
                }
            }
        }

        let payload = match present.as_slice() {
            [] => ResolvedCharacterPayload::Empty,
            [(binding, character)] => ResolvedCharacterPayload::Single {
                character: character.id.clone(),
                prompt: prompt_fragment(character, binding),
                adapter: load_reference(character, overrides).await,
            },
            several => {
                let layout = layout.cloned().unwrap_or_default();
                let ratios = region_fractions(&layout.weights, several.len());
                if !layout.weights.is_empty() && layout.weights.len() != several.len() {
                    warn!(
                        weights = layout.weights.len(),
                        regions = several.len(),
                        "Region weights do not match character count; splitting evenly"
                    );
                }
                ResolvedCharacterPayload::MultiRegion {
                    direction: layout.direction,
                    ratios,
                    regions: several
                        .iter()
                        .map(|(binding, character)| RegionBinding {
                            character: character.id.clone(),
                            prompt: prompt_fragment(character, binding),
                        })
                        .collect(),
                }
            }
        };

        Resolution { payload, missing }
    }
}

/// Base prompt plus any per-request override; the display name when both are empty.
fn prompt_fragment(character: &Character, binding: &CharacterBinding) -> String {
    let parts: Vec<&str> = [
        character.base_prompt.trim(),
        binding.prompt_override.as_deref().unwrap_or("").trim(),
    ]
    .into_iter()
    .filter(|p| !p.is_empty())
    .collect();
    if parts.is_empty() {
        character.name.clone()
    } else {
        parts.join(", ")
    }
}

async fn load_reference(
    character: &Character,
    overrides: &ReferenceOverrides,
) -> Option<AdapterReference> {
    let strength = character.effective_strength();
    match overrides.get(&character.id) {
        Some(ReferenceOverride::Generated(image)) => {
            return Some(AdapterReference {
                character: character.id.clone(),
                image: Arc::clone(image),
                strength,
                source: ReferenceSource::Generated,
            });
        }
        Some(ReferenceOverride::Unavailable) => {
            debug!(character = %character.id, "Generated reference unavailable");
        }
        None => {}
    }

    for path in &character.reference_images {
        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => {
                return Some(AdapterReference {
                    character: character.id.clone(),
                    image: Arc::new(bytes),
                    strength,
                    source: ReferenceSource::File(path.clone()),
                });
            }
            Ok(_) => warn!(path = %path.display(), "Reference image is empty; skipping"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Reference image unreadable; skipping")
            }
        }
    }

    debug!(character = %character.id, "No reference image; prompt-only generation");
    None
}
