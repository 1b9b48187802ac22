//! Characters and the consistency data derived from them.

use crate::error::ApiError;
use crate::types::{Character, CharacterId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

pub mod layout;
pub mod resolver;

pub use resolver::{
    AdapterReference, ConsistencyResolver, ReferenceOverride, ReferenceOverrides,
    ReferenceSource, RegionBinding, Resolution, ResolvedCharacterPayload,
};

/// Normalized form used to match character names typed by different people or tools:
/// NFKC (full-width and half-width forms collapse), trimmed, lowercased.
pub fn normalize_name(name: &str) -> String {
    name.nfkc().collect::<String>().trim().to_lowercase()
}

/// The characters of a project, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterSet {
    by_id: BTreeMap<CharacterId, Character>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CharacterFile {
    List(Vec<Character>),
    Wrapped { characters: Vec<Character> },
}

impl CharacterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_characters(characters: impl IntoIterator<Item = Character>) -> Self {
        let mut set = Self::new();
        for character in characters {
            set.insert(character);
        }
        set
    }

    /// Load a JSON file holding either a list of characters or `{"characters": [...]}`.
    pub fn load_json(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)?;
        let file: CharacterFile = serde_json::from_str(&raw)?;
        let characters = match file {
            CharacterFile::List(list) => list,
            CharacterFile::Wrapped { characters } => characters,
        };
        // Relative reference paths are relative to the file that names them.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::from_characters(characters.into_iter().map(
            |mut character| {
                for reference in &mut character.reference_images {
                    if reference.is_relative() {
                        *reference = base.join(&*reference);
                    }
                }
                character
            },
        )))
    }

    /// Insert or replace by id.
    pub fn insert(&mut self, character: Character) -> Option<Character> {
        self.by_id.insert(character.id.clone(), character)
    }

    pub fn get(&self, id: &CharacterId) -> Option<&Character> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &CharacterId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Character> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        self.by_id
            .values()
            .find(|character| normalize_name(&character.name) == wanted)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Character> {
        self.by_id.values()
    }

    /// This set plus the characters of `extra` whose ids it lacks. Entries here win.
    pub fn layered(&self, extra: &CharacterSet) -> CharacterSet {
        let mut merged = self.clone();
        for character in extra.iter() {
            if !merged.contains(&character.id) {
                merged.insert(character.clone());
            }
        }
        merged
    }
}
