//! Story import: the story document model and its expansion into a batch job.

use crate::character::CharacterSet;
use crate::config::{GenerationDefaults, ImageSize};
use crate::error::ApiError;
use crate::generation::plan::BatchJob;
use crate::types::{
    Character, CharacterBinding, CharacterId, GenerationRequest, PanelRef, RegionLayout, RequestId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Appended to a character's prompt when generating its reference sheet.
pub const CHARACTER_REFERENCE_TAGS: &str = "expressionless, front view, looking at viewer, standing, full body, simple background, white background";

pub const DEFAULT_TEMPLATE: &str = "4panel_2x2";

/// Page height over page width, close to B5/A4.
const PAGE_ASPECT: f32 = 1.414;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryCharacter {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDialogue {
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_bubble_type")]
    pub bubble_type: String,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default = "default_text_color")]
    pub color: String,
    #[serde(default = "default_true")]
    pub vertical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPanel {
    #[serde(default)]
    pub panel_index: u32,
    #[serde(default)]
    pub scene_description: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default = "default_composition")]
    pub composition: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub dialogues: Vec<StoryDialogue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPage {
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub panels: Vec<StoryPanel>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorySpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<StoryCharacter>,
    #[serde(default)]
    pub pages: Vec<StoryPage>,
}

fn default_bubble_type() -> String {
    "SPEECH".to_string()
}

fn default_text_color() -> String {
    "#000000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_composition() -> String {
    "medium_shot".to_string()
}

fn default_page_number() -> u32 {
    1
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

impl StorySpec {
    pub fn from_json_str(raw: &str) -> Result<Self, ApiError> {
        serde_json::from_str(raw).map_err(|e| ApiError::StoryError(format!("Invalid story: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn character(&self, id: &str) -> Option<&StoryCharacter> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub fn panel_count(&self) -> usize {
        self.pages.iter().map(|p| p.panels.len()).sum()
    }

    /// Every problem with the document, empty when it can be planned.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.pages.is_empty() {
            problems.push("story defines no pages".to_string());
        }
        for page in &self.pages {
            if page.panels.is_empty() {
                problems.push(format!("page {}: no panels", page.page_number));
            }
            for panel in &page.panels {
                let at = PanelRef::new(page.page_number, panel.panel_index);
                if panel.prompt.trim().is_empty() && panel.scene_description.trim().is_empty() {
                    problems.push(format!("{}: neither prompt nor scene description", at));
                }
                for id in &panel.characters {
                    if self.character(id).is_none() {
                        problems.push(format!("{}: undefined character '{}'", at, id));
                    }
                }
            }
        }
        problems
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ApiError::StoryError(problems.join("; ")))
        }
    }

    /// Pages by page number, each with its panels by panel index.
    pub fn sorted_pages(&self) -> Vec<(&StoryPage, Vec<&StoryPanel>)> {
        let mut pages: Vec<&StoryPage> = self.pages.iter().collect();
        pages.sort_by_key(|p| p.page_number);
        pages
            .into_iter()
            .map(|page| {
                let mut panels: Vec<&StoryPanel> = page.panels.iter().collect();
                panels.sort_by_key(|p| p.panel_index);
                (page, panels)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelOrientation {
    Portrait,
    Landscape,
}

/// Rows of a page template, top to bottom: (share of page height, panels in the row).
fn template_rows(template: &str) -> Option<&'static [(f32, u32)]> {
    const THIRD: f32 = 1.0 / 3.0;
    let rows: &'static [(f32, u32)] = match template {
        "3panel_vertical" => &[(THIRD, 1), (THIRD, 1), (THIRD, 1)],
        "4panel_vertical" => &[(0.25, 1), (0.25, 1), (0.25, 1), (0.25, 1)],
        "4panel_2x2" => &[(0.5, 2), (0.5, 2)],
        "5panel_mixed" => &[(0.4, 1), (0.3, 2), (0.3, 2)],
        "6panel_2x3" => &[(THIRD, 2), (THIRD, 2), (THIRD, 2)],
        "6panel_3x2" => &[(0.5, 3), (0.5, 3)],
        _ => return None,
    };
    Some(rows)
}

/// Panels a page template lays out; unknown templates count as four.
pub fn template_panel_count(template: &str) -> usize {
    template_rows(template)
        .map(|rows| rows.iter().map(|(_, n)| *n as usize).sum())
        .unwrap_or(4)
}

/// Orientation of each panel slot of a template, in reading order.
pub fn template_orientations(template: &str) -> Vec<PanelOrientation> {
    let rows = template_rows(template)
        .or_else(|| template_rows(DEFAULT_TEMPLATE))
        .unwrap_or(&[]);
    rows.iter()
        .flat_map(|(height, columns)| {
            let width = 1.0 / *columns as f32;
            let orientation = if width >= height * PAGE_ASPECT {
                PanelOrientation::Landscape
            } else {
                PanelOrientation::Portrait
            };
            std::iter::repeat(orientation).take(*columns as usize)
        })
        .collect()
}

/// Story panel as planned, for callers that place results back onto pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedPanel {
    pub request_id: RequestId,
    pub target: PanelRef,
    pub orientation: PanelOrientation,
    pub composition: String,
    pub dialogues: Vec<StoryDialogue>,
}

#[derive(Debug, Clone)]
pub struct StoryPlan {
    pub title: String,
    pub job: BatchJob,
    pub panels: Vec<PlannedPanel>,
    /// Reference request per character, in the order they were first cited
    pub references: Vec<(CharacterId, RequestId)>,
}

/// Expand a validated story into a batch job.
///
/// Story characters bind to project characters by id, then by normalized name; the rest
/// become characters of the job alone. A cited character gets a reference request when
/// it has no reference image yet (or always, with `regenerate_references`).
pub fn plan_story(
    story: &StorySpec,
    project: &CharacterSet,
    defaults: &GenerationDefaults,
) -> Result<StoryPlan, ApiError> {
    story.validate()?;

    let mut bound: HashMap<&str, CharacterId> = HashMap::new();
    let mut transient = CharacterSet::new();
    for story_character in &story.characters {
        let id = CharacterId::from(story_character.id.as_str());
        let existing = project
            .get(&id)
            .or_else(|| project.find_by_name(&story_character.name));
        let resolved = match existing {
            Some(character) => character.id.clone(),
            None => {
                let name = if story_character.name.trim().is_empty() {
                    story_character.id.clone()
                } else {
                    story_character.name.clone()
                };
                let mut character = Character::new(id.clone(), name).with_prompt(&story_character.prompt);
                character.appearance = story_character.appearance.clone();
                character.personality = story_character.personality.clone();
                debug!(character = %id, "Story character has no project counterpart");
                transient.insert(character);
                id
            }
        };
        bound.insert(story_character.id.as_str(), resolved);
    }
    let known = project.layered(&transient);

    let mut requests = Vec::new();
    let mut references: Vec<(CharacterId, RequestId)> = Vec::new();
    for (_, panels) in story.sorted_pages() {
        for panel in panels {
            for story_id in &panel.characters {
                let Some(id) = bound.get(story_id.as_str()) else {
                    continue;
                };
                if references.iter().any(|(existing, _)| existing == id) {
                    continue;
                }
                let has_reference = known
                    .get(id)
                    .map(|c| !c.reference_images.is_empty())
                    .unwrap_or(false);
                if has_reference && !defaults.regenerate_references {
                    continue;
                }
                let request = GenerationRequest::reference(
                    id.clone(),
                    join_prompt(&[CHARACTER_REFERENCE_TAGS, &defaults.common_prompt]),
                )
                .with_negative(defaults.common_negative_prompt.clone())
                .with_sampling(defaults.sampling(defaults.reference_size));
                references.push((id.clone(), request.id));
                requests.push(request);
            }
        }
    }

    let mut planned = Vec::new();
    for (page, panels) in story.sorted_pages() {
        let orientations = template_orientations(&page.template);
        for (slot, panel) in panels.into_iter().enumerate() {
            let orientation = orientations
                .get(slot)
                .copied()
                .unwrap_or(PanelOrientation::Portrait);
            let size = size_for(orientation, defaults);
            let target = PanelRef::new(page.page_number, panel.panel_index);
            let body = if panel.prompt.trim().is_empty() {
                &panel.scene_description
            } else {
                &panel.prompt
            };
            let mut request = GenerationRequest::panel(
                target,
                join_prompt(&[body, &defaults.common_prompt]),
            )
            .with_negative(join_prompt(&[
                &panel.negative_prompt,
                &defaults.common_negative_prompt,
            ]))
            .with_sampling(defaults.sampling(size));

            let mut cited = 0usize;
            for story_id in &panel.characters {
                if let Some(id) = bound.get(story_id.as_str()) {
                    if !request.characters.iter().any(|b| &b.character == id) {
                        request = request.with_character(CharacterBinding::new(id.clone()));
                        cited += 1;
                    }
                }
            }
            if cited >= 2 {
                request = request
                    .with_layout(RegionLayout::even(defaults.region_split))
                    .with_face_correction(defaults.face_correction);
            }

            planned.push(PlannedPanel {
                request_id: request.id,
                target,
                orientation,
                composition: panel.composition.clone(),
                dialogues: panel.dialogues.clone(),
            });
            requests.push(request);
        }
    }

    info!(
        title = %story.title,
        references = references.len(),
        panels = planned.len(),
        transient_characters = transient.len(),
        "Story planned"
    );
    Ok(StoryPlan {
        title: story.title.clone(),
        job: BatchJob::new(requests).with_characters(transient),
        panels: planned,
        references,
    })
}

fn size_for(orientation: PanelOrientation, defaults: &GenerationDefaults) -> ImageSize {
    match orientation {
        PanelOrientation::Portrait => defaults.portrait_size,
        PanelOrientation::Landscape => defaults.landscape_size,
    }
}

fn join_prompt(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
