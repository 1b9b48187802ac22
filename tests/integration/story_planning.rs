use crate::integration::test_utils::{orchestrator, record_events, seq_of, settings};
use komagen::character::CharacterSet;
use komagen::config::GenerationDefaults;
use komagen::error::ApiError;
use komagen::generation::story::PanelOrientation;
use komagen::generation::{plan_story, StorySpec};
use komagen::service::ScriptedService;
use komagen::session::{GenerationSession, JobStatus};
use komagen::types::{Character, CharacterId, RequestPurpose};
use std::sync::Arc;

const STORY: &str = r#"{
  "title": "Rooftop",
  "characters": [
    {"id": "c1", "name": "Hana", "prompt": "ignored, project wins"},
    {"id": "mob", "name": "Delivery Boy", "prompt": "boy, red cap"}
  ],
  "pages": [
    {
      "page_number": 2,
      "template": "4panel_2x2",
      "panels": [
        {"panel_index": 0, "scene_description": "hana alone at night", "characters": ["c1"]}
      ]
    },
    {
      "page_number": 1,
      "template": "4panel_vertical",
      "panels": [
        {"panel_index": 1, "prompt": "empty rooftop, wide shot"},
        {
          "panel_index": 0,
          "prompt": "hana takes a parcel",
          "negative_prompt": "blurry",
          "characters": ["c1", "mob"],
          "composition": "close_up",
          "dialogues": [{"speaker": "mob", "text": "Sign here."}]
        }
      ]
    }
  ]
}"#;

fn project() -> CharacterSet {
    CharacterSet::from_characters(vec![Character::new("hana", "ＨＡＮＡ")
        .with_prompt("hana, short silver hair")
        .with_reference("/refs/hana.png")])
}

fn defaults() -> GenerationDefaults {
    GenerationDefaults {
        common_prompt: "monochrome, screentone".to_string(),
        ..GenerationDefaults::default()
    }
}

#[test]
fn story_expands_into_references_then_panels() {
    let story = StorySpec::from_json_str(STORY).unwrap();
    let plan = plan_story(&story, &project(), &defaults()).unwrap();

    assert_eq!(plan.title, "Rooftop");
    // Hana binds to the project character by name and already has a reference.
    assert_eq!(plan.references.len(), 1);
    assert_eq!(plan.references[0].0, CharacterId::new("mob"));
    assert!(plan.job.characters().contains(&CharacterId::new("mob")));
    assert!(!plan.job.characters().contains(&CharacterId::new("hana")));

    let requests = plan.job.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[0].purpose.is_reference());
    assert_eq!(requests[0].sampling.width, 768);
    assert!(requests[0].prompt.ends_with("monochrome, screentone"));

    // Panels follow page then panel order.
    let targets: Vec<(u32, u32)> = plan
        .panels
        .iter()
        .map(|p| (p.target.page, p.target.panel))
        .collect();
    assert_eq!(targets, vec![(1, 0), (1, 1), (2, 0)]);

    let duo = &requests[1];
    assert_eq!(duo.id, plan.panels[0].request_id);
    assert_eq!(duo.prompt, "hana takes a parcel, monochrome, screentone");
    assert!(duo.negative_prompt.starts_with("blurry, lowres"));
    let cited: Vec<&str> = duo.cited_characters().map(CharacterId::as_str).collect();
    assert_eq!(cited, vec!["hana", "mob"]);
    assert!(duo.layout.is_some());
    assert!(duo.face_correction);
    assert_eq!(plan.job.dependencies(duo.id), &[plan.references[0].1]);
    assert_eq!(plan.panels[0].composition, "close_up");
    assert_eq!(plan.panels[0].dialogues[0].text, "Sign here.");

    // Vertical strips are landscape, 2x2 cells portrait.
    assert_eq!(plan.panels[0].orientation, PanelOrientation::Landscape);
    assert_eq!((duo.sampling.width, duo.sampling.height), (1216, 832));
    assert_eq!(plan.panels[2].orientation, PanelOrientation::Portrait);
    let night = &requests[3];
    assert_eq!(night.prompt, "hana alone at night, monochrome, screentone");
    assert!(night.layout.is_none());
    assert!(matches!(night.purpose, RequestPurpose::Panel { .. }));
}

#[test]
fn regenerate_references_covers_every_cited_character() {
    let story = StorySpec::from_json_str(STORY).unwrap();
    let mut defaults = defaults();
    defaults.regenerate_references = true;
    let plan = plan_story(&story, &project(), &defaults).unwrap();

    let referenced: Vec<&str> = plan.references.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(referenced, vec!["hana", "mob"]);
}

#[test]
fn invalid_story_is_rejected_with_every_problem() {
    let story = StorySpec::from_json_str(
        r#"{"pages": [{"panels": [{"panel_index": 0, "characters": ["nobody"]}]}]}"#,
    )
    .unwrap();
    let err = plan_story(&story, &project(), &defaults()).unwrap_err();
    let ApiError::StoryError(message) = err else {
        panic!("expected a story error, got {:?}", err);
    };
    assert!(message.contains("neither prompt nor scene description"));
    assert!(message.contains("undefined character 'nobody'"));
}

#[test]
fn malformed_json_is_a_story_error() {
    assert!(matches!(
        StorySpec::from_json_str("{\"pages\": 3}"),
        Err(ApiError::StoryError(_))
    ));
}

#[tokio::test]
async fn planned_story_runs_to_completion() {
    let story = StorySpec::from_json_str(STORY).unwrap();
    let plan = plan_story(&story, &project(), &defaults()).unwrap();
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(
        &service,
        project().iter().cloned().collect(),
        settings(2, 0),
    );
    let session = GenerationSession::new(plan.title.clone());
    let events = record_events(&session);

    let reference = plan.references[0].1;
    let duo = plan.panels[0].request_id;
    let handle = orchestrator.submit(&session, plan.job).unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Completed);
    assert_eq!(handle.summary().unwrap().succeeded, 4);

    let events = events.lock().clone();
    assert!(
        seq_of(&events, "request_succeeded", reference).unwrap()
            < seq_of(&events, "request_started", duo).unwrap()
    );
}
