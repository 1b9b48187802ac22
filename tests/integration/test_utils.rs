//! Shared fixtures for integration tests

use komagen::character::CharacterSet;
use komagen::config::OrchestratorConfig;
use komagen::generation::BatchOrchestrator;
use komagen::service::ScriptedService;
use komagen::session::{GenerationSession, JobEvent};
use komagen::types::{Character, CharacterBinding, GenerationRequest, PanelRef, RequestId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Settings with no retry delay so retry tests run instantly.
pub fn settings(max_concurrent: usize, max_retries: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent,
        max_retries,
        retry_delay_ms: 0,
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(
    service: &Arc<ScriptedService>,
    characters: Vec<Character>,
    settings: OrchestratorConfig,
) -> BatchOrchestrator {
    BatchOrchestrator::new(
        Arc::clone(service) as Arc<dyn komagen::service::GenerationService>,
        Arc::new(CharacterSet::from_characters(characters)),
        settings,
    )
}

pub fn panel(index: u32, prompt: &str, characters: &[&str]) -> GenerationRequest {
    characters.iter().fold(
        GenerationRequest::panel(PanelRef::new(1, index), prompt),
        |request, id| request.with_character(CharacterBinding::new(*id)),
    )
}

/// Records every event the session emits, in delivery order.
pub fn record_events(session: &GenerationSession) -> Arc<Mutex<Vec<JobEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.observe(move |event| sink.lock().push(event.clone()));
    seen
}

/// Seq of the first event of `name` for `request`.
pub fn seq_of(events: &[JobEvent], name: &str, request: RequestId) -> Option<u64> {
    events
        .iter()
        .find(|e| e.kind.as_str() == name && e.kind.request_id() == Some(request))
        .map(|e| e.seq)
}
