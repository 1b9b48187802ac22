use crate::integration::test_utils::{orchestrator, panel, settings};
use futures::StreamExt;
use komagen::error::{JobError, SessionError};
use komagen::generation::BatchJob;
use komagen::service::{ScriptedOutcome, ScriptedService};
use komagen::session::{JobEventKind, JobStatus, SessionManager};
use komagen::types::CandidateId;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn opening_a_session_closes_and_cancels_the_previous_one() {
    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_secs(5)));
    let orchestrator = orchestrator(&service, Vec::new(), settings(1, 0));
    let manager = SessionManager::new();

    let first = manager.open("chapter 1");
    let handle = orchestrator
        .submit(&first, BatchJob::new(vec![panel(0, "slow", &[])]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = manager.open("chapter 2");
    assert!(!first.is_open());
    assert!(second.is_open());
    assert_ne!(first.id(), second.id());
    assert_eq!(manager.current().unwrap().id(), second.id());

    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert!(matches!(
        orchestrator.submit(&first, BatchJob::new(vec![panel(1, "late", &[])])),
        Err(JobError::Session(SessionError::Closed))
    ));

    assert!(manager.close());
    assert!(!manager.close());
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn session_stream_sees_every_job_and_ends_on_close() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, Vec::new(), settings(2, 0));
    let manager = SessionManager::new();
    let session = manager.open("stream");
    let stream = session.subscribe();

    let a = orchestrator
        .submit(&session, BatchJob::new(vec![panel(0, "a", &[])]))
        .unwrap();
    let b = orchestrator
        .submit(&session, BatchJob::new(vec![panel(1, "b", &[])]))
        .unwrap();
    a.wait().await.unwrap();
    b.wait().await.unwrap();
    manager.close();

    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.len(), 6);
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    let terminal_jobs: Vec<_> = events
        .iter()
        .filter(|e| e.kind.is_terminal())
        .map(|e| e.job_id)
        .collect();
    assert_eq!(terminal_jobs.len(), 2);
    assert!(terminal_jobs.contains(&a.id()) && terminal_jobs.contains(&b.id()));
    assert_eq!(session.events(Some(a.id())).len(), 3);
}

#[tokio::test]
async fn selecting_a_candidate_discards_the_rest() {
    let service = Arc::new(ScriptedService::new());
    service.push_outcome(ScriptedOutcome::Images(3));
    let orchestrator = orchestrator(&service, Vec::new(), settings(1, 0));
    let manager = SessionManager::new();
    let session = manager.open("pick");

    let request = panel(0, "three takes", &[]);
    let id = request.id;
    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![request]))
        .unwrap();
    handle.wait().await.unwrap();

    let result = session.result(id).unwrap();
    assert_eq!(result.candidates.len(), 3);
    assert!(session.events(Some(handle.id())).iter().any(|e| matches!(
        e.kind,
        JobEventKind::RequestSucceeded { candidates: 3, .. }
    )));

    let chosen = result.candidates[1].clone();
    let selected = session.select_candidate(id, &chosen.id).unwrap();
    assert_eq!(selected.bytes, chosen.bytes);
    assert!(session.result(id).unwrap().candidates.is_empty());
    assert_eq!(
        session.select_candidate(id, &chosen.id),
        Err(SessionError::CandidateNotFound {
            request: id,
            candidate: chosen.id.clone(),
        })
    );
    assert!(matches!(
        session.select_candidate(komagen::types::RequestId::next(), &CandidateId::for_bytes(b"x")),
        Err(SessionError::UnknownRequest(_))
    ));
}
