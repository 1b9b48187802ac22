use crate::integration::test_utils::{orchestrator, panel, record_events, seq_of, settings};
use futures::StreamExt;
use komagen::config::MissingCharacterPolicy;
use komagen::error::ServiceError;
use komagen::generation::BatchJob;
use komagen::service::{CallPhase, ScriptedOutcome, ScriptedService, ServiceCapabilities};
use komagen::session::{GenerationSession, JobEventKind, JobStatus, RequestState};
use komagen::types::{Character, GenerationRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn hana() -> Character {
    Character::new("hana", "Hana").with_prompt("hana, short silver hair")
}

fn ken() -> Character {
    Character::new("ken", "Ken").with_prompt("ken, tall, glasses")
}

/// Payload of the first started call whose prompt contains `needle`.
fn started_payload(service: &ScriptedService, needle: &str) -> komagen::service::ServicePayload {
    service
        .log()
        .into_iter()
        .find(|call| call.phase == CallPhase::Started && call.payload.prompt.contains(needle))
        .map(|call| call.payload)
        .unwrap_or_else(|| panic!("no call with prompt containing {:?}", needle))
}

#[tokio::test]
async fn reference_completes_before_dependent_panel_starts() {
    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_millis(10)));
    let orchestrator = orchestrator(&service, vec![hana()], settings(2, 0));
    let session = GenerationSession::new("refs");
    let events = record_events(&session);

    let reference = GenerationRequest::reference("hana", "reference sheet");
    let with_hana = panel(0, "hana waves", &["hana"]);
    let scenery = panel(1, "empty street", &[]);
    let (ref_id, hana_id, scenery_id) = (reference.id, with_hana.id, scenery.id);

    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![with_hana, scenery, reference]))
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Completed);

    let events = events.lock().clone();
    let reference_done = seq_of(&events, "request_succeeded", ref_id).unwrap();
    let panel_started = seq_of(&events, "request_started", hana_id).unwrap();
    assert!(reference_done < panel_started);
    assert!(seq_of(&events, "request_succeeded", scenery_id).is_some());

    // The panel is conditioned on the image the reference request produced.
    let generated = session.result(ref_id).unwrap().candidates[0].bytes.clone();
    let payload = started_payload(&service, "hana waves");
    let adapter = payload.feature_adapter.expect("adapter attached");
    assert_eq!(*adapter.image, generated);
    assert!(payload.prompt.starts_with("hana, short silver hair"));
}

#[tokio::test]
async fn failed_reference_leaves_dependents_prompt_only() {
    let service = Arc::new(ScriptedService::new());
    service.rule(
        "reference sheet",
        ScriptedOutcome::Fail(ServiceError::Rejected("nsfw filter".into())),
    );
    let orchestrator = orchestrator(&service, vec![hana()], settings(2, 1));
    let session = GenerationSession::new("refs");

    let reference = GenerationRequest::reference("hana", "reference sheet");
    let with_hana = panel(0, "hana waves", &["hana"]);
    let (ref_id, hana_id) = (reference.id, with_hana.id);
    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![reference, with_hana]))
        .unwrap();
    handle.wait().await.unwrap();

    assert_eq!(session.request_state(ref_id), Some(RequestState::Failed));
    assert_eq!(session.request_state(hana_id), Some(RequestState::Succeeded));
    assert!(started_payload(&service, "hana waves").feature_adapter.is_none());

    // Rejections are not retried.
    let failures = session.failures(handle.id());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, "rejected");
    assert_eq!(failures[0].attempts, 1);
    assert_eq!(service.call_count(), 2);
}

#[tokio::test]
async fn in_flight_calls_never_exceed_the_limit() {
    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_millis(20)));
    let orchestrator = orchestrator(&service, Vec::new(), settings(2, 0));
    let session = GenerationSession::new("limit");

    let first = orchestrator
        .submit(
            &session,
            BatchJob::new((0..5).map(|i| panel(i, &format!("a{}", i), &[]))),
        )
        .unwrap();
    let second = orchestrator
        .submit(
            &session,
            BatchJob::new((0..3).map(|i| panel(i, &format!("b{}", i), &[]))),
        )
        .unwrap();
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    assert_eq!(service.call_count(), 8);
    assert_eq!(service.max_in_flight(), 2);
    assert_eq!(first.summary().unwrap().succeeded, 5);
    assert_eq!(second.summary().unwrap().succeeded, 3);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let service = Arc::new(ScriptedService::new());
    service.push_outcome(ScriptedOutcome::Fail(ServiceError::Timeout(
        "no response in 600s".into(),
    )));
    let orchestrator = orchestrator(&service, Vec::new(), settings(1, 1));
    let session = GenerationSession::new("retry");
    let events = record_events(&session);

    let request = panel(0, "rain", &[]);
    let id = request.id;
    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![request]))
        .unwrap();
    handle.wait().await.unwrap();

    let result = session.result(id).unwrap();
    assert_eq!(result.attempts, 2);
    assert_eq!(service.call_count(), 2);

    let retried: Vec<u32> = events
        .lock()
        .iter()
        .filter_map(|e| match &e.kind {
            JobEventKind::RequestRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retried, vec![1]);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_request() {
    let service = Arc::new(ScriptedService::new());
    service.rule(
        "doomed",
        ScriptedOutcome::Fail(ServiceError::Unreachable("connection refused".into())),
    );
    let orchestrator = orchestrator(&service, Vec::new(), settings(2, 2));
    let session = GenerationSession::new("retry");

    let doomed = panel(0, "doomed", &[]);
    let fine = panel(1, "fine", &[]);
    let (doomed_id, fine_id) = (doomed.id, fine.id);
    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![doomed, fine]))
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Completed);

    assert_eq!(session.request_state(doomed_id), Some(RequestState::Failed));
    assert_eq!(session.request_state(fine_id), Some(RequestState::Succeeded));
    let failure = &session.failures(handle.id())[0];
    assert_eq!(failure.request_id, doomed_id);
    assert_eq!(failure.kind, "unreachable");
    assert_eq!(failure.attempts, 3);
    assert_eq!(service.call_count(), 4);
}

#[tokio::test]
async fn cancel_stops_dispatch_and_skips_the_rest() {
    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_millis(10)));
    let orchestrator = orchestrator(&service, Vec::new(), settings(1, 0));
    let session = GenerationSession::new("cancel");
    let events = record_events(&session);

    let handle = orchestrator
        .submit(
            &session,
            BatchJob::new((0..4).map(|i| panel(i, &format!("p{}", i), &[]))),
        )
        .unwrap();
    let signal = session.cancel_signal(handle.id()).unwrap();
    session.observe(move |event| {
        if matches!(event.kind, JobEventKind::RequestSucceeded { .. }) {
            signal.cancel();
        }
    });

    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    let summary = handle.summary().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(service.call_count(), 1);

    let events = events.lock().clone();
    let last = events.last().unwrap();
    assert!(matches!(
        last.kind,
        JobEventKind::JobCancelled {
            succeeded: 1,
            failed: 0,
            skipped: 3
        }
    ));
    assert!(!handle.cancel());
}

#[tokio::test]
async fn cancel_between_reference_and_panels_dispatches_no_panel() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, vec![hana()], settings(2, 0));
    let session = GenerationSession::new("cancel");
    let events = record_events(&session);

    let reference = GenerationRequest::reference("hana", "reference sheet");
    let ref_id = reference.id;
    let job = BatchJob::new(vec![
        panel(0, "hana waves", &["hana"]),
        panel(1, "hana sits", &["hana"]),
        reference,
    ]);
    let handle = orchestrator.submit(&session, job).unwrap();
    let signal = session.cancel_signal(handle.id()).unwrap();
    session.observe(move |event| {
        if matches!(event.kind, JobEventKind::RequestSucceeded { request_id, .. } if request_id == ref_id)
        {
            signal.cancel();
        }
    });

    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert_eq!(service.started_prompts(), vec!["reference sheet".to_string()]);

    let events = events.lock().clone();
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e.kind {
            JobEventKind::RequestStarted { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![ref_id]);
    assert!(matches!(
        events.last().unwrap().kind,
        JobEventKind::JobCancelled {
            succeeded: 1,
            failed: 0,
            skipped: 2
        }
    ));
}

#[tokio::test]
async fn cancel_before_any_request_starts() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, vec![hana()], settings(2, 0));
    let session = GenerationSession::new("cancel");
    let events = record_events(&session);

    let job = BatchJob::new(vec![
        GenerationRequest::reference("hana", "reference sheet"),
        panel(0, "hana waves", &["hana"]),
    ]);
    let handle = orchestrator.submit(&session, job).unwrap();
    assert!(handle.cancel());

    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert_eq!(service.call_count(), 0);
    let kinds: Vec<&str> = events.lock().iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["job_cancelled"]);
    assert_eq!(handle.summary().unwrap().skipped, 2);
}

#[tokio::test]
async fn observer_can_resubmit_and_close_the_session() {
    let service = Arc::new(ScriptedService::new());
    service.push_outcome(ScriptedOutcome::Fail(ServiceError::Rejected("queue full".into())));
    let orchestrator = orchestrator(&service, Vec::new(), settings(1, 0));
    let session = GenerationSession::new("retry");

    let job = BatchJob::new(vec![panel(0, "rooftop", &[])]);
    let first_id = job.id;
    let retried: Arc<parking_lot::Mutex<Option<komagen::generation::JobHandle>>> =
        Arc::default();
    {
        let (orchestrator, session_ref, slot) =
            (orchestrator.clone(), session.clone(), Arc::clone(&retried));
        session.observe(move |event| {
            if !matches!(event.kind, JobEventKind::JobCompleted { .. }) {
                return;
            }
            if event.job_id == first_id {
                let handle = orchestrator.resubmit_failed(&session_ref, first_id).unwrap();
                *slot.lock() = Some(handle);
            } else {
                session_ref.close();
            }
        });
    }

    let first = orchestrator.submit(&session, job).unwrap();
    assert_eq!(first.wait().await.unwrap(), JobStatus::Completed);
    let retry = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(handle) = retried.lock().clone() {
                break handle;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(retry.wait().await.unwrap(), JobStatus::Completed);
    assert_eq!(retry.summary().unwrap().succeeded, 1);

    // The session stays usable from other threads after observers called back into it.
    let closed = session.clone();
    let subscribed = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || closed.subscribe()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(subscribed.count().await, 0);
    assert!(!session.is_open());
}

#[tokio::test]
async fn cancel_abandons_requests_in_flight() {
    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_secs(5)));
    let orchestrator = orchestrator(&service, Vec::new(), settings(2, 0));
    let session = GenerationSession::new("cancel");

    let handle = orchestrator
        .submit(
            &session,
            BatchJob::new(vec![panel(0, "slow", &[]), panel(1, "slower", &[])]),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    assert!(orchestrator.cancel(&handle));
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.summary().unwrap().skipped, 2);
    assert!(handle.results().is_empty());
}

#[tokio::test]
async fn progress_stream_replays_and_ends_with_the_job() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, Vec::new(), settings(2, 0));
    let session = GenerationSession::new("progress");

    let handle = orchestrator
        .submit(
            &session,
            BatchJob::new(vec![panel(0, "one", &[]), panel(1, "two", &[])]),
        )
        .unwrap();
    let live: Vec<_> = orchestrator.progress(&handle).unwrap().collect().await;
    let replayed: Vec<_> = handle.events().unwrap().collect().await;

    assert_eq!(live, replayed);
    assert_eq!(live.len(), 5);
    assert!(live.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert!(matches!(
        live.last().unwrap().kind,
        JobEventKind::JobCompleted {
            succeeded: 2,
            failed: 0,
            skipped: 0
        }
    ));
}

#[tokio::test]
async fn dangling_character_degrades_to_prompt_only() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, vec![hana()], settings(1, 0));
    let session = GenerationSession::new("dangling");

    let request = panel(0, "ghost story", &["ghost"]);
    let id = request.id;
    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![request]))
        .unwrap();
    handle.wait().await.unwrap();

    assert_eq!(session.request_state(id), Some(RequestState::Succeeded));
    let payload = started_payload(&service, "ghost story");
    assert!(payload.feature_adapter.is_none());
    assert!(payload.regions.is_none());
}

#[tokio::test]
async fn dangling_character_fails_under_strict_policy() {
    let service = Arc::new(ScriptedService::new());
    let mut strict = settings(1, 3);
    strict.missing_character = MissingCharacterPolicy::Fail;
    let orchestrator = orchestrator(&service, Vec::new(), strict);
    let session = GenerationSession::new("strict");

    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![panel(0, "ghost story", &["ghost"])]))
        .unwrap();
    handle.wait().await.unwrap();

    let failures = session.failures(handle.id());
    assert_eq!(failures[0].kind, "character_not_found");
    assert_eq!(failures[0].attempts, 1);
    assert_eq!(service.call_count(), 0);
}

#[tokio::test]
async fn two_characters_compose_by_region() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, vec![hana(), ken()], settings(1, 0));
    let session = GenerationSession::new("regions");

    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![panel(0, "argument", &["hana", "ken"])]))
        .unwrap();
    handle.wait().await.unwrap();

    let payload = started_payload(&service, "argument");
    let regions = payload.regions.expect("regions attached");
    assert_eq!(regions.region_prompts.len(), 2);
    assert!(regions.region_prompts[0].contains("silver hair"));
    assert!(regions.region_prompts[1].contains("glasses"));
    assert!((regions.ratios.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    assert!(payload.feature_adapter.is_none());
}

#[tokio::test]
async fn missing_capability_is_a_rejection() {
    let service = Arc::new(ScriptedService::new().with_capabilities(ServiceCapabilities {
        multi_region: false,
        ..ServiceCapabilities::assumed()
    }));
    let orchestrator = orchestrator(&service, vec![hana(), ken()], settings(1, 2));
    let session = GenerationSession::new("caps");

    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![panel(0, "argument", &["hana", "ken"])]))
        .unwrap();
    handle.wait().await.unwrap();

    let failure = &session.failures(handle.id())[0];
    assert_eq!(failure.kind, "rejected");
    assert!(failure.message.contains("multi-region"));
    assert_eq!(failure.attempts, 1);
    assert_eq!(service.call_count(), 0);
}

#[tokio::test]
async fn unreachable_probe_falls_back_to_assumed_capabilities() {
    let service = Arc::new(ScriptedService::new().unreachable());
    let orchestrator = orchestrator(&service, vec![hana(), ken()], settings(1, 0));
    let session = GenerationSession::new("offline-probe");

    let handle = orchestrator
        .submit(&session, BatchJob::new(vec![panel(0, "argument", &["hana", "ken"])]))
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Completed);
    assert_eq!(handle.summary().unwrap().succeeded, 1);
    assert!(orchestrator.endpoint().is_none());
}

#[tokio::test]
async fn resubmitted_panels_reuse_generated_references() {
    let service = Arc::new(ScriptedService::new());
    let orchestrator = orchestrator(&service, vec![hana()], settings(2, 0));
    let session = GenerationSession::new("resubmit");

    let reference = GenerationRequest::reference("hana", "reference sheet");
    let ref_id = reference.id;
    let flaky = panel(0, "hana runs", &["hana"]);
    let job = BatchJob::new(vec![reference, flaky]);
    service.rule(
        "hana runs",
        ScriptedOutcome::Fail(ServiceError::Rejected("queue full".into())),
    );
    let first = orchestrator.submit(&session, job).unwrap();
    first.wait().await.unwrap();
    assert_eq!(first.summary().unwrap().failed, 1);

    let retry = orchestrator.resubmit_failed(&session, first.id()).unwrap();
    retry.wait().await.unwrap();
    let summary = retry.summary().unwrap();
    assert_eq!(summary.total, 1);

    // The resubmitted panel still carries the first job's generated reference.
    let generated = session.result(ref_id).unwrap().candidates[0].bytes.clone();
    let calls: Vec<_> = service
        .log()
        .into_iter()
        .filter(|c| c.phase == CallPhase::Started && c.payload.prompt.contains("hana runs"))
        .collect();
    assert_eq!(calls.len(), 2);
    let adapter = calls[1].payload.feature_adapter.as_ref().unwrap();
    assert_eq!(*adapter.image, generated);
}
