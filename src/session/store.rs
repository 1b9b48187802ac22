//! Generation Session Store: job, request and result state for one workflow.
//!
//! Each mutation is applied and given its `seq` under the state lock, then queued in an
//! outbox. One caller at a time drains the outbox with no lock held, so events reach
//! subscribers and observers in `seq` order and observers may call back into the session.

use crate::character::{CharacterSet, ReferenceOverride, ReferenceOverrides};
use crate::concurrency::CancelSignal;
use crate::error::{SessionError, TaskError};
use crate::session::bus::{EventFanout, FanoutTargets, Observer, ObserverId};
use crate::session::events::{EventStream, JobEvent, JobEventKind};
use crate::session::new_session_id;
use crate::types::{
    Candidate, CandidateId, CharacterId, FailureDescriptor, GenerationRequest, GenerationResult,
    JobId, RequestId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Running => "running",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Request counts per state for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl JobSummary {
    fn count(&mut self, state: RequestState) {
        self.total += 1;
        match state {
            RequestState::Pending => self.pending += 1,
            RequestState::Running => self.running += 1,
            RequestState::Succeeded => self.succeeded += 1,
            RequestState::Failed => self.failed += 1,
            RequestState::Skipped => self.skipped += 1,
        }
    }
}

struct RequestRecord {
    job: JobId,
    request: Arc<GenerationRequest>,
    state: RequestState,
    result: Option<GenerationResult>,
    failure: Option<FailureDescriptor>,
}

struct JobRecord {
    status: JobStatus,
    order: Vec<RequestId>,
    cancel: CancelSignal,
    characters: CharacterSet,
    references: ReferenceOverrides,
    status_tx: watch::Sender<JobStatus>,
    submitted_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    next_seq: u64,
    jobs: BTreeMap<JobId, JobRecord>,
    requests: HashMap<RequestId, RequestRecord>,
    history: Vec<JobEvent>,
    fanout: EventFanout,
    outbox: VecDeque<(JobEvent, FanoutTargets)>,
    delivering: bool,
}

impl SessionState {
    fn summary(&self, job: &JobRecord) -> JobSummary {
        let mut summary = JobSummary::default();
        for id in &job.order {
            if let Some(record) = self.requests.get(id) {
                summary.count(record.state);
            }
        }
        summary
    }
}

struct SessionInner {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

/// Clears the draining flag if an observer panics, so later mutations keep delivering.
struct DrainGuard<'a>(&'a Mutex<SessionState>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

/// Shared handle to one workflow's generation state. Clones refer to the same session.
#[derive(Clone)]
pub struct GenerationSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl GenerationSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: new_session_id(),
                name: name.into(),
                created_at: Utc::now(),
                state: Mutex::new(SessionState {
                    next_seq: 1,
                    ..SessionState::default()
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.lock().closed
    }

    /// Apply `mutate` under the state lock and queue the event it returns.
    fn mutate<R>(
        &self,
        mutate: impl FnOnce(&mut SessionState) -> (R, Option<(JobId, JobEventKind)>),
    ) -> R {
        let (result, drain) = {
            let mut state = self.inner.state.lock();
            let (result, event) = mutate(&mut *state);
            let Some((job_id, kind)) = event else {
                return result;
            };
            let event = JobEvent {
                seq: state.next_seq,
                at: Utc::now(),
                job_id,
                kind,
            };
            state.next_seq += 1;
            state.history.push(event.clone());
            let targets = state.fanout.targets();
            state.outbox.push_back((event, targets));
            // Whoever is already draining (possibly this thread, from an observer)
            // delivers the new event after the ones queued before it.
            let drain = !state.delivering;
            state.delivering = true;
            (result, drain)
        };
        if drain {
            self.drain_outbox();
        }
        result
    }

    /// Deliver queued events in order until the outbox is empty.
    fn drain_outbox(&self) {
        let _guard = DrainGuard(&self.inner.state);
        loop {
            let (event, targets) = {
                let mut state = self.inner.state.lock();
                match state.outbox.pop_front() {
                    Some(next) => next,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            debug!(
                session_id = %self.inner.id,
                seq = event.seq,
                job_id = %event.job_id,
                event_type = event.kind.as_str(),
                "Job event"
            );
            targets.deliver(&event);
        }
    }

    /// Register a job and its requests as pending.
    pub fn register_job(
        &self,
        job_id: JobId,
        requests: &[Arc<GenerationRequest>],
        cancel: CancelSignal,
        characters: CharacterSet,
        references: ReferenceOverrides,
    ) -> Result<(), SessionError> {
        self.mutate(|state| {
            if state.closed {
                return (Err(SessionError::Closed), None);
            }
            let (status_tx, _) = watch::channel(JobStatus::Running);
            for request in requests {
                state.requests.insert(
                    request.id,
                    RequestRecord {
                        job: job_id,
                        request: Arc::clone(request),
                        state: RequestState::Pending,
                        result: None,
                        failure: None,
                    },
                );
            }
            state.jobs.insert(
                job_id,
                JobRecord {
                    status: JobStatus::Running,
                    order: requests.iter().map(|r| r.id).collect(),
                    cancel,
                    characters,
                    references,
                    status_tx,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
            );
            (Ok(()), None)
        })
    }

    /// Pending to running. Returns false (and emits nothing) from any other state.
    pub fn mark_running(&self, job_id: JobId, request_id: RequestId) -> bool {
        self.mutate(|state| {
            if state.closed {
                return (false, None);
            }
            match state.requests.get_mut(&request_id) {
                Some(record) if record.job == job_id && record.state == RequestState::Pending => {
                    record.state = RequestState::Running;
                    let purpose = record.request.purpose.clone();
                    (
                        true,
                        Some((
                            job_id,
                            JobEventKind::RequestStarted {
                                request_id,
                                purpose,
                            },
                        )),
                    )
                }
                _ => (false, None),
            }
        })
    }

    pub fn record_retry(&self, job_id: JobId, request_id: RequestId, attempt: u32, error: &TaskError) {
        self.mutate(|state| {
            let running = state
                .requests
                .get(&request_id)
                .map(|r| r.state == RequestState::Running)
                .unwrap_or(false);
            if state.closed || !running {
                return ((), None);
            }
            (
                (),
                Some((
                    job_id,
                    JobEventKind::RequestRetrying {
                        request_id,
                        attempt,
                        error: error.to_string(),
                    },
                )),
            )
        })
    }

    pub fn record_success(&self, job_id: JobId, result: GenerationResult) -> bool {
        self.mutate(|state| {
            if state.closed {
                return (false, None);
            }
            let request_id = result.request_id;
            match state.requests.get_mut(&request_id) {
                Some(record) if record.job == job_id && !record.state.is_terminal() => {
                    let kind = JobEventKind::RequestSucceeded {
                        request_id,
                        candidates: result.candidates.len(),
                        seed: result.seed(),
                    };
                    record.state = RequestState::Succeeded;
                    record.result = Some(result);
                    (true, Some((job_id, kind)))
                }
                _ => (false, None),
            }
        })
    }

    pub fn record_failure(&self, job_id: JobId, failure: FailureDescriptor) -> bool {
        self.mutate(|state| {
            if state.closed {
                return (false, None);
            }
            let request_id = failure.request_id;
            match state.requests.get_mut(&request_id) {
                Some(record) if record.job == job_id && !record.state.is_terminal() => {
                    let kind = JobEventKind::RequestFailed {
                        request_id,
                        kind: failure.kind.clone(),
                        message: failure.message.clone(),
                    };
                    record.state = RequestState::Failed;
                    record.failure = Some(failure);
                    (true, Some((job_id, kind)))
                }
                _ => (false, None),
            }
        })
    }

    /// Remember the reference state a job produced for a character.
    pub fn record_reference(
        &self,
        job_id: JobId,
        character: CharacterId,
        reference: ReferenceOverride,
    ) {
        self.mutate(|state| {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.references.insert(character, reference);
            }
            ((), None)
        })
    }

    /// Move a running job to its terminal status, exactly once.
    ///
    /// Requests that have not finished become `Skipped`. Returns false if the job was
    /// already terminal (or unknown), in which case nothing changes and nothing is emitted.
    pub fn finish_job(&self, job_id: JobId, status: JobStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        self.mutate(|state| {
            let order = match state.jobs.get(&job_id) {
                Some(job) if job.status == JobStatus::Running => job.order.clone(),
                _ => return (false, None),
            };
            for id in &order {
                if let Some(record) = state.requests.get_mut(id) {
                    if !record.state.is_terminal() {
                        record.state = RequestState::Skipped;
                    }
                }
            }
            let summary = match state.jobs.get(&job_id) {
                Some(job) => state.summary(job),
                None => return (false, None),
            };
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.status = status;
                job.finished_at = Some(Utc::now());
                job.status_tx.send_replace(status);
            }
            info!(
                job_id = %job_id,
                status = status.as_str(),
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Job finished"
            );
            let kind = match status {
                JobStatus::Cancelled => JobEventKind::JobCancelled {
                    succeeded: summary.succeeded,
                    failed: summary.failed,
                    skipped: summary.skipped,
                },
                _ => JobEventKind::JobCompleted {
                    succeeded: summary.succeeded,
                    failed: summary.failed,
                    skipped: summary.skipped,
                },
            };
            (true, Some((job_id, kind)))
        })
    }

    pub fn jobs(&self) -> Vec<JobId> {
        self.inner.state.lock().jobs.keys().copied().collect()
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.inner.state.lock().jobs.get(&job_id).map(|job| job.status)
    }

    pub fn job_submitted_at(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.inner.state.lock().jobs.get(&job_id).map(|job| job.submitted_at)
    }

    pub fn job_finished_at(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&job_id)
            .and_then(|job| job.finished_at)
    }

    pub fn cancel_signal(&self, job_id: JobId) -> Option<CancelSignal> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&job_id)
            .map(|job| job.cancel.clone())
    }

    pub fn summary(&self, job_id: JobId) -> Option<JobSummary> {
        let state = self.inner.state.lock();
        state.jobs.get(&job_id).map(|job| state.summary(job))
    }

    pub fn request(&self, request_id: RequestId) -> Option<Arc<GenerationRequest>> {
        self.inner
            .state
            .lock()
            .requests
            .get(&request_id)
            .map(|r| Arc::clone(&r.request))
    }

    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        self.inner
            .state
            .lock()
            .requests
            .get(&request_id)
            .map(|r| r.state)
    }

    /// Per-request state in submission order.
    pub fn request_states(&self, job_id: JobId) -> Vec<(RequestId, RequestState)> {
        let state = self.inner.state.lock();
        let Some(job) = state.jobs.get(&job_id) else {
            return Vec::new();
        };
        job.order
            .iter()
            .filter_map(|id| state.requests.get(id).map(|r| (*id, r.state)))
            .collect()
    }

    pub fn result(&self, request_id: RequestId) -> Option<GenerationResult> {
        self.inner
            .state
            .lock()
            .requests
            .get(&request_id)
            .and_then(|r| r.result.clone())
    }

    /// Successful results of a job in submission order.
    pub fn results(&self, job_id: JobId) -> Vec<GenerationResult> {
        self.collect(job_id, |r| r.result.clone())
    }

    pub fn failures(&self, job_id: JobId) -> Vec<FailureDescriptor> {
        self.collect(job_id, |r| r.failure.clone())
    }

    /// Requests of a job that ended `Failed`, for a retry action.
    pub fn failed_requests(&self, job_id: JobId) -> Vec<Arc<GenerationRequest>> {
        self.collect(job_id, |r| {
            (r.state == RequestState::Failed).then(|| Arc::clone(&r.request))
        })
    }

    fn collect<T>(&self, job_id: JobId, pick: impl Fn(&RequestRecord) -> Option<T>) -> Vec<T> {
        let state = self.inner.state.lock();
        let Some(job) = state.jobs.get(&job_id) else {
            return Vec::new();
        };
        job.order
            .iter()
            .filter_map(|id| state.requests.get(id).and_then(&pick))
            .collect()
    }

    pub fn job_characters(&self, job_id: JobId) -> Option<CharacterSet> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&job_id)
            .map(|job| job.characters.clone())
    }

    pub fn job_references(&self, job_id: JobId) -> Option<ReferenceOverrides> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&job_id)
            .map(|job| job.references.clone())
    }

    /// Hand one candidate over to the caller and discard its siblings.
    pub fn select_candidate(
        &self,
        request_id: RequestId,
        candidate_id: &CandidateId,
    ) -> Result<Candidate, SessionError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(SessionError::Closed);
        }
        let record = state
            .requests
            .get_mut(&request_id)
            .ok_or(SessionError::UnknownRequest(request_id))?;
        let not_found = || SessionError::CandidateNotFound {
            request: request_id,
            candidate: candidate_id.clone(),
        };
        let result = record.result.as_mut().ok_or_else(not_found)?;
        let index = result
            .candidates
            .iter()
            .position(|c| &c.id == candidate_id)
            .ok_or_else(not_found)?;
        let selected = result.candidates.swap_remove(index);
        let discarded = result.candidates.len();
        result.candidates.clear();
        debug!(
            request_id = %request_id,
            candidate = %selected.id.short(),
            discarded,
            "Candidate selected"
        );
        Ok(selected)
    }

    /// Every event recorded so far, optionally for one job only.
    pub fn events(&self, job_id: Option<JobId>) -> Vec<JobEvent> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|e| job_id.map(|j| e.job_id == j).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Live events of every job, from now on.
    pub fn subscribe(&self) -> EventStream {
        let mut state = self.inner.state.lock();
        let receiver = state.fanout.subscribe();
        if state.closed {
            state.fanout.close();
        }
        EventStream::new(Vec::new(), receiver, None)
    }

    /// All events of one job, replaying those already emitted; ends after the job's
    /// terminal event.
    pub fn subscribe_job(&self, job_id: JobId) -> Result<EventStream, SessionError> {
        let mut state = self.inner.state.lock();
        if !state.jobs.contains_key(&job_id) {
            return Err(SessionError::UnknownJob(job_id));
        }
        let replay: Vec<JobEvent> = state
            .history
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        let receiver = state.fanout.subscribe();
        if state.closed {
            state.fanout.close();
        }
        Ok(EventStream::new(replay, receiver, Some(job_id)))
    }

    /// Register a synchronous observer for every future event.
    pub fn observe(&self, observer: impl Fn(&JobEvent) + Send + Sync + 'static) -> ObserverId {
        let observer: Observer = Arc::new(observer);
        self.inner.state.lock().fanout.observe(observer)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.inner.state.lock().fanout.remove_observer(id)
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatus, SessionError> {
        let mut receiver = {
            let state = self.inner.state.lock();
            let job = state
                .jobs
                .get(&job_id)
                .ok_or(SessionError::UnknownJob(job_id))?;
            job.status_tx.subscribe()
        };
        let waited = receiver
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| *status);
        let status = match waited {
            Ok(status) => status,
            Err(_) => *receiver.borrow(),
        };
        Ok(status)
    }

    /// Cancel running jobs, release uncommitted candidates and end all streams.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let mut cancelled = 0usize;
        for job in state.jobs.values() {
            if job.status == JobStatus::Running && job.cancel.cancel() {
                cancelled += 1;
            }
        }
        let mut released = 0usize;
        for record in state.requests.values_mut() {
            if let Some(result) = record.result.as_mut() {
                released += result.candidates.len();
                result.candidates.clear();
            }
        }
        state.fanout.close();
        info!(
            session_id = %self.inner.id,
            cancelled_jobs = cancelled,
            released_candidates = released,
            "Session closed"
        );
    }
}
