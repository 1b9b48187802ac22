//! Batch Orchestrator: runs a job's requests against the generation service.
//!
//! One driver per job decides what to dispatch and applies every completion to the
//! session; request futures only run tasks and retries. A semaphore shared by all jobs
//! of an orchestrator caps the calls in flight at `max_concurrent`.

use crate::character::{CharacterSet, ConsistencyResolver, ReferenceOverride, ReferenceOverrides};
use crate::concurrency::CancelSignal;
use crate::config::OrchestratorConfig;
use crate::error::{JobError, ServiceError, SessionError};
use crate::generation::plan::BatchJob;
use crate::generation::task::{GenerationTask, TaskContext, TaskOutcome};
use crate::service::{GenerationService, ServiceEndpointConfig};
use crate::session::{EventStream, GenerationSession, JobStatus, JobSummary};
use crate::types::{FailureDescriptor, GenerationRequest, GenerationResult, JobId, RequestId};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Handle to a submitted job. Cheap to clone; every clone controls the same job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    session: GenerationSession,
    cancel: CancelSignal,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.job_id
    }

    /// Stop dispatching and abandon in-flight requests. Returns false if already cancelled.
    pub fn cancel(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            info!(job_id = %self.job_id, "Job cancellation requested");
        }
        first
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.session.job_status(self.job_id)
    }

    pub fn summary(&self) -> Option<JobSummary> {
        self.session.summary(self.job_id)
    }

    pub async fn wait(&self) -> Result<JobStatus, SessionError> {
        self.session.wait(self.job_id).await
    }

    /// Every event of this job, from its first; ends after the terminal event.
    pub fn events(&self) -> Result<EventStream, SessionError> {
        self.session.subscribe_job(self.job_id)
    }

    pub fn results(&self) -> Vec<GenerationResult> {
        self.session.results(self.job_id)
    }
}

#[derive(Debug)]
enum RequestOutcome {
    Succeeded(GenerationResult),
    Failed(FailureDescriptor),
    Cancelled,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    service: Arc<dyn GenerationService>,
    characters: Arc<CharacterSet>,
    settings: OrchestratorConfig,
    permits: Arc<Semaphore>,
    endpoint: Arc<RwLock<Option<Arc<ServiceEndpointConfig>>>>,
}

impl BatchOrchestrator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        characters: Arc<CharacterSet>,
        settings: OrchestratorConfig,
    ) -> Self {
        let limit = settings.max_concurrent.max(1);
        Self {
            service,
            characters,
            settings,
            permits: Arc::new(Semaphore::new(limit)),
            endpoint: Arc::new(RwLock::new(None)),
        }
    }

    pub fn settings(&self) -> &OrchestratorConfig {
        &self.settings
    }

    /// Last successful probe, if any.
    pub fn endpoint(&self) -> Option<Arc<ServiceEndpointConfig>> {
        self.endpoint.read().clone()
    }

    /// Probe the service and keep the snapshot for jobs submitted from now on. Jobs
    /// already running keep the snapshot they started with.
    pub async fn refresh_endpoint(&self) -> Result<Arc<ServiceEndpointConfig>, ServiceError> {
        let probed = Arc::new(self.service.check_availability().await?);
        info!(
            endpoint = %probed.base_url,
            available = probed.available,
            model = probed.model.as_deref().unwrap_or("-"),
            feature_adapter = probed.capabilities.feature_adapter.is_some(),
            pose_conditioning = probed.capabilities.pose_conditioning.is_some(),
            multi_region = probed.capabilities.multi_region,
            face_correction = probed.capabilities.face_correction,
            "Service probed"
        );
        *self.endpoint.write() = Some(Arc::clone(&probed));
        Ok(probed)
    }

    async fn endpoint_for_job(&self, job_id: JobId) -> Arc<ServiceEndpointConfig> {
        if let Some(endpoint) = self.endpoint() {
            return endpoint;
        }
        match self.refresh_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(
                    job_id = %job_id,
                    error = %err,
                    "Service probe failed; assuming every capability is installed"
                );
                Arc::new(ServiceEndpointConfig::assumed(self.service.endpoint_label()))
            }
        }
    }

    /// Register the job with the session and start driving it.
    ///
    /// An empty job completes before this returns and needs no runtime; anything else
    /// is spawned on the current tokio runtime.
    pub fn submit(&self, session: &GenerationSession, job: BatchJob) -> Result<JobHandle, JobError> {
        let cancel = CancelSignal::new();
        let handle = JobHandle {
            job_id: job.id,
            session: session.clone(),
            cancel: cancel.clone(),
        };

        match job.validate() {
            Ok(()) => {}
            Err(JobError::EmptyJob) => {
                session.register_job(
                    job.id,
                    &[],
                    cancel,
                    job.characters().clone(),
                    job.seed_references().clone(),
                )?;
                session.finish_job(job.id, JobStatus::Completed);
                debug!(job_id = %job.id, "Empty job completed on submit");
                return Ok(handle);
            }
            Err(err) => return Err(err),
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| JobError::NoRuntime)?;
        session.register_job(
            job.id,
            job.requests(),
            cancel.clone(),
            job.characters().clone(),
            job.seed_references().clone(),
        )?;
        info!(
            job_id = %job.id,
            session_id = %session.id(),
            requests = job.len(),
            max_concurrent = self.settings.max_concurrent,
            max_retries = self.settings.max_retries,
            "Job submitted"
        );

        let driver = JobDriver {
            orchestrator: self.clone(),
            session: session.clone(),
            job,
            cancel,
        };
        runtime.spawn(driver.run());
        Ok(handle)
    }

    pub fn cancel(&self, handle: &JobHandle) -> bool {
        handle.cancel()
    }

    pub fn progress(&self, handle: &JobHandle) -> Result<EventStream, SessionError> {
        handle.events()
    }

    /// Submit the failed requests of a finished job as a new job.
    ///
    /// The new job inherits the old one's transient characters and every reference it
    /// generated, so retried panels stay consistent with the ones that succeeded.
    pub fn resubmit_failed(
        &self,
        session: &GenerationSession,
        job_id: JobId,
    ) -> Result<JobHandle, JobError> {
        match session.job_status(job_id) {
            None => return Err(SessionError::UnknownJob(job_id).into()),
            Some(JobStatus::Running) => return Err(SessionError::JobNotFinished(job_id).into()),
            Some(_) => {}
        }
        let requests: Vec<GenerationRequest> = session
            .failed_requests(job_id)
            .iter()
            .map(|request| request.resubmitted())
            .collect();
        info!(job_id = %job_id, requests = requests.len(), "Resubmitting failed requests");
        let job = BatchJob::new(requests)
            .with_characters(session.job_characters(job_id).unwrap_or_default())
            .with_references(session.job_references(job_id).unwrap_or_default());
        self.submit(session, job)
    }
}

struct JobDriver {
    orchestrator: BatchOrchestrator,
    session: GenerationSession,
    job: BatchJob,
    cancel: CancelSignal,
}

impl JobDriver {
    async fn run(self) {
        let job_id = self.job.id;
        let endpoint = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            endpoint = self.orchestrator.endpoint_for_job(job_id) => Some(endpoint),
        };
        let Some(endpoint) = endpoint else {
            self.session.finish_job(job_id, JobStatus::Cancelled);
            return;
        };

        let characters = Arc::new(self.orchestrator.characters.layered(self.job.characters()));
        let resolver = Arc::new(ConsistencyResolver::new(characters));
        let mut overrides = self.job.seed_references().clone();
        let mut waiting = self.job.dispatch_order();
        let mut finished: HashSet<RequestId> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let limit = self.orchestrator.settings.max_concurrent.max(1);

        let status = loop {
            if self.cancel.is_cancelled() {
                break JobStatus::Cancelled;
            }

            let mut index = 0;
            while in_flight.len() < limit && index < waiting.len() {
                let ready = self
                    .job
                    .dependencies(waiting[index].id)
                    .iter()
                    .all(|id| finished.contains(id));
                if !ready {
                    index += 1;
                    continue;
                }
                let request = waiting.remove(index);
                debug!(
                    job_id = %job_id,
                    request_id = %request.id,
                    purpose = %request.purpose.label(),
                    "Request ready"
                );
                in_flight.push(self.execute(
                    request,
                    Arc::clone(&resolver),
                    Arc::clone(&endpoint),
                    overrides.clone(),
                ));
            }

            if in_flight.is_empty() {
                if !waiting.is_empty() {
                    warn!(
                        job_id = %job_id,
                        blocked = waiting.len(),
                        "Requests blocked on unfinished dependencies"
                    );
                }
                break JobStatus::Completed;
            }

            let completed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                completed = in_flight.next() => completed,
            };
            let Some((request, outcome)) = completed else {
                continue;
            };
            self.apply(&request, outcome, &mut overrides);
            finished.insert(request.id);
        };

        // Dropping the pending futures abandons their service calls.
        drop(in_flight);
        self.session.finish_job(job_id, status);
    }

    /// Record one completion. Runs on the driver only, so writes never interleave.
    fn apply(
        &self,
        request: &GenerationRequest,
        outcome: RequestOutcome,
        overrides: &mut ReferenceOverrides,
    ) {
        let job_id = self.job.id;
        match outcome {
            RequestOutcome::Succeeded(result) => {
                if let Some(character) = request.reference_for() {
                    let reference = match result.candidates.first() {
                        Some(candidate) => {
                            ReferenceOverride::Generated(Arc::new(candidate.bytes.clone()))
                        }
                        None => ReferenceOverride::Unavailable,
                    };
                    overrides.insert(character.clone(), reference.clone());
                    self.session
                        .record_reference(job_id, character.clone(), reference);
                }
                info!(
                    job_id = %job_id,
                    request_id = %request.id,
                    candidates = result.candidates.len(),
                    attempts = result.attempts,
                    elapsed_ms = result.generation_time.as_millis() as u64,
                    "Request succeeded"
                );
                self.session.record_success(job_id, result);
            }
            RequestOutcome::Failed(failure) => {
                if let Some(character) = request.reference_for() {
                    warn!(
                        job_id = %job_id,
                        character = %character,
                        "Reference generation failed; dependent panels continue prompt-only"
                    );
                    overrides.insert(character.clone(), ReferenceOverride::Unavailable);
                    self.session.record_reference(
                        job_id,
                        character.clone(),
                        ReferenceOverride::Unavailable,
                    );
                }
                warn!(
                    job_id = %job_id,
                    request_id = %request.id,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Request failed"
                );
                self.session.record_failure(job_id, failure);
            }
            RequestOutcome::Cancelled => {
                debug!(job_id = %job_id, request_id = %request.id, "Request abandoned");
            }
        }
    }

    /// Run one request to a final outcome, retrying transport failures.
    async fn execute(
        &self,
        request: Arc<GenerationRequest>,
        resolver: Arc<ConsistencyResolver>,
        endpoint: Arc<ServiceEndpointConfig>,
        overrides: ReferenceOverrides,
    ) -> (Arc<GenerationRequest>, RequestOutcome) {
        let job_id = self.job.id;
        let settings = &self.orchestrator.settings;

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.orchestrator.permits).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return (request, RequestOutcome::Cancelled);
        };
        if !self.session.mark_running(job_id, request.id) {
            return (request, RequestOutcome::Cancelled);
        }

        let ctx = TaskContext {
            resolver: &resolver,
            service: self.orchestrator.service.as_ref(),
            endpoint: &endpoint,
            overrides: &overrides,
            missing_policy: settings.missing_character,
        };
        let mut attempt = 1u32;
        let outcome = loop {
            let task = GenerationTask::new(Arc::clone(&request), self.cancel.clone());
            match task.run(&ctx).await.outcome {
                TaskOutcome::Succeeded(mut result) => {
                    result.attempts = attempt;
                    break RequestOutcome::Succeeded(result);
                }
                TaskOutcome::Cancelled => break RequestOutcome::Cancelled,
                TaskOutcome::Failed(err) if err.is_retryable() && attempt <= settings.max_retries => {
                    warn!(
                        job_id = %job_id,
                        request_id = %request.id,
                        attempt,
                        max_retries = settings.max_retries,
                        error = %err,
                        "Retrying request"
                    );
                    self.session.record_retry(job_id, request.id, attempt, &err);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break RequestOutcome::Cancelled,
                        _ = tokio::time::sleep(settings.retry_delay()) => {}
                    }
                    attempt += 1;
                }
                TaskOutcome::Failed(err) => {
                    break RequestOutcome::Failed(FailureDescriptor {
                        request_id: request.id,
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                        attempts: attempt,
                    })
                }
            }
        };
        (request, outcome)
    }
}
