//! Single-Request Generation Task: resolves one request's characters, composes the
//! service payload and makes exactly one service call.
//!
//! `Created → Resolving → Dispatched → {Succeeded, Failed, Cancelled}`. Cancellation is
//! checked between states and raced against the service call; a task never retries.

use crate::character::{ConsistencyResolver, ReferenceOverrides, ResolvedCharacterPayload};
use crate::concurrency::CancelSignal;
use crate::config::MissingCharacterPolicy;
use crate::error::{ResolutionError, ServiceError, TaskError};
use crate::service::{
    AdapterAttachment, GenerationService, PoseAttachment, RegionAttachment, ServiceCapabilities,
    ServiceEndpointConfig, ServicePayload,
};
use crate::types::{Candidate, GenerationRequest, GenerationResult, PoseConditioning};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Resolving,
    Dispatched,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn can_move_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Resolving)
                | (Created, Cancelled)
                | (Resolving, Dispatched)
                | (Resolving, Failed)
                | (Resolving, Cancelled)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Dispatched, Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(GenerationResult),
    Failed(TaskError),
    Cancelled,
}

/// Outcome of a run plus every state the task passed through.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    pub states: Vec<TaskState>,
}

/// Everything a task borrows from its job for one run.
pub struct TaskContext<'a> {
    pub resolver: &'a ConsistencyResolver,
    pub service: &'a dyn GenerationService,
    pub endpoint: &'a ServiceEndpointConfig,
    pub overrides: &'a ReferenceOverrides,
    pub missing_policy: MissingCharacterPolicy,
}

pub struct GenerationTask {
    request: Arc<GenerationRequest>,
    cancel: CancelSignal,
    states: Vec<TaskState>,
}

impl GenerationTask {
    pub fn new(request: Arc<GenerationRequest>, cancel: CancelSignal) -> Self {
        Self {
            request,
            cancel,
            states: vec![TaskState::Created],
        }
    }

    pub fn state(&self) -> TaskState {
        self.states.last().copied().unwrap_or(TaskState::Created)
    }

    fn advance(&mut self, next: TaskState) {
        let current = self.state();
        if current.can_move_to(next) {
            self.states.push(next);
        } else {
            warn!(
                request_id = %self.request.id,
                from = ?current,
                to = ?next,
                "Ignoring illegal task transition"
            );
        }
    }

    fn finish(mut self, outcome: TaskOutcome) -> TaskReport {
        let state = match &outcome {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        };
        self.advance(state);
        TaskReport {
            outcome,
            states: self.states,
        }
    }

    pub async fn run(mut self, ctx: &TaskContext<'_>) -> TaskReport {
        if self.cancel.is_cancelled() {
            return self.finish(TaskOutcome::Cancelled);
        }

        self.advance(TaskState::Resolving);
        let payload = match self.compose(ctx).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    request_id = %self.request.id,
                    error = %err,
                    kind = err.kind(),
                    "Request failed before dispatch"
                );
                return self.finish(TaskOutcome::Failed(err));
            }
        };

        if self.cancel.is_cancelled() {
            return self.finish(TaskOutcome::Cancelled);
        }

        self.advance(TaskState::Dispatched);
        debug!(
            request_id = %self.request.id,
            purpose = %self.request.purpose.label(),
            endpoint = ctx.service.endpoint_label(),
            adapter = payload.feature_adapter.is_some(),
            regions = payload.regions.as_ref().map(|r| r.region_prompts.len()).unwrap_or(0),
            pose = payload.pose.is_some(),
            "Dispatching generation request"
        );
        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            response = ctx.service.generate(&payload) => Some(response),
        };

        let raw = match response {
            None => {
                info!(request_id = %self.request.id, "In-flight request cancelled");
                return self.finish(TaskOutcome::Cancelled);
            }
            Some(Err(err)) => return self.finish(TaskOutcome::Failed(err.into())),
            Some(Ok(raw)) => raw,
        };
        if raw.images.is_empty() {
            return self.finish(TaskOutcome::Failed(
                ServiceError::MalformedResponse("response carried no images".to_string()).into(),
            ));
        }

        let candidates = raw
            .images
            .iter()
            .enumerate()
            .map(|(i, bytes)| Candidate::new(bytes.clone(), raw.seed_for(i)))
            .collect();
        let result = GenerationResult {
            request_id: self.request.id,
            candidates,
            generation_time: started.elapsed(),
            attempts: 1,
        };
        self.finish(TaskOutcome::Succeeded(result))
    }

    async fn compose(&self, ctx: &TaskContext<'_>) -> Result<ServicePayload, TaskError> {
        let request = &self.request;
        let resolution = ctx
            .resolver
            .resolve_available(&request.characters, request.layout.as_ref(), ctx.overrides)
            .await;
        if let Some(missing) = resolution.missing.first() {
            match ctx.missing_policy {
                MissingCharacterPolicy::Fail => {
                    return Err(ResolutionError::CharacterNotFound(missing.clone()).into())
                }
                MissingCharacterPolicy::Degrade => debug!(
                    request_id = %request.id,
                    missing = resolution.missing.len(),
                    "Generating without data for missing characters"
                ),
            }
        }

        let capabilities = &ctx.endpoint.capabilities;
        let mut payload = compose_payload(request, resolution.payload, capabilities)?;
        if let Some(pose) = &request.pose {
            payload.pose = Some(load_pose(pose, capabilities).await?);
        }
        Ok(payload)
    }
}

/// Build the service payload from a request and its resolved characters.
///
/// Missing multi-region support fails the request; a missing feature adapter or face
/// correction pass only drops that attachment.
pub fn compose_payload(
    request: &GenerationRequest,
    resolved: ResolvedCharacterPayload,
    capabilities: &ServiceCapabilities,
) -> Result<ServicePayload, ServiceError> {
    let mut payload = ServicePayload::text_only(String::new(), request.sampling.clone());
    payload.negative_prompt = request.negative_prompt.clone();

    match resolved {
        ResolvedCharacterPayload::Empty => {
            payload.prompt = request.prompt.clone();
        }
        ResolvedCharacterPayload::Single {
            character,
            prompt,
            adapter,
        } => {
            payload.prompt = join_prompt(&[&prompt, &request.prompt]);
            if let Some(adapter) = adapter {
                match &capabilities.feature_adapter {
                    Some(model) => {
                        payload.feature_adapter = Some(AdapterAttachment {
                            image: Arc::clone(&adapter.image),
                            strength: adapter.strength,
                            model: model.clone(),
                        })
                    }
                    None => warn!(
                        request_id = %request.id,
                        character = %character,
                        "Feature adapter not installed; generating prompt-only"
                    ),
                }
            }
        }
        ResolvedCharacterPayload::MultiRegion {
            direction,
            ratios,
            regions,
        } => {
            if !capabilities.multi_region {
                return Err(ServiceError::capability_unavailable(
                    "multi-region composition",
                ));
            }
            payload.prompt = request.prompt.clone();
            payload.regions = Some(RegionAttachment {
                direction,
                ratios,
                region_prompts: regions.into_iter().map(|r| r.prompt).collect(),
            });
        }
    }

    if request.face_correction {
        if capabilities.face_correction {
            payload.face_correction = true;
        } else {
            warn!(request_id = %request.id, "Face correction not installed; skipping");
        }
    }
    Ok(payload)
}

async fn load_pose(
    pose: &PoseConditioning,
    capabilities: &ServiceCapabilities,
) -> Result<PoseAttachment, TaskError> {
    let model = capabilities
        .pose_conditioning
        .clone()
        .ok_or_else(|| ServiceError::capability_unavailable("pose conditioning"))?;
    let image = tokio::fs::read(&pose.image)
        .await
        .map_err(|err| ResolutionError::PoseImageUnreadable {
            path: pose.image.clone(),
            reason: err.to_string(),
        })?;
    Ok(PoseAttachment {
        image,
        weight: pose.weight,
        model,
    })
}

fn join_prompt(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
