//! Scripted generation service for tests and offline runs.
//!
//! Outcomes are taken from a one-shot queue, then from persistent prompt rules, then a
//! default of one image. Every call is logged with its start and finish so tests can
//! check ordering and concurrency.

use crate::error::ServiceError;
use crate::service::{
    GenerationService, RawImageSet, ServiceCapabilities, ServiceEndpointConfig, ServicePayload,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Succeed with this many images
    Images(usize),
    Fail(ServiceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Started,
    Finished,
}

/// One entry of the call log.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub call_index: usize,
    pub phase: CallPhase,
    pub payload: ServicePayload,
}

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<ScriptedOutcome>,
    rules: Vec<(String, ScriptedOutcome)>,
    log: Vec<ServiceCall>,
    calls: usize,
}

pub struct ScriptedService {
    state: Mutex<ScriptState>,
    latency: Duration,
    capabilities: ServiceCapabilities,
    reachable: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            latency: Duration::ZERO,
            capabilities: ServiceCapabilities::assumed(),
            reachable: true,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ServiceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Availability probes fail with `Unreachable`; generation calls still follow the script.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Queue a one-shot outcome for the next unmatched call.
    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.state.lock().queue.push_back(outcome);
    }

    /// Every call whose prompt contains `needle` gets `outcome`, ahead of the queue.
    pub fn rule(&self, needle: impl Into<String>, outcome: ScriptedOutcome) {
        self.state.lock().rules.push((needle.into(), outcome));
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<ServiceCall> {
        self.state.lock().log.clone()
    }

    /// Prompts of started calls, in start order.
    pub fn started_prompts(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|call| call.phase == CallPhase::Started)
            .map(|call| call.payload.prompt.clone())
            .collect()
    }

    fn next_outcome(&self, payload: &ServicePayload) -> (usize, ScriptedOutcome) {
        let mut state = self.state.lock();
        let call_index = state.calls;
        state.calls += 1;
        state.log.push(ServiceCall {
            call_index,
            phase: CallPhase::Started,
            payload: payload.clone(),
        });
        let outcome = match state
            .rules
            .iter()
            .find(|(needle, _)| payload.prompt.contains(needle.as_str()))
        {
            Some((_, outcome)) => outcome.clone(),
            None => state.queue.pop_front().unwrap_or(ScriptedOutcome::Images(1)),
        };
        (call_index, outcome)
    }
}

/// Decrements the in-flight count even when the call future is dropped mid-flight.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationService for ScriptedService {
    async fn generate(&self, payload: &ServicePayload) -> Result<RawImageSet, ServiceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (call_index, outcome) = self.next_outcome(payload);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.state.lock().log.push(ServiceCall {
            call_index,
            phase: CallPhase::Finished,
            payload: payload.clone(),
        });

        match outcome {
            ScriptedOutcome::Images(count) => Ok(RawImageSet {
                images: (0..count)
                    .map(|i| format!("image-{}-{}", call_index, i).into_bytes())
                    .collect(),
                seeds: vec![1000 + call_index as i64],
            }),
            ScriptedOutcome::Fail(err) => Err(err),
        }
    }

    async fn check_availability(&self) -> Result<ServiceEndpointConfig, ServiceError> {
        if !self.reachable {
            return Err(ServiceError::Unreachable(
                "scripted service is offline".to_string(),
            ));
        }
        Ok(ServiceEndpointConfig {
            base_url: self.endpoint_label().to_string(),
            available: true,
            model: Some("scripted".to_string()),
            capabilities: self.capabilities.clone(),
            checked_at: Utc::now(),
        })
    }

    fn endpoint_label(&self) -> &str {
        "scripted://local"
    }
}
