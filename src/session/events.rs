//! Job progress events and the stream observers read them from.

use crate::types::{JobId, RequestId, RequestPurpose};
use chrono::{DateTime, Utc};
use futures::channel::mpsc::UnboundedReceiver;
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A progress event. `seq` is strictly increasing within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub job_id: JobId,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    RequestStarted {
        request_id: RequestId,
        purpose: RequestPurpose,
    },
    RequestRetrying {
        request_id: RequestId,
        attempt: u32,
        error: String,
    },
    RequestSucceeded {
        request_id: RequestId,
        candidates: usize,
        seed: Option<i64>,
    },
    RequestFailed {
        request_id: RequestId,
        kind: String,
        message: String,
    },
    JobCompleted {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    JobCancelled {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

impl JobEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::JobCompleted { .. } | JobEventKind::JobCancelled { .. }
        )
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            JobEventKind::RequestStarted { request_id, .. }
            | JobEventKind::RequestRetrying { request_id, .. }
            | JobEventKind::RequestSucceeded { request_id, .. }
            | JobEventKind::RequestFailed { request_id, .. } => Some(*request_id),
            JobEventKind::JobCompleted { .. } | JobEventKind::JobCancelled { .. } => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::RequestStarted { .. } => "request_started",
            JobEventKind::RequestRetrying { .. } => "request_retrying",
            JobEventKind::RequestSucceeded { .. } => "request_succeeded",
            JobEventKind::RequestFailed { .. } => "request_failed",
            JobEventKind::JobCompleted { .. } => "job_completed",
            JobEventKind::JobCancelled { .. } => "job_cancelled",
        }
    }
}

/// Events for one observer. A job-scoped stream replays the job's earlier events and
/// ends after its terminal event; a session-wide stream ends when the session closes.
pub struct EventStream {
    replay: VecDeque<JobEvent>,
    receiver: UnboundedReceiver<JobEvent>,
    job: Option<JobId>,
    finished: bool,
}

impl EventStream {
    pub(crate) fn new(
        replay: Vec<JobEvent>,
        receiver: UnboundedReceiver<JobEvent>,
        job: Option<JobId>,
    ) -> Self {
        Self {
            replay: replay.into(),
            receiver,
            job,
            finished: false,
        }
    }
}

impl Stream for EventStream {
    type Item = JobEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            let event = match this.replay.pop_front() {
                Some(event) => event,
                None => match Pin::new(&mut this.receiver).poll_next(cx) {
                    Poll::Ready(Some(event)) => event,
                    Poll::Ready(None) => return Poll::Ready(None),
                    Poll::Pending => return Poll::Pending,
                },
            };
            if let Some(job) = this.job {
                if event.job_id != job {
                    continue;
                }
                if event.kind.is_terminal() {
                    this.finished = true;
                }
            }
            return Poll::Ready(Some(event));
        }
    }
}
