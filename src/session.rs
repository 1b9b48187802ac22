//! Generation Session Store
//!
//! Per-workflow record of submitted jobs, request states, results and the ordered event
//! log observers read progress from.

mod bus;
mod events;
mod store;

pub use bus::{Observer, ObserverId};
pub use events::{EventStream, JobEvent, JobEventKind};
pub use store::{GenerationSession, JobStatus, JobSummary, RequestState};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique session id.
pub fn new_session_id() -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess-{ts}-{pid}-{seq}")
}

/// Holds the session of the workflow currently open. Opening a new one closes the old.
#[derive(Default)]
pub struct SessionManager {
    current: Mutex<Option<GenerationSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: impl Into<String>) -> GenerationSession {
        let session = GenerationSession::new(name);
        let previous = self.current.lock().replace(session.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        info!(session_id = %session.id(), name = %session.name(), "Session opened");
        session
    }

    pub fn current(&self) -> Option<GenerationSession> {
        self.current.lock().clone()
    }

    /// Close the current session, if any.
    pub fn close(&self) -> bool {
        match self.current.lock().take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}
