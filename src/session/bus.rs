//! In-process fanout of job events to stream subscribers and callback observers.

use crate::session::events::JobEvent;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use std::sync::Arc;

/// Synchronous observer. Runs with no session lock held and may call back into the
/// session; events it causes are delivered after it returns.
pub type Observer = Arc<dyn Fn(&JobEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub(crate) struct EventFanout {
    subscribers: Vec<UnboundedSender<JobEvent>>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl EventFanout {
    pub fn subscribe(&mut self) -> UnboundedReceiver<JobEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub fn observe(&mut self, observer: Observer) -> ObserverId {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, observer));
        id
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Current targets, dropping subscribers whose streams are gone.
    pub fn targets(&mut self) -> FanoutTargets {
        self.subscribers.retain(|sender| !sender.is_closed());
        FanoutTargets {
            senders: self.subscribers.clone(),
            observers: self.observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
        }
    }

    /// Drop every target; open streams end once drained.
    pub fn close(&mut self) {
        self.subscribers.clear();
        self.observers.clear();
    }
}

pub(crate) struct FanoutTargets {
    senders: Vec<UnboundedSender<JobEvent>>,
    observers: Vec<Observer>,
}

impl FanoutTargets {
    pub fn deliver(&self, event: &JobEvent) {
        for sender in &self.senders {
            // A receiver dropped since `targets` is not an error.
            let _ = sender.unbounded_send(event.clone());
        }
        for observer in &self.observers {
            observer(event);
        }
    }
}
