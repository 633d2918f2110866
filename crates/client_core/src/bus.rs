//! In-process broadcast of roster notifications.
//!
//! Any screen that creates or renames a conversation publishes here; the
//! roster synchronizer subscribes. The bus is injected, never global.

use shared::protocol::{ThreadEntry, ThreadPatch};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    Created(ThreadEntry),
    Updated(ThreadPatch),
}

#[derive(Clone)]
pub struct UiBus {
    events: broadcast::Sender<RosterEvent>,
}

impl UiBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { events }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: RosterEvent) -> usize {
        match self.events.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("roster event published with no subscribers");
                0
            }
        }
    }

    pub fn thread_created(&self, entry: ThreadEntry) -> usize {
        self.publish(RosterEvent::Created(entry))
    }

    pub fn thread_updated(&self, patch: ThreadPatch) -> usize {
        self.publish(RosterEvent::Updated(patch))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }
}

impl Default for UiBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
