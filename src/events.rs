//! Domain events the core publishes instead of reaching into shared state.
//! Presentation layers (lead list mirroring, dashboards) subscribe; the
//! engine never waits on them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionCompleted {
        tenant_id: String,
        session_id: String,
        flow_id: String,
    },
    SessionFailed {
        tenant_id: String,
        session_id: String,
        reason: String,
    },
    LeadAdvanced {
        tenant_id: String,
        session_id: String,
        lead_id: String,
        stage: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Fire-and-forget: publishing without subscribers is not an error.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
