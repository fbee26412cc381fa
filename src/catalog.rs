//! Process-wide registry of node executors, keyed by node-type tag.
//! Built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::collaborator::Collaborators;
use crate::config::EngineOptions;
use crate::node::NodeExecutor;
use crate::nodes::{
    AiResponseExecutor, BookAppointmentExecutor, ButtonsExecutor, CancelAppointmentExecutor,
    CheckAvailabilityExecutor, LeadQualificationExecutor, ListExecutor, MessageExecutor,
    RescheduleAppointmentExecutor,
};

#[derive(Debug, Default)]
pub struct NodeCatalog {
    executors: HashMap<&'static str, Arc<dyn NodeExecutor>>,
}

impl NodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in node kinds wired to their collaborators.
    pub fn builtin(collaborators: &Collaborators, options: &EngineOptions) -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(MessageExecutor));
        catalog.register(Arc::new(ButtonsExecutor));
        catalog.register(Arc::new(ListExecutor));
        catalog.register(Arc::new(CheckAvailabilityExecutor::new(
            collaborators.scheduling.clone(),
        )));
        catalog.register(Arc::new(BookAppointmentExecutor::new(collaborators)));
        catalog.register(Arc::new(CancelAppointmentExecutor::new(collaborators)));
        catalog.register(Arc::new(RescheduleAppointmentExecutor::new(collaborators)));
        catalog.register(Arc::new(LeadQualificationExecutor::new(
            collaborators.leads.clone(),
            collaborators.events.clone(),
        )));
        catalog.register(Arc::new(AiResponseExecutor::new(
            collaborators.agent.clone(),
            collaborators.meter.clone(),
            options.ai_timeout(),
        )));
        catalog
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let kind = executor.kind();
        if self.executors.insert(kind, executor).is_some() {
            warn!(kind, "replacing already-registered node executor");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Config schemas per node kind, for the visual builder.
    pub fn schemas(&self) -> HashMap<String, schemars::Schema> {
        self.executors
            .iter()
            .map(|(kind, executor)| (kind.to_string(), executor.config_schema()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_collaborators;

    #[test]
    fn builtin_covers_every_node_kind() {
        let catalog = NodeCatalog::builtin(&test_collaborators(), &EngineOptions::default());
        for kind in [
            "message",
            "buttons",
            "list",
            "check-availability",
            "book-appointment",
            "cancel-appointment",
            "reschedule-appointment",
            "lead-qualification",
            "ai-response",
        ] {
            assert!(catalog.get(kind).is_some(), "missing executor for {kind}");
        }
        assert_eq!(catalog.kinds().len(), 9);
        assert_eq!(catalog.schemas().len(), 9);
    }
}
