use std::sync::Arc;

use async_trait::async_trait;
use schemars::schema_for;
use serde_json::json;
use tracing::warn;

use crate::collaborator::{AvailabilityQuery, CollaboratorError, SchedulingProvider};
use crate::graph::{CheckAvailabilityConfig, Node, NodeKind};
use crate::node::{
    ConversationContext, HANDLE_AVAILABLE, HANDLE_ERROR, HANDLE_UNAVAILABLE, NodeError,
    NodeExecutor, NodeOut,
};

/// Looks up free slots for a (usually captured) date and branches on
/// `available` / `unavailable` / `error`. Found slots are left in the
/// context as `available_slots` for downstream list or booking nodes.
#[derive(Debug)]
pub struct CheckAvailabilityExecutor {
    scheduling: Arc<dyn SchedulingProvider>,
}

impl CheckAvailabilityExecutor {
    pub fn new(scheduling: Arc<dyn SchedulingProvider>) -> Self {
        Self { scheduling }
    }
}

#[async_trait]
impl NodeExecutor for CheckAvailabilityExecutor {
    fn kind(&self) -> &'static str {
        "check-availability"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(CheckAvailabilityConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::CheckAvailability(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a check-availability node",
                node.id
            )));
        };

        let date = ctx.render(&cfg.date);
        let query = AvailabilityQuery {
            date: date.clone(),
            appointment_type_id: cfg.appointment_type_id.clone(),
            location_id: cfg.location_id.clone(),
            agent_id: cfg.agent_id.clone(),
        };

        let day = match self.scheduling.availability_for_date(tenant_id, &query).await {
            Ok(day) => day,
            Err(CollaboratorError::Rejected(reason)) => {
                warn!(tenant = %tenant_id, date = %date, "availability lookup rejected: {reason}");
                return Ok(NodeOut::say(
                    format!("We couldn't check availability for {date}. Please try again."),
                    HANDLE_ERROR,
                ));
            }
            Err(CollaboratorError::Unreachable(reason)) => {
                return Err(NodeError::CollaboratorFailed(format!(
                    "availability lookup: {reason}"
                )));
            }
        };

        ctx.set_transient("date", json!(date));

        if day.is_closed || day.available_slots.is_empty() {
            let message = match &cfg.unavailable_message {
                Some(template) => ctx.render(template),
                None => format!("We have no available times on {date}. Please try another date."),
            };
            return Ok(NodeOut::say(message, HANDLE_UNAVAILABLE));
        }

        let starts: Vec<String> = day.available_slots.iter().map(|s| s.start.clone()).collect();
        let joined = starts.join(", ");
        ctx.set_transient("available_slots", json!(starts));
        ctx.set_transient("slots", json!(joined));

        let message = match &cfg.available_message {
            Some(template) => ctx.render(template),
            None => format!("Available times on {date}: {joined}"),
        };
        Ok(NodeOut::say(message, HANDLE_AVAILABLE))
    }
}
