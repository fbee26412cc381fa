//! Booking lifecycle nodes. Each branches on `success`/`failure` and can
//! advance the CRM lead and notify a human agent as side effects. Side
//! effects are best-effort: a CRM or notification hiccup is logged, never
//! allowed to undo a booking the provider already confirmed.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::schema_for;
use serde_json::json;
use tracing::warn;

use crate::collaborator::{
    BookingRequest, CollaboratorError, Collaborators, ContactInfo, LeadStore, SchedulingProvider,
};
use crate::events::{DomainEvent, EventBus};
use crate::gateway::{MessagingGateway, OutboundMessage};
use crate::graph::{
    BookAppointmentConfig, CancelAppointmentConfig, ContactVariables, Node, NodeKind,
    RescheduleAppointmentConfig,
};
use crate::node::{
    ConversationContext, HANDLE_FAILURE, HANDLE_SUCCESS, NodeError, NodeExecutor, NodeOut,
};
use crate::vars::value_to_string;

struct SideEffects {
    leads: Arc<dyn LeadStore>,
    gateway: Arc<dyn MessagingGateway>,
    events: EventBus,
}

impl std::fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SideEffects")
    }
}

impl SideEffects {
    fn from(collaborators: &Collaborators) -> Self {
        Self {
            leads: collaborators.leads.clone(),
            gateway: collaborators.gateway.clone(),
            events: collaborators.events.clone(),
        }
    }

    async fn advance_lead(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        stage: &str,
        contact: Option<&ContactVariables>,
    ) {
        let info = contact_from_ctx(ctx, contact);
        match self.leads.create_or_advance(tenant_id, &info, stage).await {
            Ok(lead_id) => {
                ctx.set_lead_id(lead_id.clone());
                self.events.publish(DomainEvent::LeadAdvanced {
                    tenant_id: tenant_id.to_string(),
                    session_id: ctx.session_id().to_string(),
                    lead_id,
                    stage: stage.to_string(),
                });
            }
            Err(e) => warn!(tenant = %tenant_id, stage, "lead advance failed: {e}"),
        }
    }

    async fn notify_agent(&self, ctx: &ConversationContext, agent_channel: &str, text: String) {
        let message = OutboundMessage::text(ctx.channel_type(), agent_channel, text);
        if let Err(e) = self.gateway.send(message).await {
            warn!(agent = %agent_channel, "agent notification failed: {e}");
        }
    }
}

/// Contact details for the lead record, read from the variables the flow
/// captured. Falls back to the conventional `name`/`phone`/`email` keys.
fn contact_from_ctx(ctx: &ConversationContext, mapping: Option<&ContactVariables>) -> ContactInfo {
    let var = |configured: Option<&String>, fallback: &str| {
        let key = configured.map(String::as_str).unwrap_or(fallback);
        ctx.var(key).map(value_to_string)
    };
    match mapping {
        Some(m) => ContactInfo {
            name: var(m.name_variable.as_ref(), "name"),
            phone: var(m.phone_variable.as_ref(), "phone"),
            email: var(m.email_variable.as_ref(), "email"),
        },
        None => ContactInfo {
            name: var(None, "name"),
            phone: var(None, "phone"),
            email: var(None, "email"),
        },
    }
}

#[derive(Debug)]
pub struct BookAppointmentExecutor {
    scheduling: Arc<dyn SchedulingProvider>,
    side_effects: SideEffects,
}

impl BookAppointmentExecutor {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            scheduling: collaborators.scheduling.clone(),
            side_effects: SideEffects::from(collaborators),
        }
    }
}

#[async_trait]
impl NodeExecutor for BookAppointmentExecutor {
    fn kind(&self) -> &'static str {
        "book-appointment"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(BookAppointmentConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::BookAppointment(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a book-appointment node",
                node.id
            )));
        };

        let date = ctx.render(&cfg.date);
        let slot = ctx.render(&cfg.slot);
        let request = BookingRequest {
            date: date.clone(),
            slot: slot.clone(),
            appointment_type_id: cfg.appointment_type_id.clone(),
            location_id: cfg.location_id.clone(),
            agent_id: cfg.agent_id.clone(),
        };

        match self.scheduling.book(tenant_id, &request).await {
            Ok(booking) => {
                ctx.set_var("appointment_id", json!(booking.id));
                ctx.set_transient("date", json!(date));
                ctx.set_transient("slot", json!(slot));

                if let Some(stage) = &cfg.lead_stage {
                    self.side_effects
                        .advance_lead(tenant_id, ctx, stage, cfg.contact.as_ref())
                        .await;
                }
                if let Some(agent) = &cfg.notify_agent {
                    self.side_effects
                        .notify_agent(ctx, agent, format!("New appointment on {date} at {slot}"))
                        .await;
                }

                let message = match &cfg.confirmation_message {
                    Some(template) => ctx.render(template),
                    None => format!("Your appointment is booked for {date} at {slot}."),
                };
                Ok(NodeOut::say(message, HANDLE_SUCCESS))
            }
            Err(CollaboratorError::Rejected(reason)) => {
                warn!(tenant = %tenant_id, date = %date, slot = %slot, "booking rejected: {reason}");
                let message = match &cfg.failure_message {
                    Some(template) => ctx.render(template),
                    None => "We couldn't book that time. Please pick another slot.".to_string(),
                };
                Ok(NodeOut::say(message, HANDLE_FAILURE))
            }
            Err(CollaboratorError::Unreachable(reason)) => {
                Err(NodeError::CollaboratorFailed(format!("booking: {reason}")))
            }
        }
    }
}

#[derive(Debug)]
pub struct CancelAppointmentExecutor {
    scheduling: Arc<dyn SchedulingProvider>,
    side_effects: SideEffects,
}

impl CancelAppointmentExecutor {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            scheduling: collaborators.scheduling.clone(),
            side_effects: SideEffects::from(collaborators),
        }
    }
}

#[async_trait]
impl NodeExecutor for CancelAppointmentExecutor {
    fn kind(&self) -> &'static str {
        "cancel-appointment"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(CancelAppointmentConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::CancelAppointment(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a cancel-appointment node",
                node.id
            )));
        };

        let appointment_id = ctx.render(&cfg.appointment_id);
        match self.scheduling.cancel(tenant_id, &appointment_id).await {
            Ok(()) => {
                if let Some(stage) = &cfg.lead_stage {
                    self.side_effects
                        .advance_lead(tenant_id, ctx, stage, None)
                        .await;
                }
                if let Some(agent) = &cfg.notify_agent {
                    self.side_effects
                        .notify_agent(ctx, agent, format!("Appointment {appointment_id} cancelled"))
                        .await;
                }
                let message = match &cfg.confirmation_message {
                    Some(template) => ctx.render(template),
                    None => "Your appointment has been cancelled.".to_string(),
                };
                Ok(NodeOut::say(message, HANDLE_SUCCESS))
            }
            Err(CollaboratorError::Rejected(reason)) => {
                warn!(tenant = %tenant_id, appointment = %appointment_id, "cancel rejected: {reason}");
                let message = match &cfg.failure_message {
                    Some(template) => ctx.render(template),
                    None => "We couldn't find that appointment.".to_string(),
                };
                Ok(NodeOut::say(message, HANDLE_FAILURE))
            }
            Err(CollaboratorError::Unreachable(reason)) => {
                Err(NodeError::CollaboratorFailed(format!("cancel: {reason}")))
            }
        }
    }
}

#[derive(Debug)]
pub struct RescheduleAppointmentExecutor {
    scheduling: Arc<dyn SchedulingProvider>,
    side_effects: SideEffects,
}

impl RescheduleAppointmentExecutor {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            scheduling: collaborators.scheduling.clone(),
            side_effects: SideEffects::from(collaborators),
        }
    }
}

#[async_trait]
impl NodeExecutor for RescheduleAppointmentExecutor {
    fn kind(&self) -> &'static str {
        "reschedule-appointment"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(RescheduleAppointmentConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::RescheduleAppointment(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a reschedule-appointment node",
                node.id
            )));
        };

        let appointment_id = ctx.render(&cfg.appointment_id);
        let date = ctx.render(&cfg.date);
        let slot = ctx.render(&cfg.slot);
        let request = BookingRequest {
            date: date.clone(),
            slot: slot.clone(),
            appointment_type_id: None,
            location_id: None,
            agent_id: None,
        };

        match self
            .scheduling
            .reschedule(tenant_id, &appointment_id, &request)
            .await
        {
            Ok(booking) => {
                ctx.set_var("appointment_id", json!(booking.id));
                if let Some(stage) = &cfg.lead_stage {
                    self.side_effects
                        .advance_lead(tenant_id, ctx, stage, None)
                        .await;
                }
                if let Some(agent) = &cfg.notify_agent {
                    self.side_effects
                        .notify_agent(
                            ctx,
                            agent,
                            format!("Appointment {appointment_id} moved to {date} {slot}"),
                        )
                        .await;
                }
                let message = match &cfg.confirmation_message {
                    Some(template) => ctx.render(template),
                    None => format!("Your appointment was moved to {date} at {slot}."),
                };
                Ok(NodeOut::say(message, HANDLE_SUCCESS))
            }
            Err(CollaboratorError::Rejected(reason)) => {
                warn!(tenant = %tenant_id, appointment = %appointment_id, "reschedule rejected: {reason}");
                let message = match &cfg.failure_message {
                    Some(template) => ctx.render(template),
                    None => "We couldn't move your appointment to that time.".to_string(),
                };
                Ok(NodeOut::say(message, HANDLE_FAILURE))
            }
            Err(CollaboratorError::Unreachable(reason)) => Err(NodeError::CollaboratorFailed(
                format!("reschedule: {reason}"),
            )),
        }
    }
}
