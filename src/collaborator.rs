//! External collaborators the flow engine depends on, each behind a narrow
//! async trait. The surrounding application wires real implementations in;
//! [`crate::testutil`] ships scripted fakes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::EventBus;
use crate::gateway::MessagingGateway;
use crate::metering::UsageMeter;

/// How a collaborator call failed.
///
/// `Rejected` is a business-level answer (slot already taken, unknown
/// appointment id) and steers the conversation to a failure handle.
/// `Unreachable` is an infrastructure failure and is propagated as a fatal
/// node error by the interpreter.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TimeSlot {
    pub start: String,
    pub end: String,
}

impl TimeSlot {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BusinessHours {
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DayAvailability {
    pub available_slots: Vec<TimeSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<BusinessHours>,
    #[serde(default)]
    pub is_closed: bool,
}

/// Optional filters for an availability lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AvailabilityQuery {
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BookingRequest {
    pub date: String,
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Booking {
    pub id: String,
    pub date: String,
    pub slot: String,
}

/// Appointment-scheduling collaborator: availability lookups plus the
/// booking operations the appointment nodes drive.
#[async_trait]
pub trait SchedulingProvider: Send + Sync + Debug {
    async fn availability_for_date(
        &self,
        tenant_id: &str,
        query: &AvailabilityQuery,
    ) -> Result<DayAvailability, CollaboratorError>;

    async fn book(
        &self,
        tenant_id: &str,
        request: &BookingRequest,
    ) -> Result<Booking, CollaboratorError>;

    async fn cancel(&self, tenant_id: &str, appointment_id: &str)
    -> Result<(), CollaboratorError>;

    async fn reschedule(
        &self,
        tenant_id: &str,
        appointment_id: &str,
        request: &BookingRequest,
    ) -> Result<Booking, CollaboratorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens_used: u64,
}

/// AI text-generation collaborator.
#[async_trait]
pub trait AgentClient: Send + Sync + Debug {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, CollaboratorError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContactInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// CRM lead store. The engine only creates or advances leads; listing and
/// editing belong to the CRM pages outside the core.
#[async_trait]
pub trait LeadStore: Send + Sync + Debug {
    async fn create_or_advance(
        &self,
        tenant_id: &str,
        contact: &ContactInfo,
        stage: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Tenant-scoped key/value constants backing [`crate::vars::VariableStore`].
#[async_trait]
pub trait ConstantsSource: Send + Sync + Debug {
    async fn fetch(&self, tenant_id: &str) -> Result<HashMap<String, String>, CollaboratorError>;
}

/// Everything node executors may reach out to, bundled for catalog wiring.
#[derive(Clone)]
pub struct Collaborators {
    pub scheduling: Arc<dyn SchedulingProvider>,
    pub agent: Arc<dyn AgentClient>,
    pub leads: Arc<dyn LeadStore>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub meter: Arc<UsageMeter>,
    pub events: EventBus,
}
