//! Scripted fakes for the engine's collaborators. Shipped as a public
//! module so integration tests and downstream crates can drive full
//! conversations without a real scheduler, CRM, AI backend or channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::time::{Duration, sleep};

use crate::collaborator::{
    AgentClient, AvailabilityQuery, Booking, BookingRequest, CollaboratorError, Collaborators,
    ConstantsSource, ContactInfo, DayAvailability, Generation, LeadStore, SchedulingProvider,
};
use crate::events::EventBus;
use crate::gateway::{DeliveryReceipt, GatewayError, MessagingGateway, OutboundMessage};
use crate::metering::UsageMeter;

/// Records everything it is asked to deliver; can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<OutboundMessage>>,
    down: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("gateway lock").clone()
    }

    pub fn last(&self) -> Option<OutboundMessage> {
        self.sent.lock().expect("gateway lock").last().cloned()
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn go_up(&self) {
        self.down.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt, GatewayError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable("gateway down".into()));
        }
        let mut sent = self.sent.lock().expect("gateway lock");
        sent.push(message);
        Ok(DeliveryReceipt {
            message_id: format!("m{}", sent.len()),
        })
    }
}

/// Scheduling provider scripted per date. Unknown dates answer as closed.
#[derive(Debug, Default)]
pub struct ScriptedScheduling {
    days: Mutex<HashMap<String, DayAvailability>>,
    bookings: Mutex<Vec<BookingRequest>>,
    cancelled: Mutex<Vec<String>>,
    reject_bookings: AtomicBool,
    unreachable: AtomicBool,
    counter: AtomicU64,
}

impl ScriptedScheduling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_day(&self, date: &str, day: DayAvailability) {
        self.days
            .lock()
            .expect("days lock")
            .insert(date.to_string(), day);
    }

    pub fn reject_bookings(&self) {
        self.reject_bookings.store(true, Ordering::SeqCst);
    }

    pub fn fail_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn bookings(&self) -> Vec<BookingRequest> {
        self.bookings.lock().expect("bookings lock").clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }

    fn check_reachable(&self) -> Result<(), CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(CollaboratorError::Unreachable("scripted outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SchedulingProvider for ScriptedScheduling {
    async fn availability_for_date(
        &self,
        _tenant_id: &str,
        query: &AvailabilityQuery,
    ) -> Result<DayAvailability, CollaboratorError> {
        self.check_reachable()?;
        Ok(self
            .days
            .lock()
            .expect("days lock")
            .get(&query.date)
            .cloned()
            .unwrap_or(DayAvailability {
                available_slots: vec![],
                business_hours: None,
                is_closed: true,
            }))
    }

    async fn book(
        &self,
        _tenant_id: &str,
        request: &BookingRequest,
    ) -> Result<Booking, CollaboratorError> {
        self.check_reachable()?;
        if self.reject_bookings.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected("slot taken".into()));
        }
        self.bookings
            .lock()
            .expect("bookings lock")
            .push(request.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Booking {
            id: format!("appt-{n}"),
            date: request.date.clone(),
            slot: request.slot.clone(),
        })
    }

    async fn cancel(
        &self,
        _tenant_id: &str,
        appointment_id: &str,
    ) -> Result<(), CollaboratorError> {
        self.check_reachable()?;
        if !appointment_id.starts_with("appt-") {
            return Err(CollaboratorError::Rejected(format!(
                "unknown appointment {appointment_id}"
            )));
        }
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(appointment_id.to_string());
        Ok(())
    }

    async fn reschedule(
        &self,
        tenant_id: &str,
        appointment_id: &str,
        request: &BookingRequest,
    ) -> Result<Booking, CollaboratorError> {
        self.cancel(tenant_id, appointment_id).await?;
        self.book(tenant_id, request).await
    }
}

/// Always answers with the configured text; can be slowed down to trip the
/// engine's AI timeout or switched to fail outright.
#[derive(Debug)]
pub struct CannedAgent {
    reply: Mutex<String>,
    tokens: AtomicU64,
    delay_ms: AtomicU64,
    fail: AtomicBool,
    calls: AtomicU64,
}

impl CannedAgent {
    pub fn new(reply: &str, tokens: u64) -> Self {
        Self {
            reply: Mutex::new(reply.to_string()),
            tokens: AtomicU64::new(tokens),
            delay_ms: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn slow_down(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for CannedAgent {
    async fn generate(
        &self,
        _prompt: &str,
        _model: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<Generation, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::Unreachable("scripted failure".into()));
        }
        Ok(Generation {
            text: self.reply.lock().expect("reply lock").clone(),
            tokens_used: self.tokens.load(Ordering::SeqCst),
        })
    }
}

/// In-memory CRM: returns `lead-N` ids and remembers the stages walked.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    stages: Mutex<Vec<(String, String)>>,
    unreachable: AtomicBool,
    counter: AtomicU64,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<(String, String)> {
        self.stages.lock().expect("stages lock").clone()
    }

    pub fn fail_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn create_or_advance(
        &self,
        tenant_id: &str,
        _contact: &ContactInfo,
        stage: &str,
    ) -> Result<String, CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unreachable("crm down".into()));
        }
        self.stages
            .lock()
            .expect("stages lock")
            .push((tenant_id.to_string(), stage.to_string()));
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("lead-{n}"))
    }
}

/// Static tenant constants, writable from tests.
#[derive(Debug, Default)]
pub struct StaticConstants {
    values: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl StaticConstants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tenant_id: &str, key: &str, value: &str) {
        self.values
            .lock()
            .expect("constants lock")
            .entry(tenant_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConstantsSource for StaticConstants {
    async fn fetch(&self, tenant_id: &str) -> Result<HashMap<String, String>, CollaboratorError> {
        Ok(self
            .values
            .lock()
            .expect("constants lock")
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Concrete fakes plus the [`Collaborators`] bundle wired from them, so
/// tests can both inject and inspect.
#[derive(Clone)]
pub struct TestWorld {
    pub scheduling: Arc<ScriptedScheduling>,
    pub agent: Arc<CannedAgent>,
    pub leads: Arc<MemoryLeadStore>,
    pub gateway: Arc<RecordingGateway>,
    pub meter: Arc<UsageMeter>,
    pub events: EventBus,
    pub constants: Arc<StaticConstants>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self {
            scheduling: Arc::new(ScriptedScheduling::new()),
            agent: Arc::new(CannedAgent::new("Our opening hours are 9 to 5.", 42)),
            leads: Arc::new(MemoryLeadStore::new()),
            gateway: Arc::new(RecordingGateway::new()),
            meter: Arc::new(UsageMeter::new()),
            events: EventBus::new(),
            constants: Arc::new(StaticConstants::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            scheduling: self.scheduling.clone(),
            agent: self.agent.clone(),
            leads: self.leads.clone(),
            gateway: self.gateway.clone(),
            meter: self.meter.clone(),
            events: self.events.clone(),
        }
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for tests that only need the trait-object bundle.
pub fn test_collaborators() -> Collaborators {
    TestWorld::new().collaborators()
}
