//! Built-in node executors, one per [`crate::graph::NodeKind`] variant.

mod ai;
mod appointment;
mod availability;
mod buttons;
mod message;
mod qualify;

pub use ai::AiResponseExecutor;
pub use appointment::{
    BookAppointmentExecutor, CancelAppointmentExecutor, RescheduleAppointmentExecutor,
};
pub use availability::CheckAvailabilityExecutor;
pub use buttons::{ButtonsExecutor, ListExecutor};
pub use message::MessageExecutor;
pub use qualify::LeadQualificationExecutor;
