//! convoflow — the conversation flow engine behind a multi-tenant chatbot
//! builder. Tenant-authored node graphs (persisted as JSON) are interpreted
//! at runtime to drive stateful, multi-turn WhatsApp-style conversations:
//! branching on buttons and lists, variable capture and substitution,
//! appointment-availability lookups, AI replies and token metering.
//!
//! The crate is invoked in-process by the surrounding application, which
//! terminates channel webhooks and wires the collaborators in
//! ([`collaborator`]). Start with [`engine::FlowEngine::handle_inbound`].

pub mod agent;
pub mod catalog;
pub mod collaborator;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod graph;
pub mod logger;
pub mod metering;
pub mod msglog;
pub mod node;
pub mod nodes;
pub mod session;
pub mod testutil;
pub mod vars;

pub use catalog::NodeCatalog;
pub use config::EngineOptions;
pub use engine::{EngineError, FlowEngine, InboundMessage, PassReport};
pub use events::{DomainEvent, EventBus};
pub use graph::{CompiledFlow, FlowError, FlowGraph, FlowRegistry, NodeKind};
pub use metering::UsageMeter;
pub use session::{ChannelType, ConversationSession, InMemorySessionStore, SessionStatus};
pub use vars::VariableStore;
