//! The flow interpreter. One inbound message becomes one interpreter pass:
//! load (or create) the session, resume at its current node, walk the graph
//! until something needs user input or the flow ends, persist once, then
//! hand the accumulated messages to the gateway.
//!
//! Passes for the same channel identity are serialized through
//! [`SessionLocks`]; passes for different identities run fully in parallel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::NodeCatalog;
use crate::config::EngineOptions;
use crate::events::{DomainEvent, EventBus};
use crate::gateway::{MessagingGateway, OutboundMessage};
use crate::graph::{CompiledFlow, FlowRegistry, Node};
use crate::msglog::{Direction, MessageLog, MessageRecord};
use crate::node::{Button, ConversationContext, HANDLE_DEFAULT, NodeAction, NodeOut};
use crate::session::{
    ChannelType, ConversationSession, SessionLocks, SessionStatus, SessionStore,
};
use crate::vars::VariableStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active flow for tenant `{0}`")]
    NoActiveFlow(String),
}

/// One inbound end-user message, as handed over by the webhook layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub tenant_id: String,
    pub channel_type: ChannelType,
    pub user_channel_id: String,
    pub text: String,
}

/// Summary of one interpreter pass, mainly for the caller's logging and for
/// tests; the user-visible effect already happened through the gateway.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub hops: usize,
    pub delivered: Option<OutboundMessage>,
}

/// Messages accumulated during a single pass. Only the last message's
/// buttons survive: earlier prompts are history by the time the user sees
/// the buffer, so only the final prompt stays interactive.
#[derive(Debug, Default)]
struct PassBuffer {
    texts: Vec<String>,
    buttons: Vec<Button>,
}

impl PassBuffer {
    fn push(&mut self, out: &NodeOut) {
        if let Some(message) = out.message() {
            self.texts.push(message.to_string());
            self.buttons = out.buttons().to_vec();
        }
    }

    fn push_text(&mut self, text: &str) {
        self.texts.push(text.to_string());
        self.buttons.clear();
    }

    fn into_outbound(
        self,
        separator: &str,
        channel_type: ChannelType,
        to: &str,
    ) -> Option<OutboundMessage> {
        if self.texts.is_empty() {
            return None;
        }
        Some(
            OutboundMessage::text(channel_type, to, self.texts.join(separator))
                .with_buttons(self.buttons),
        )
    }
}

/// A matched reply to a waiting node: the handle to follow and the value to
/// store in the node's capture variable.
struct Reply {
    handle: String,
    captured: String,
}

pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    catalog: Arc<NodeCatalog>,
    gateway: Arc<dyn MessagingGateway>,
    vars: Arc<VariableStore>,
    msglog: Arc<dyn MessageLog>,
    events: EventBus,
    options: EngineOptions,
}

impl FlowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FlowRegistry>,
        sessions: Arc<dyn SessionStore>,
        catalog: Arc<NodeCatalog>,
        gateway: Arc<dyn MessagingGateway>,
        vars: Arc<VariableStore>,
        msglog: Arc<dyn MessageLog>,
        events: EventBus,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            sessions,
            locks: SessionLocks::new(),
            catalog,
            gateway,
            vars,
            msglog,
            events,
            options,
        }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Process one inbound message end to end. Serialized per channel
    /// identity: a second message arriving while the first is in flight
    /// waits for the lock instead of racing on the session.
    #[tracing::instrument(
        name = "handle_inbound",
        skip(self, inbound),
        fields(tenant = %inbound.tenant_id, channel = %inbound.user_channel_id)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<PassReport, EngineError> {
        let flow = self
            .registry
            .active_for(&inbound.tenant_id)
            .ok_or_else(|| EngineError::NoActiveFlow(inbound.tenant_id.clone()))?;

        let key =
            ConversationSession::channel_key(&inbound.tenant_id, &inbound.user_channel_id);
        let _guard = self.locks.acquire(&key).await;

        let mut session = match self.sessions.find_by_channel(&key).await {
            Some(errored) if errored.status == SessionStatus::Error => {
                // Still addressable for diagnostics, but it only ever
                // answers with the generic fallback.
                return Ok(self.answer_errored_session(errored, &inbound).await);
            }
            Some(active) if active.status == SessionStatus::Active && active.is_bound_to(&flow) => {
                active
            }
            stale => {
                if let Some(stale) = stale {
                    info!(
                        previous = %stale.id,
                        "starting a fresh session (previous completed or superseded by a new activation)"
                    );
                }
                ConversationSession::new(
                    &inbound.tenant_id,
                    inbound.channel_type,
                    &inbound.user_channel_id,
                    &flow,
                )
            }
        };

        self.msglog
            .append(MessageRecord::new(
                &session.id,
                Direction::Inbound,
                &inbound.text,
                "text",
            ))
            .await;

        let constants = self.vars.constants(&inbound.tenant_id).await;
        let mut ctx = ConversationContext::new(
            &session.id,
            session.channel_type,
            session.variables.clone(),
            constants.as_ref().clone(),
            session.lead_id.clone(),
        );

        let (buffer, hops) = self.run_pass(&flow, &mut session, &mut ctx, &inbound.text).await;

        session.variables = ctx.variables().clone();
        session.lead_id = ctx.lead_id().map(str::to_string);
        session.touch();
        self.sessions.save(&session).await;

        let delivered = match buffer.into_outbound(
            &self.options.message_separator,
            session.channel_type,
            &session.user_channel_id,
        ) {
            Some(outbound) => self.deliver(&session.id, outbound).await,
            None => None,
        };

        Ok(PassReport {
            session_id: session.id,
            status: session.status,
            hops,
            delivered,
        })
    }

    /// The synchronous node walk of one pass. Mutates the session's cursor,
    /// visit trace and status; never persists (the caller does, once).
    async fn run_pass(
        &self,
        flow: &CompiledFlow,
        session: &mut ConversationSession,
        ctx: &mut ConversationContext,
        inbound_text: &str,
    ) -> (PassBuffer, usize) {
        let mut buffer = PassBuffer::default();
        let mut hops = 0usize;
        let mut current = session.current_node_id.clone();
        let tenant_id = session.tenant_id.clone();

        if session.awaiting_input {
            let Some(node) = flow.node(&current) else {
                self.fail(
                    session,
                    &mut buffer,
                    format!("node `{current}` vanished from flow `{}`", flow.id()),
                );
                return (buffer, hops);
            };
            match resolve_reply(node, flow, inbound_text) {
                Some(reply) => {
                    if let Some(name) = node.kind.capture_as() {
                        ctx.set_var(name, json!(reply.captured));
                    }
                    session.input_retries = 0;
                    session.awaiting_input = false;
                    match flow.route(&current, &reply.handle) {
                        Some(next) => current = next.to_string(),
                        None => {
                            self.complete(flow, session);
                            return (buffer, hops);
                        }
                    }
                }
                None => {
                    session.input_retries += 1;
                    if session.input_retries > self.options.max_input_retries {
                        self.fail(
                            session,
                            &mut buffer,
                            format!("gave up after {} invalid replies at `{current}`", session.input_retries - 1),
                        );
                        return (buffer, hops);
                    }
                    warn!(node = %current, retry = session.input_retries, "unrecognized reply; re-prompting");
                    buffer.push_text(&self.options.invalid_input_message);
                    // fall through and re-execute the prompt node
                }
            }
        }

        loop {
            hops += 1;
            if hops > self.options.max_hops {
                error!(
                    flow = %flow.id(),
                    visited = ?session.visited_nodes,
                    "iteration cap of {} exceeded; authoring cycle suspected",
                    self.options.max_hops
                );
                self.fail(
                    session,
                    &mut buffer,
                    format!("iteration cap of {} exceeded", self.options.max_hops),
                );
                break;
            }

            let Some(node) = flow.node(&current) else {
                self.fail(
                    session,
                    &mut buffer,
                    format!("node `{current}` does not exist in flow `{}`", flow.id()),
                );
                break;
            };
            session.current_node_id = current.clone();
            session.visited_nodes.push(current.clone());

            let Some(executor) = self.catalog.get(node.kind.type_name()) else {
                self.fail(
                    session,
                    &mut buffer,
                    format!("no executor registered for `{}`", node.kind.type_name()),
                );
                break;
            };

            let result = executor.execute(&tenant_id, ctx, node).await;
            match result {
                Err(e) => {
                    error!(node = %current, "node execution failed: {e}");
                    self.fail(session, &mut buffer, e.to_string());
                    break;
                }
                Ok(out) => {
                    buffer.push(&out);
                    match out.action() {
                        NodeAction::AwaitInput => {
                            session.awaiting_input = true;
                            break;
                        }
                        NodeAction::Advance { handle } => match flow.route(&current, handle) {
                            Some(next) => current = next.to_string(),
                            None => {
                                self.complete(flow, session);
                                break;
                            }
                        },
                    }
                }
            }
        }

        (buffer, hops)
    }

    fn complete(&self, flow: &CompiledFlow, session: &mut ConversationSession) {
        session.status = SessionStatus::Completed;
        session.awaiting_input = false;
        info!(session = %session.id, flow = %flow.id(), "session completed");
        self.events.publish(DomainEvent::SessionCompleted {
            tenant_id: session.tenant_id.clone(),
            session_id: session.id.clone(),
            flow_id: flow.id().to_string(),
        });
    }

    /// Infrastructure-class failure: mark the session, queue the generic
    /// fallback so the user still hears back, and tell subscribers.
    fn fail(&self, session: &mut ConversationSession, buffer: &mut PassBuffer, reason: String) {
        session.status = SessionStatus::Error;
        session.awaiting_input = false;
        buffer.push_text(&self.options.fallback_message);
        self.events.publish(DomainEvent::SessionFailed {
            tenant_id: session.tenant_id.clone(),
            session_id: session.id.clone(),
            reason,
        });
    }

    async fn answer_errored_session(
        &self,
        session: ConversationSession,
        inbound: &InboundMessage,
    ) -> PassReport {
        self.msglog
            .append(MessageRecord::new(
                &session.id,
                Direction::Inbound,
                &inbound.text,
                "text",
            ))
            .await;
        let outbound = OutboundMessage::text(
            session.channel_type,
            &session.user_channel_id,
            self.options.fallback_message.clone(),
        );
        let delivered = self.deliver(&session.id, outbound).await;
        PassReport {
            session_id: session.id,
            status: SessionStatus::Error,
            hops: 0,
            delivered,
        }
    }

    /// Send through the gateway and log the transcript entry. A delivery
    /// failure is logged and swallowed; retries belong to the gateway
    /// adapter, not to the core.
    async fn deliver(
        &self,
        session_id: &str,
        outbound: OutboundMessage,
    ) -> Option<OutboundMessage> {
        let kind = if outbound.buttons.is_empty() {
            "text"
        } else {
            "buttons"
        };
        match self.gateway.send(outbound.clone()).await {
            Ok(receipt) => {
                self.msglog
                    .append(
                        MessageRecord::new(session_id, Direction::Outbound, &outbound.text, kind)
                            .with_meta("message_id", json!(receipt.message_id)),
                    )
                    .await;
                Some(outbound)
            }
            Err(e) => {
                error!(session = %session_id, "outbound delivery failed: {e}");
                None
            }
        }
    }
}

/// Match the user's reply against a waiting node. Button/list replies match
/// by value, then by label, then case-insensitively; free text falls back
/// to the `default` edge when the author drew one. `None` means the reply
/// was not usable and the prompt should be retried.
fn resolve_reply(node: &Node, flow: &CompiledFlow, text: &str) -> Option<Reply> {
    let trimmed = text.trim();
    let Some(choices) = node.kind.choices() else {
        // plain wait-for-response message: any text continues on `default`
        return Some(Reply {
            handle: HANDLE_DEFAULT.to_string(),
            captured: trimmed.to_string(),
        });
    };

    let lowered = trimmed.to_lowercase();
    let matched = choices
        .iter()
        .find(|b| b.value == trimmed)
        .or_else(|| choices.iter().find(|b| b.text == trimmed))
        .or_else(|| {
            choices
                .iter()
                .find(|b| b.value.to_lowercase() == lowered || b.text.to_lowercase() == lowered)
        });
    if let Some(button) = matched {
        return Some(Reply {
            handle: button.value.clone(),
            captured: button.value.clone(),
        });
    }

    if flow.route(&node.id, HANDLE_DEFAULT).is_some() {
        return Some(Reply {
            handle: HANDLE_DEFAULT.to_string(),
            captured: trimmed.to_string(),
        });
    }
    None
}
