//! The uniform node-executor contract. One executor per node kind, resolved
//! through the [`crate::catalog::NodeCatalog`]; the interpreter turns the
//! returned handle into a concrete next node via the flow's route index.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::Node;
use crate::session::ChannelType;
use crate::vars;

/// Well-known handle names. Button and list nodes additionally expose one
/// handle per configured choice value.
pub const HANDLE_DEFAULT: &str = "default";
pub const HANDLE_AVAILABLE: &str = "available";
pub const HANDLE_UNAVAILABLE: &str = "unavailable";
pub const HANDLE_ERROR: &str = "error";
pub const HANDLE_SUCCESS: &str = "success";
pub const HANDLE_FAILURE: &str = "failure";
pub const HANDLE_HIGH: &str = "high";
pub const HANDLE_MEDIUM: &str = "medium";
pub const HANDLE_LOW: &str = "low";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub value: String,
}

impl Button {
    pub fn new(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            value: value.into(),
        }
    }
}

/// What the interpreter should do after a node ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Follow the edge bound to `handle`; no edge means end of flow.
    Advance { handle: String },
    /// Suspend the walk at this node until the next inbound message.
    AwaitInput,
}

/// Executor output: an optional outbound message, the button/list
/// affordances attached to it, and the interpreter action.
#[derive(Debug, Clone)]
pub struct NodeOut {
    message: Option<String>,
    buttons: Vec<Button>,
    action: NodeAction,
}

impl NodeOut {
    /// Advance silently along `handle`.
    pub fn advance(handle: impl Into<String>) -> Self {
        Self {
            message: None,
            buttons: Vec::new(),
            action: NodeAction::Advance {
                handle: handle.into(),
            },
        }
    }

    /// Emit `message` and advance along `handle`.
    pub fn say(message: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            buttons: Vec::new(),
            action: NodeAction::Advance {
                handle: handle.into(),
            },
        }
    }

    /// Emit `message` and wait for the user's reply.
    pub fn prompt(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            buttons: Vec::new(),
            action: NodeAction::AwaitInput,
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn buttons(&self) -> &[Button] {
        &self.buttons
    }

    pub fn action(&self) -> &NodeAction {
        &self.action
    }
}

/// Infrastructure failures only. Expected business conditions (no
/// availability, invalid input, quota exceeded) are `Ok` results steering
/// to a negative handle; the interpreter maps `NodeError` to a fatal
/// session error.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum NodeError {
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
    #[error("collaborator call failed: {0}")]
    CollaboratorFailed(String),
    #[error("store unreachable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The mutable per-pass view of a conversation: captured variables, the
/// transient fields nodes hand to each other (e.g. `available_slots`), and
/// a snapshot of the tenant's system constants for substitution.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    session_id: String,
    channel_type: ChannelType,
    variables: HashMap<String, Value>,
    transient: HashMap<String, Value>,
    constants: HashMap<String, String>,
    lead_id: Option<String>,
}

impl ConversationContext {
    pub fn new(
        session_id: impl Into<String>,
        channel_type: ChannelType,
        variables: HashMap<String, Value>,
        constants: HashMap<String, String>,
        lead_id: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            channel_type,
            variables,
            transient: HashMap::new(),
            constants,
            lead_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn delete_var(&mut self, name: &str) {
        self.variables.remove(name);
    }

    /// The persisted variable bag; transient fields are not included.
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn transient(&self, name: &str) -> Option<&Value> {
        self.transient.get(name)
    }

    pub fn set_transient(&mut self, name: &str, value: Value) {
        self.transient.insert(name.to_string(), value);
    }

    pub fn lead_id(&self) -> Option<&str> {
        self.lead_id.as_deref()
    }

    pub fn set_lead_id(&mut self, lead_id: impl Into<String>) {
        self.lead_id = Some(lead_id.into());
    }

    /// Resolve `{{...}}` placeholders: variables win over transient fields,
    /// which win over system constants. Unknown keys stay verbatim.
    pub fn render(&self, text: &str) -> String {
        let mut merged: HashMap<String, Value> = self
            .constants
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        for (k, v) in &self.transient {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.variables {
            merged.insert(k.clone(), v.clone());
        }
        vars::resolve(text, &merged)
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync + Debug {
    /// The node-type tag this executor is registered under.
    fn kind(&self) -> &'static str;

    /// Config schema for the builder UI.
    fn config_schema(&self) -> schemars::Schema;

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError>;
}
