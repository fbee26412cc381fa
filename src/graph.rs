//! The persisted conversation graph a tenant authors in the visual builder,
//! plus its load-time compilation: strongly-typed node configs, the
//! `(source, handle) -> target` route index, and authoring-error diagnostics.
//!
//! Graphs are read-only at runtime. A new activation starts fresh sessions;
//! live sessions never see a mutated graph.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::Dfs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::node::{
    Button, HANDLE_AVAILABLE, HANDLE_DEFAULT, HANDLE_ERROR, HANDLE_FAILURE, HANDLE_HIGH,
    HANDLE_LOW, HANDLE_MEDIUM, HANDLE_SUCCESS, HANDLE_UNAVAILABLE,
};

/// WhatsApp interactive replies allow at most 3 buttons and 10 list rows.
pub const MAX_BUTTONS: usize = 3;
pub const MAX_LIST_ITEMS: usize = 10;

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid flow: {0}")]
    Invalid(String),
}

/// Wire shape: `{ id, tenantId, version, start?, nodes: [...], edges: [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub id: String,
    pub tenant_id: String,
    #[serde(default = "FlowGraph::default_version")]
    pub version: u32,
    /// Explicit start node; defaults to the first node without an incoming
    /// edge, else the first node in authoring order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// `{ id, type, data }` on the wire; `(type, data)` deserialize into the
/// [`NodeKind`] tagged union so every config is validated at load time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    /// Disambiguates multi-output nodes; absent means `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
}

impl Edge {
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(HANDLE_DEFAULT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum NodeKind {
    Message(MessageConfig),
    Buttons(ButtonsConfig),
    List(ListConfig),
    CheckAvailability(CheckAvailabilityConfig),
    BookAppointment(BookAppointmentConfig),
    CancelAppointment(CancelAppointmentConfig),
    RescheduleAppointment(RescheduleAppointmentConfig),
    LeadQualification(LeadQualificationConfig),
    AiResponse(AiResponseConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageConfig {
    /// Outbound text; `{{...}}` placeholders are resolved at send time.
    pub text: String,
    #[serde(default)]
    pub wait_for_response: bool,
    /// Variable that receives the raw reply when waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
    /// Typing-simulation pause before the message is produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsConfig {
    pub text: String,
    pub buttons: Vec<Button>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListConfig {
    pub text: String,
    pub items: Vec<Button>,
    /// Label on the list-opener button some channels render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckAvailabilityConfig {
    /// Date to check, usually a template like `{{appointment_date}}`.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Overrides for the default availability messages. Both may reference
    /// `{{date}}` and, for the available case, `{{slots}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookAppointmentConfig {
    pub date: String,
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Advance the session's lead to this stage on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_stage: Option<String>,
    /// Channel id of a human agent to notify on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactVariables>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelAppointmentConfig {
    /// Template resolving to the appointment to cancel.
    pub appointment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleAppointmentConfig {
    pub appointment_id: String,
    pub date: String,
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_agent: Option<String>,
}

/// Which variables hold the end user's contact details when a node creates
/// or advances a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactVariables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_variable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeadQualificationConfig {
    /// Variable holding the numeric score, usually captured earlier in the
    /// conversation.
    #[serde(default = "LeadQualificationConfig::default_score_variable")]
    pub score_variable: String,
    pub high_score_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium_score_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_score_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_score_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactVariables>,
}

impl LeadQualificationConfig {
    fn default_score_variable() -> String {
        "lead_score".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiResponseConfig {
    /// Prompt template; resolved against the conversation before the call.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sent instead of the AI reply on collaborator failure or timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
    /// Sent on the `error` handle when the tenant's token quota is spent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Message(_) => "message",
            NodeKind::Buttons(_) => "buttons",
            NodeKind::List(_) => "list",
            NodeKind::CheckAvailability(_) => "check-availability",
            NodeKind::BookAppointment(_) => "book-appointment",
            NodeKind::CancelAppointment(_) => "cancel-appointment",
            NodeKind::RescheduleAppointment(_) => "reschedule-appointment",
            NodeKind::LeadQualification(_) => "lead-qualification",
            NodeKind::AiResponse(_) => "ai-response",
        }
    }

    /// Whether the interpreter must suspend at this node until the next
    /// inbound message.
    pub fn waits_for_input(&self) -> bool {
        match self {
            NodeKind::Message(cfg) => cfg.wait_for_response,
            NodeKind::Buttons(_) | NodeKind::List(_) => true,
            _ => false,
        }
    }

    /// Variable name receiving the user's reply when this node waits.
    pub fn capture_as(&self) -> Option<&str> {
        match self {
            NodeKind::Message(cfg) => cfg.capture_as.as_deref(),
            NodeKind::Buttons(cfg) => cfg.capture_as.as_deref(),
            NodeKind::List(cfg) => cfg.capture_as.as_deref(),
            NodeKind::AiResponse(cfg) => cfg.capture_as.as_deref(),
            _ => None,
        }
    }

    /// Configured choices for button/list nodes.
    pub fn choices(&self) -> Option<&[Button]> {
        match self {
            NodeKind::Buttons(cfg) => Some(&cfg.buttons),
            NodeKind::List(cfg) => Some(&cfg.items),
            _ => None,
        }
    }

    /// The logical output handles this node kind can produce.
    pub fn declared_handles(&self) -> Vec<String> {
        match self {
            NodeKind::Message(_) => vec![HANDLE_DEFAULT.to_string()],
            NodeKind::Buttons(cfg) => std::iter::once(HANDLE_DEFAULT.to_string())
                .chain(cfg.buttons.iter().map(|b| b.value.clone()))
                .collect(),
            NodeKind::List(cfg) => std::iter::once(HANDLE_DEFAULT.to_string())
                .chain(cfg.items.iter().map(|b| b.value.clone()))
                .collect(),
            NodeKind::CheckAvailability(_) => vec![
                HANDLE_AVAILABLE.to_string(),
                HANDLE_UNAVAILABLE.to_string(),
                HANDLE_ERROR.to_string(),
            ],
            NodeKind::BookAppointment(_)
            | NodeKind::CancelAppointment(_)
            | NodeKind::RescheduleAppointment(_) => {
                vec![HANDLE_SUCCESS.to_string(), HANDLE_FAILURE.to_string()]
            }
            NodeKind::LeadQualification(_) => vec![
                HANDLE_HIGH.to_string(),
                HANDLE_MEDIUM.to_string(),
                HANDLE_LOW.to_string(),
            ],
            NodeKind::AiResponse(_) => {
                vec![HANDLE_DEFAULT.to_string(), HANDLE_ERROR.to_string()]
            }
        }
    }
}

impl FlowGraph {
    fn default_version() -> u32 {
        1
    }

    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            version,
            start: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(Node {
            id: id.into(),
            kind,
        });
        self
    }

    pub fn add_edge(
        mut self,
        source: impl Into<String>,
        handle: Option<&str>,
        target: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        self.edges.push(Edge {
            id: format!("e{}", self.edges.len() + 1),
            source,
            source_handle: handle.map(|h| h.to_string()),
            target,
        });
        self
    }

    pub fn with_start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }
}

/// A validated, route-indexed graph ready for interpretation.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    graph: FlowGraph,
    start: String,
    node_index: HashMap<String, usize>,
    /// source node id -> handle -> target node id.
    routes: HashMap<String, HashMap<String, String>>,
}

impl CompiledFlow {
    /// Validate and index `graph`. Authoring sloppiness (duplicate edges,
    /// dangling references, over-cap buttons, cycles) is repaired or warned
    /// about, never fatal; only a structurally unusable graph errors.
    pub fn compile(mut graph: FlowGraph) -> Result<Self, FlowError> {
        if graph.nodes.is_empty() {
            return Err(FlowError::Invalid(format!(
                "flow `{}` has no nodes",
                graph.id
            )));
        }

        let mut node_index = HashMap::with_capacity(graph.nodes.len());
        for (pos, node) in graph.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), pos).is_some() {
                return Err(FlowError::Invalid(format!(
                    "flow `{}` declares node `{}` twice",
                    graph.id, node.id
                )));
            }
        }

        // Cap interactive affordances at what the channel can render.
        for node in &mut graph.nodes {
            match &mut node.kind {
                NodeKind::Buttons(cfg) if cfg.buttons.len() > MAX_BUTTONS => {
                    warn!(
                        flow = %graph.id,
                        node = %node.id,
                        configured = cfg.buttons.len(),
                        "more than {MAX_BUTTONS} buttons configured; extras dropped"
                    );
                    cfg.buttons.truncate(MAX_BUTTONS);
                }
                NodeKind::List(cfg) if cfg.items.len() > MAX_LIST_ITEMS => {
                    warn!(
                        flow = %graph.id,
                        node = %node.id,
                        configured = cfg.items.len(),
                        "more than {MAX_LIST_ITEMS} list items configured; extras dropped"
                    );
                    cfg.items.truncate(MAX_LIST_ITEMS);
                }
                _ => {}
            }
        }

        let mut routes: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut has_incoming: HashSet<&str> = HashSet::new();
        for edge in &graph.edges {
            if !node_index.contains_key(&edge.source) || !node_index.contains_key(&edge.target) {
                warn!(
                    flow = %graph.id,
                    edge = %edge.id,
                    source = %edge.source,
                    target = %edge.target,
                    "edge references an unknown node; dropped"
                );
                continue;
            }
            has_incoming.insert(edge.target.as_str());
            let per_node = routes.entry(edge.source.clone()).or_default();
            if per_node.contains_key(edge.handle()) {
                warn!(
                    flow = %graph.id,
                    node = %edge.source,
                    handle = %edge.handle(),
                    "duplicate edge for handle; keeping the first in authoring order"
                );
                continue;
            }
            per_node.insert(edge.handle().to_string(), edge.target.clone());
        }

        let start = match &graph.start {
            Some(start) => {
                if !node_index.contains_key(start) {
                    return Err(FlowError::Invalid(format!(
                        "flow `{}` start node `{}` does not exist",
                        graph.id, start
                    )));
                }
                start.clone()
            }
            None => graph
                .nodes
                .iter()
                .find(|n| !has_incoming.contains(n.id.as_str()))
                .unwrap_or(&graph.nodes[0])
                .id
                .clone(),
        };

        Self::diagnose(&graph, &routes, &start);

        Ok(Self {
            graph,
            start,
            node_index,
            routes,
        })
    }

    /// Load-time hygiene warnings: cycles (guarded by the hop cap at
    /// runtime) and nodes unreachable from the start node.
    fn diagnose(graph: &FlowGraph, routes: &HashMap<String, HashMap<String, String>>, start: &str) {
        let mut pg: StableDiGraph<&str, ()> = StableDiGraph::new();
        let mut ix: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &graph.nodes {
            ix.insert(node.id.as_str(), pg.add_node(node.id.as_str()));
        }
        for (source, per_handle) in routes {
            for target in per_handle.values() {
                pg.add_edge(ix[source.as_str()], ix[target.as_str()], ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&pg) {
            warn!(flow = %graph.id, "flow contains a cycle; the runtime hop cap will bound it");
        }

        let mut reached = vec![false; graph.nodes.len()];
        let mut dfs = Dfs::new(&pg, ix[start]);
        while let Some(nx) = dfs.next(&pg) {
            if let Some(pos) = graph.nodes.iter().position(|n| n.id == pg[nx]) {
                reached[pos] = true;
            }
        }
        for (node, seen) in graph.nodes.iter().zip(reached) {
            if !seen {
                warn!(flow = %graph.id, node = %node.id, "node is unreachable from the start node");
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.graph.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.graph.tenant_id
    }

    pub fn version(&self) -> u32 {
        self.graph.version
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&pos| &self.graph.nodes[pos])
    }

    /// O(1) handle resolution against the index built at load time.
    pub fn route(&self, node_id: &str, handle: &str) -> Option<&str> {
        self.routes
            .get(node_id)
            .and_then(|per_node| per_node.get(handle))
            .map(String::as_str)
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }
}

/// Binds a tenant to its published flow version.
#[derive(Debug, Clone)]
pub struct Activation {
    pub flow: Arc<CompiledFlow>,
    pub activated_at: DateTime<Utc>,
}

/// All activated flows, keyed by tenant. Process-wide and cheap to clone
/// handles out of; graphs themselves are immutable once compiled.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    active: DashMap<String, Activation>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, flow: CompiledFlow) {
        let tenant = flow.tenant_id().to_string();
        info!(tenant = %tenant, flow = %flow.id(), version = flow.version(), "activated flow");
        self.active.insert(
            tenant,
            Activation {
                flow: Arc::new(flow),
                activated_at: Utc::now(),
            },
        );
    }

    pub fn deactivate(&self, tenant_id: &str) {
        if self.active.remove(tenant_id).is_some() {
            info!(tenant = %tenant_id, "deactivated flow");
        }
    }

    pub fn active_for(&self, tenant_id: &str) -> Option<Arc<CompiledFlow>> {
        self.active.get(tenant_id).map(|a| a.flow.clone())
    }

    pub fn load_from_file(path: &Path) -> Result<CompiledFlow, FlowError> {
        let json = fs::read_to_string(path).map_err(|e| FlowError::Io(e.to_string()))?;
        let graph: FlowGraph =
            serde_json::from_str(&json).map_err(|e| FlowError::Parse(e.to_string()))?;
        CompiledFlow::compile(graph)
    }

    pub fn save_to_file(path: &Path, graph: &FlowGraph) -> Result<(), FlowError> {
        let json =
            serde_json::to_string_pretty(graph).map_err(|e| FlowError::Parse(e.to_string()))?;
        fs::write(path, json).map_err(|e| FlowError::Io(e.to_string()))
    }

    /// Activate every `.flow.json` found in `dir`. Files that fail to load
    /// are logged and skipped so one bad export cannot take down the rest.
    pub fn load_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(".flow.json") {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(flow) => {
                    self.activate(flow);
                    loaded += 1;
                }
                Err(e) => warn!(file = %path.display(), "failed to load flow: {e}"),
            }
        }
        Ok(loaded)
    }
}
