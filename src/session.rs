//! Per-end-user conversation sessions and their store. Sessions are soft
//! state: they transition to `completed`/`error` but are never hard-deleted
//! by the engine (the in-memory store evicts on TTL like any cache).

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::graph::CompiledFlow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    WhatsApp,
    Sms,
    WebChat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub tenant_id: String,
    pub user_channel_id: String,
    pub channel_type: ChannelType,
    /// Flow binding taken at creation; a newer activation starts a fresh
    /// session instead of mutating this one.
    pub flow_id: String,
    pub flow_version: u32,
    pub current_node_id: String,
    pub visited_nodes: Vec<String>,
    pub variables: HashMap<String, Value>,
    pub lead_id: Option<String>,
    pub status: SessionStatus,
    /// Suspended at `current_node_id` waiting for the user's reply.
    pub awaiting_input: bool,
    /// Consecutive invalid replies at the current prompt.
    pub input_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(
        tenant_id: &str,
        channel_type: ChannelType,
        user_channel_id: &str,
        flow: &CompiledFlow,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            user_channel_id: user_channel_id.to_string(),
            channel_type,
            flow_id: flow.id().to_string(),
            flow_version: flow.version(),
            current_node_id: flow.start().to_string(),
            visited_nodes: Vec::new(),
            variables: HashMap::new(),
            lead_id: None,
            status: SessionStatus::Active,
            awaiting_input: false,
            input_retries: 0,
            created_at: now,
            last_interaction_at: now,
        }
    }

    /// Identity key for the store's channel index and the per-session lock
    /// table; one-to-one with the end user on a channel.
    pub fn channel_key(tenant_id: &str, user_channel_id: &str) -> String {
        format!("{tenant_id}|{user_channel_id}")
    }

    pub fn touch(&mut self) {
        self.last_interaction_at = Utc::now();
    }

    pub fn is_bound_to(&self, flow: &CompiledFlow) -> bool {
        self.flow_id == flow.id() && self.flow_version == flow.version()
    }
}

/// Session persistence. The engine writes a session exactly once per
/// interpreter pass; partial walks are never observable through this trait.
#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn get(&self, session_id: &str) -> Option<ConversationSession>;
    /// The session currently bound to a channel identity, if any.
    async fn find_by_channel(&self, channel_key: &str) -> Option<ConversationSession>;
    /// Upsert; also (re)binds the channel identity to this session id.
    async fn save(&self, session: &ConversationSession);
    async fn remove(&self, session_id: &str);
    fn clear(&self);
}

#[derive(Debug, Clone)]
pub struct InMemorySessionStore {
    sessions: Cache<String, ConversationSession>,
    by_channel: Cache<String, String>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        let sessions = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|key: Arc<String>, _session, cause| {
                info!("session evicted: id={key}, cause={cause:?}");
            })
            .build();
        let by_channel = Cache::builder().time_to_idle(ttl).build();
        Arc::new(Self {
            sessions,
            by_channel,
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Option<ConversationSession> {
        self.sessions.get(session_id).await
    }

    async fn find_by_channel(&self, channel_key: &str) -> Option<ConversationSession> {
        let session_id = self.by_channel.get(channel_key).await?;
        self.sessions.get(&session_id).await
    }

    async fn save(&self, session: &ConversationSession) {
        let key =
            ConversationSession::channel_key(&session.tenant_id, &session.user_channel_id);
        self.by_channel.insert(key, session.id.clone()).await;
        self.sessions
            .insert(session.id.clone(), session.clone())
            .await;
    }

    async fn remove(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id).await {
            let key =
                ConversationSession::channel_key(&session.tenant_id, &session.user_channel_id);
            self.by_channel.invalidate(&key).await;
        }
        self.sessions.invalidate(session_id).await;
    }

    fn clear(&self) {
        self.sessions.invalidate_all();
        self.by_channel.invalidate_all();
    }
}

/// One async mutex per channel identity. Held across a whole interpreter
/// pass (load, walk, persist) so two rapid inbound messages for the same
/// session are serialized in arrival order instead of racing on
/// `current_node_id`/`variables`.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CompiledFlow, FlowGraph, MessageConfig, NodeKind};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn flow() -> CompiledFlow {
        let graph = FlowGraph::new("f1", "t1", 1).add_node(
            "start",
            NodeKind::Message(MessageConfig {
                text: "hola".into(),
                wait_for_response: false,
                capture_as: None,
                delay_ms: None,
            }),
        );
        CompiledFlow::compile(graph).unwrap()
    }

    #[tokio::test]
    async fn save_binds_channel_identity() {
        let store = InMemorySessionStore::new(StdDuration::from_secs(60));
        let flow = flow();
        let session = ConversationSession::new("t1", ChannelType::WhatsApp, "+5215512345678", &flow);
        store.save(&session).await;

        let key = ConversationSession::channel_key("t1", "+5215512345678");
        let found = store.find_by_channel(&key).await.unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.current_node_id, "start");
        assert_eq!(found.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn new_session_rebinds_channel() {
        let store = InMemorySessionStore::new(StdDuration::from_secs(60));
        let flow = flow();
        let first = ConversationSession::new("t1", ChannelType::WhatsApp, "user", &flow);
        store.save(&first).await;

        let second = ConversationSession::new("t1", ChannelType::WhatsApp, "user", &flow);
        store.save(&second).await;

        let key = ConversationSession::channel_key("t1", "user");
        assert_eq!(store.find_by_channel(&key).await.unwrap().id, second.id);
        // the first session stays addressable for diagnostics
        assert!(store.get(&first.id).await.is_some());
    }

    #[tokio::test]
    async fn remove_clears_channel_index() {
        let store = InMemorySessionStore::new(StdDuration::from_secs(60));
        let flow = flow();
        let session = ConversationSession::new("t1", ChannelType::WhatsApp, "user", &flow);
        store.save(&session).await;
        store.remove(&session.id).await;

        let key = ConversationSession::channel_key("t1", "user");
        assert!(store.find_by_channel(&key).await.is_none());
        assert!(store.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn variables_survive_a_save_round_trip() {
        let store = InMemorySessionStore::new(StdDuration::from_secs(60));
        let flow = flow();
        let mut session = ConversationSession::new("t1", ChannelType::WhatsApp, "user", &flow);
        session.variables.insert("name".into(), json!("Ana"));
        store.save(&session).await;

        let loaded = store.get(&session.id).await.unwrap();
        assert_eq!(loaded.variables.get("name"), Some(&json!("Ana")));
    }

    #[tokio::test]
    async fn locks_serialize_same_key() {
        use std::sync::Arc as StdArc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let locks = StdArc::new(SessionLocks::new());
        let counter = StdArc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("t1|user").await;
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(StdDuration::from_millis(2)).await;
                // nobody else incremented while we held the lock
                assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
