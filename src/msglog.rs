//! Append-only conversation transcript. Write-only from the engine's
//! perspective; used for audit and support tooling, never for control flow.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub session_id: String,
    pub direction: Direction,
    pub content: String,
    /// "text", "buttons" or "list" as delivered to the end user.
    pub kind: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl MessageRecord {
    pub fn new(
        session_id: impl Into<String>,
        direction: Direction,
        content: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            direction,
            content: content.into(),
            kind: kind.into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, record: MessageRecord);
}

#[derive(Debug, Default)]
pub struct InMemoryMessageLog {
    entries: DashMap<String, Vec<MessageRecord>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(&self, session_id: &str) -> Vec<MessageRecord> {
        self.entries
            .get(session_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn append(&self, record: MessageRecord) {
        self.entries
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
    }
}
