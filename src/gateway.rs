//! Outbound channel delivery. The core only depends on the
//! `send(message) -> outcome` capability; the concrete WhatsApp-family
//! provider lives behind this trait in the surrounding application.

use std::fmt::Debug;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::Button;
use crate::session::ChannelType;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The provider answered but refused the message (bad recipient,
    /// unsupported affordance). Logged, never retried by the core.
    #[error("channel rejected message: {0}")]
    Rejected(String),
    /// The provider could not be reached at all.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutboundMessage {
    pub channel_type: ChannelType,
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl OutboundMessage {
    pub fn text(channel_type: ChannelType, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_type,
            to: to.into(),
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

#[async_trait]
pub trait MessagingGateway: Send + Sync + Debug {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt, GatewayError>;
}
