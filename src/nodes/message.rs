use async_trait::async_trait;
use schemars::schema_for;
use tokio::time::{Duration, sleep};

use crate::graph::{MessageConfig, Node, NodeKind};
use crate::node::{ConversationContext, HANDLE_DEFAULT, NodeError, NodeExecutor, NodeOut};

/// Upper bound on the typing-simulation delay an author can configure.
const MAX_DELAY_MS: u64 = 10_000;

/// Plain outbound text. Pauses the walk when `wait_for_response` is set.
#[derive(Debug, Default)]
pub struct MessageExecutor;

#[async_trait]
impl NodeExecutor for MessageExecutor {
    fn kind(&self) -> &'static str {
        "message"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(MessageConfig)
    }

    async fn execute(
        &self,
        _tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::Message(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a message node",
                node.id
            )));
        };

        if let Some(delay) = cfg.delay_ms.filter(|d| *d > 0) {
            sleep(Duration::from_millis(delay.min(MAX_DELAY_MS))).await;
        }

        let text = ctx.render(&cfg.text);
        if cfg.wait_for_response {
            Ok(NodeOut::prompt(text))
        } else {
            Ok(NodeOut::say(text, HANDLE_DEFAULT))
        }
    }
}
