use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::schema_for;
use serde_json::json;
use tracing::warn;

use crate::collaborator::AgentClient;
use crate::graph::{AiResponseConfig, Node, NodeKind};
use crate::metering::UsageMeter;
use crate::node::{
    ConversationContext, HANDLE_DEFAULT, HANDLE_ERROR, NodeError, NodeExecutor, NodeOut,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_FALLBACK: &str = "Sorry, I couldn't come up with an answer just now. Please try again.";
const DEFAULT_QUOTA_MESSAGE: &str =
    "Our assistant is unavailable right now. A member of the team will follow up with you.";

/// Calls the AI collaborator with a prompt built from the conversation.
/// Quota exhaustion is a business outcome on `error`; a failing or slow
/// backend degrades to the configured fallback text so the conversation
/// keeps moving. Token usage is recorded exactly once per completed call.
pub struct AiResponseExecutor {
    agent: Arc<dyn AgentClient>,
    meter: Arc<UsageMeter>,
    timeout: Duration,
}

impl std::fmt::Debug for AiResponseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiResponseExecutor")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AiResponseExecutor {
    pub fn new(agent: Arc<dyn AgentClient>, meter: Arc<UsageMeter>, timeout: Duration) -> Self {
        Self {
            agent,
            meter,
            timeout,
        }
    }
}

#[async_trait]
impl NodeExecutor for AiResponseExecutor {
    fn kind(&self) -> &'static str {
        "ai-response"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(AiResponseConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::AiResponse(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not an ai-response node",
                node.id
            )));
        };

        if !self.meter.has_quota(tenant_id) {
            warn!(tenant = %tenant_id, "AI token quota exhausted");
            let message = cfg
                .quota_message
                .clone()
                .unwrap_or_else(|| DEFAULT_QUOTA_MESSAGE.to_string());
            return Ok(NodeOut::say(message, HANDLE_ERROR));
        }

        let prompt = match &cfg.system_prompt {
            Some(system) => format!("{}\n\n{}", ctx.render(system), ctx.render(&cfg.prompt)),
            None => ctx.render(&cfg.prompt),
        };
        let model = cfg.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let temperature = cfg.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = cfg.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let generated = tokio::time::timeout(
            self.timeout,
            self.agent.generate(&prompt, model, temperature, max_tokens),
        )
        .await;

        match generated {
            Ok(Ok(generation)) => {
                self.meter.record_usage(
                    tenant_id,
                    generation.tokens_used,
                    Some(ctx.session_id()),
                );
                if let Some(name) = &cfg.capture_as {
                    ctx.set_var(name, json!(generation.text));
                }
                Ok(NodeOut::say(generation.text, HANDLE_DEFAULT))
            }
            Ok(Err(e)) => {
                warn!(tenant = %tenant_id, "AI generation failed: {e}");
                Ok(NodeOut::say(fallback(cfg), HANDLE_DEFAULT))
            }
            Err(_) => {
                warn!(tenant = %tenant_id, timeout = ?self.timeout, "AI generation timed out");
                Ok(NodeOut::say(fallback(cfg), HANDLE_DEFAULT))
            }
        }
    }
}

fn fallback(cfg: &AiResponseConfig) -> String {
    cfg.fallback_message
        .clone()
        .unwrap_or_else(|| DEFAULT_FALLBACK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAction;
    use crate::session::ChannelType;
    use crate::testutil::TestWorld;
    use std::collections::HashMap;

    fn node() -> Node {
        Node {
            id: "ai1".into(),
            kind: NodeKind::AiResponse(AiResponseConfig {
                prompt: "Answer {{question}} briefly.".into(),
                system_prompt: None,
                model: None,
                temperature: None,
                max_tokens: None,
                fallback_message: Some("Let me get back to you.".into()),
                quota_message: None,
                capture_as: Some("ai_reply".into()),
            }),
        }
    }

    fn ctx() -> ConversationContext {
        let mut vars = HashMap::new();
        vars.insert("question".to_string(), json!("opening hours"));
        ConversationContext::new("s1", ChannelType::WhatsApp, vars, HashMap::new(), None)
    }

    fn exec(world: &TestWorld, timeout: Duration) -> AiResponseExecutor {
        AiResponseExecutor::new(world.agent.clone(), world.meter.clone(), timeout)
    }

    #[tokio::test]
    async fn success_replies_meters_once_and_captures() {
        let world = TestWorld::new();
        let exec = exec(&world, Duration::from_secs(1));

        let mut ctx = ctx();
        let out = exec.execute("t1", &mut ctx, &node()).await.unwrap();

        assert_eq!(out.message(), Some("Our opening hours are 9 to 5."));
        assert_eq!(
            out.action(),
            &NodeAction::Advance {
                handle: HANDLE_DEFAULT.into()
            }
        );
        assert_eq!(world.meter.used("t1"), 42);
        assert_eq!(world.agent.calls(), 1);
        assert_eq!(ctx.var("ai_reply"), Some(&json!("Our opening hours are 9 to 5.")));
    }

    #[tokio::test]
    async fn timeout_degrades_to_fallback_without_metering() {
        let world = TestWorld::new();
        world.agent.slow_down(Duration::from_millis(200));
        let exec = exec(&world, Duration::from_millis(20));

        let out = exec.execute("t1", &mut ctx(), &node()).await.unwrap();
        assert_eq!(out.message(), Some("Let me get back to you."));
        assert_eq!(world.meter.used("t1"), 0);
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_fallback() {
        let world = TestWorld::new();
        world.agent.fail_next();
        let exec = exec(&world, Duration::from_secs(1));

        let out = exec.execute("t1", &mut ctx(), &node()).await.unwrap();
        assert_eq!(out.message(), Some("Let me get back to you."));
    }

    #[tokio::test]
    async fn spent_quota_is_a_business_outcome() {
        let world = TestWorld::new();
        world.meter.set_quota("t1", 10);
        world.meter.record_usage("t1", 10, None);
        let exec = exec(&world, Duration::from_secs(1));

        let out = exec.execute("t1", &mut ctx(), &node()).await.unwrap();
        assert_eq!(
            out.action(),
            &NodeAction::Advance {
                handle: HANDLE_ERROR.into()
            }
        );
        assert_eq!(world.agent.calls(), 0);
    }
}
