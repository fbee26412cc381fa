use async_trait::async_trait;
use schemars::schema_for;

use crate::graph::{ButtonsConfig, ListConfig, Node, NodeKind};
use crate::node::{Button, ConversationContext, NodeError, NodeExecutor, NodeOut};

/// Quick-reply buttons. Always waits; the interpreter matches the reply
/// against the configured values to pick the outgoing handle.
#[derive(Debug, Default)]
pub struct ButtonsExecutor;

#[async_trait]
impl NodeExecutor for ButtonsExecutor {
    fn kind(&self) -> &'static str {
        "buttons"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(ButtonsConfig)
    }

    async fn execute(
        &self,
        _tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::Buttons(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a buttons node",
                node.id
            )));
        };
        let text = ctx.render(&cfg.text);
        Ok(NodeOut::prompt(text).with_buttons(render_choices(ctx, &cfg.buttons)))
    }
}

/// Section-list variant: same waiting semantics, up to 10 rows.
#[derive(Debug, Default)]
pub struct ListExecutor;

#[async_trait]
impl NodeExecutor for ListExecutor {
    fn kind(&self) -> &'static str {
        "list"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(ListConfig)
    }

    async fn execute(
        &self,
        _tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::List(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a list node",
                node.id
            )));
        };
        let text = ctx.render(&cfg.text);
        Ok(NodeOut::prompt(text).with_buttons(render_choices(ctx, &cfg.items)))
    }
}

/// Labels may carry `{{...}}` placeholders; values are routing handles and
/// stay verbatim.
fn render_choices(ctx: &ConversationContext, choices: &[Button]) -> Vec<Button> {
    choices
        .iter()
        .map(|b| Button::new(ctx.render(&b.text), b.value.clone()))
        .collect()
}
