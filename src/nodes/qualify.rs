use std::sync::Arc;

use async_trait::async_trait;
use schemars::schema_for;
use serde_json::Value;
use tracing::warn;

use crate::collaborator::{ContactInfo, LeadStore};
use crate::events::{DomainEvent, EventBus};
use crate::graph::{LeadQualificationConfig, Node, NodeKind};
use crate::node::{
    ConversationContext, HANDLE_HIGH, HANDLE_LOW, HANDLE_MEDIUM, NodeError, NodeExecutor, NodeOut,
};
use crate::vars::value_to_string;

/// Branches on a previously captured numeric score and optionally advances
/// the CRM lead into a band-specific stage. Emits no user-facing message.
pub struct LeadQualificationExecutor {
    leads: Arc<dyn LeadStore>,
    events: EventBus,
}

impl std::fmt::Debug for LeadQualificationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeadQualificationExecutor")
    }
}

impl LeadQualificationExecutor {
    pub fn new(leads: Arc<dyn LeadStore>, events: EventBus) -> Self {
        Self { leads, events }
    }
}

fn score_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl NodeExecutor for LeadQualificationExecutor {
    fn kind(&self) -> &'static str {
        "lead-qualification"
    }

    fn config_schema(&self) -> schemars::Schema {
        schema_for!(LeadQualificationConfig)
    }

    async fn execute(
        &self,
        tenant_id: &str,
        ctx: &mut ConversationContext,
        node: &Node,
    ) -> Result<NodeOut, NodeError> {
        let NodeKind::LeadQualification(cfg) = &node.kind else {
            return Err(NodeError::InvalidConfig(format!(
                "node `{}` is not a lead-qualification node",
                node.id
            )));
        };

        let score = match ctx.var(&cfg.score_variable).and_then(score_of) {
            Some(score) => score,
            None => {
                warn!(
                    tenant = %tenant_id,
                    variable = %cfg.score_variable,
                    "score variable missing or not numeric; treating as low"
                );
                f64::MIN
            }
        };

        let band = if score >= cfg.high_score_threshold {
            HANDLE_HIGH
        } else if cfg
            .medium_score_threshold
            .is_some_and(|medium| score >= medium)
        {
            HANDLE_MEDIUM
        } else {
            HANDLE_LOW
        };

        let stage = match band {
            HANDLE_HIGH => cfg.high_score_stage.as_ref(),
            _ => cfg.low_score_stage.as_ref(),
        };
        if let Some(stage) = stage {
            let contact = contact_info(ctx, cfg);
            match self.leads.create_or_advance(tenant_id, &contact, stage).await {
                Ok(lead_id) => {
                    ctx.set_lead_id(lead_id.clone());
                    self.events.publish(DomainEvent::LeadAdvanced {
                        tenant_id: tenant_id.to_string(),
                        session_id: ctx.session_id().to_string(),
                        lead_id,
                        stage: stage.clone(),
                    });
                }
                Err(e) => warn!(tenant = %tenant_id, stage = %stage, "lead advance failed: {e}"),
            }
        }

        Ok(NodeOut::advance(band))
    }
}

fn contact_info(ctx: &ConversationContext, cfg: &LeadQualificationConfig) -> ContactInfo {
    let var = |configured: Option<&String>, fallback: &str| {
        let key = configured.map(String::as_str).unwrap_or(fallback);
        ctx.var(key).map(value_to_string)
    };
    let mapping = cfg.contact.as_ref();
    ContactInfo {
        name: var(mapping.and_then(|m| m.name_variable.as_ref()), "name"),
        phone: var(mapping.and_then(|m| m.phone_variable.as_ref()), "phone"),
        email: var(mapping.and_then(|m| m.email_variable.as_ref()), "email"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAction;
    use crate::session::ChannelType;
    use crate::testutil::TestWorld;
    use serde_json::json;
    use std::collections::HashMap;

    fn node(high: f64, medium: Option<f64>, high_stage: Option<&str>) -> Node {
        Node {
            id: "q1".into(),
            kind: NodeKind::LeadQualification(LeadQualificationConfig {
                score_variable: "lead_score".into(),
                high_score_threshold: high,
                medium_score_threshold: medium,
                high_score_stage: high_stage.map(str::to_string),
                low_score_stage: None,
                contact: None,
            }),
        }
    }

    fn ctx_with_score(score: Value) -> ConversationContext {
        let mut vars = HashMap::new();
        vars.insert("lead_score".to_string(), score);
        ConversationContext::new("s1", ChannelType::WhatsApp, vars, HashMap::new(), None)
    }

    async fn band_for(score: Value, high: f64, medium: Option<f64>) -> String {
        let world = TestWorld::new();
        let exec = LeadQualificationExecutor::new(world.leads.clone(), world.events.clone());
        let out = exec
            .execute("t1", &mut ctx_with_score(score), &node(high, medium, None))
            .await
            .unwrap();
        match out.action() {
            NodeAction::Advance { handle } => handle.clone(),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn score_75_with_threshold_70_is_high() {
        assert_eq!(band_for(json!(75), 70.0, None).await, HANDLE_HIGH);
    }

    #[tokio::test]
    async fn threshold_is_inclusive_and_bands_are_ordered() {
        assert_eq!(band_for(json!(70), 70.0, Some(40.0)).await, HANDLE_HIGH);
        assert_eq!(band_for(json!(69.9), 70.0, Some(40.0)).await, HANDLE_MEDIUM);
        assert_eq!(band_for(json!(39), 70.0, Some(40.0)).await, HANDLE_LOW);
    }

    #[tokio::test]
    async fn string_scores_parse_and_garbage_is_low() {
        assert_eq!(band_for(json!("82"), 70.0, None).await, HANDLE_HIGH);
        assert_eq!(band_for(json!("n/a"), 70.0, None).await, HANDLE_LOW);
    }

    #[tokio::test]
    async fn high_band_advances_lead_and_publishes() {
        let world = TestWorld::new();
        let exec = LeadQualificationExecutor::new(world.leads.clone(), world.events.clone());
        let mut events = world.events.subscribe();

        let mut ctx = ctx_with_score(json!(90));
        exec.execute("t1", &mut ctx, &node(70.0, None, Some("qualified")))
            .await
            .unwrap();

        assert!(ctx.lead_id().is_some());
        assert_eq!(world.leads.stages(), vec![("t1".into(), "qualified".into())]);
        assert!(matches!(
            events.try_recv().unwrap(),
            DomainEvent::LeadAdvanced { stage, .. } if stage == "qualified"
        ));
    }
}
