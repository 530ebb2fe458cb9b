use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use concierge_store::ConversationStore;

use crate::context::PipelineContext;
use crate::escalation::{check_should_escalate, escalate_conversation};
use crate::orchestrator::merge_metadata;
use crate::ports::ReplyQueue;
use crate::step::{PipelineStep, StepError};

/// Examine the last turns plus the current message for escalation
/// triggers; on a hit, escalate and stop with a holding message.
pub struct EscalationCheckStep {
    store: Arc<dyn ConversationStore>,
    replies: Arc<dyn ReplyQueue>,
    operator_phones: Vec<String>,
}

impl EscalationCheckStep {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        replies: Arc<dyn ReplyQueue>,
        operator_phones: Vec<String>,
    ) -> Self {
        Self {
            store,
            replies,
            operator_phones,
        }
    }
}

#[async_trait]
impl PipelineStep for EscalationCheckStep {
    fn name(&self) -> &'static str {
        "escalation_check"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let context_window = ctx
            .session_messages
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|(role, content)| format!("{role}: {content}"))
            .collect::<Vec<_>>()
            .join("\n");

        let check = check_should_escalate(&context_window, &ctx.message);
        if !check.should_escalate {
            return Ok(true);
        }

        warn!(reason = %check.reason, "escalating conversation");
        ctx.should_escalate = true;
        ctx.escalation_reason = Some(check.reason.clone());

        let session_id = ctx.session_id.clone().unwrap_or_default();
        let instance = ctx
            .clinic_profile
            .as_ref()
            .and_then(|p| p.instance_name.clone());

        let outcome = escalate_conversation(
            &self.store,
            &self.replies,
            &session_id,
            &ctx.from_phone,
            instance.as_deref(),
            &self.operator_phones,
            ctx.detected_language,
            &check.reason,
        )
        .await;

        ctx.response = Some(outcome.holding_message);
        merge_metadata(
            &mut ctx.response_metadata,
            json!({ "escalated": true, "reason": check.reason }),
        );
        Ok(false)
    }
}
