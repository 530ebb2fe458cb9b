use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use concierge_store::{ControlMode, ConversationStore, Role};

use crate::context::PipelineContext;
use crate::orchestrator::merge_metadata;
use crate::step::{PipelineStep, StepError};
use crate::util::spawn_store_message;

/// Human-in-the-loop gate.
///
/// When the session is under `human` or `paused` control the bot stays
/// silent: the inbound message is filed for operator review, the unread
/// badge is bumped, and the pipeline stops with an empty reply.
pub struct ControlModeGateStep {
    store: Arc<dyn ConversationStore>,
}

impl ControlModeGateStep {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PipelineStep for ControlModeGateStep {
    fn name(&self) -> &'static str {
        "control_mode_gate"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let control_mode = ctx
            .session
            .as_ref()
            .map(|s| s.control_mode)
            .unwrap_or(ControlMode::Agent);

        if !control_mode.bypasses_agent() {
            debug!("control mode check passed (agent)");
            return Ok(true);
        }

        let session_id = ctx.session_id.clone().unwrap_or_default();
        info!(
            mode = control_mode.as_str(),
            session = &session_id[..session_id.len().min(8)],
            "session under human control, routing to operator"
        );

        spawn_store_message(
            &self.store,
            &session_id,
            Role::User,
            &ctx.message,
            &ctx.from_phone,
            json!({
                "message_sid": ctx.message_sid,
                "profile_name": ctx.profile_name,
                "control_mode": control_mode.as_str(),
                "pending_human_review": true,
            }),
        );

        match self.store.increment_unread(&session_id).await {
            Ok(count) => debug!(unread = count, "unread counter bumped"),
            Err(e) => warn!(error = %e, "failed to increment unread count"),
        }

        // Empty response: the webhook layer sends nothing to the user.
        ctx.response = Some(String::new());
        merge_metadata(
            &mut ctx.response_metadata,
            json!({
                "control_mode": control_mode.as_str(),
                "routed_to": "human_operator",
                "hitl_gated": true,
            }),
        );
        Ok(false)
    }
}
