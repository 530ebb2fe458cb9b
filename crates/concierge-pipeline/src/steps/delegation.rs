use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::orchestrator::merge_metadata;
use crate::ports::TurnDelegate;
use crate::step::{PipelineStep, StepError};

/// Optional hand-off to an external turn orchestrator, feature-flagged per
/// clinic and lane. A non-empty reply ends the pipeline; an error or empty
/// reply falls through to the LLM step.
pub struct DelegationStep {
    delegate: Option<Arc<dyn TurnDelegate>>,
}

impl DelegationStep {
    pub fn new(delegate: Option<Arc<dyn TurnDelegate>>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl PipelineStep for DelegationStep {
    fn name(&self) -> &'static str {
        "delegation"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let Some(ref delegate) = self.delegate else {
            return Ok(true);
        };
        let Some(lane) = ctx.lane else {
            return Ok(true);
        };
        if !delegate.handles(ctx.effective_clinic_id(), lane) {
            return Ok(true);
        }

        let session_id = ctx.session_id.clone().unwrap_or_default();
        match delegate
            .run_turn(ctx.effective_clinic_id(), &session_id, &ctx.message)
            .await
        {
            Ok(Some(reply)) if !reply.is_empty() => {
                info!(lane = lane.as_str(), "turn handled by external orchestrator");
                ctx.response = Some(reply);
                merge_metadata(&mut ctx.response_metadata, json!({ "delegated": true }));
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => {
                // Delegation failures never fail the turn.
                warn!(error = %e, "delegation failed, falling through to LLM");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Lane;

    struct AlwaysDelegate {
        reply: Result<Option<String>, String>,
    }

    #[async_trait]
    impl TurnDelegate for AlwaysDelegate {
        fn handles(&self, _clinic_id: &str, lane: Lane) -> bool {
            lane == Lane::Scheduling
        }
        async fn run_turn(
            &self,
            _clinic_id: &str,
            _session_id: &str,
            _message: &str,
        ) -> Result<Option<String>, String> {
            self.reply.clone()
        }
    }

    #[tokio::test]
    async fn delegated_reply_stops_the_pipeline() {
        let step = DelegationStep::new(Some(Arc::new(AlwaysDelegate {
            reply: Ok(Some("Booked!".to_string())),
        })));
        let mut ctx = PipelineContext::new("book me", "1555", "c1", "whatsapp");
        ctx.lane = Some(Lane::Scheduling);

        assert!(!step.execute(&mut ctx).await.unwrap());
        assert_eq!(ctx.response.as_deref(), Some("Booked!"));
    }

    #[tokio::test]
    async fn unhandled_lane_falls_through() {
        let step = DelegationStep::new(Some(Arc::new(AlwaysDelegate {
            reply: Ok(Some("never".to_string())),
        })));
        let mut ctx = PipelineContext::new("what is whitening?", "1555", "c1", "whatsapp");
        ctx.lane = Some(Lane::ServiceInfo);

        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(ctx.response.is_none());
    }

    #[tokio::test]
    async fn delegate_error_falls_through() {
        let step = DelegationStep::new(Some(Arc::new(AlwaysDelegate {
            reply: Err("orchestrator offline".to_string()),
        })));
        let mut ctx = PipelineContext::new("book me", "1555", "c1", "whatsapp");
        ctx.lane = Some(Lane::Scheduling);

        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(ctx.response.is_none());
    }

    #[tokio::test]
    async fn absent_delegate_is_a_noop() {
        let step = DelegationStep::new(None);
        let mut ctx = PipelineContext::new("book me", "1555", "c1", "whatsapp");
        ctx.lane = Some(Lane::Scheduling);
        assert!(step.execute(&mut ctx).await.unwrap());
    }
}
