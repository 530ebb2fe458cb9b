use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use concierge_constraints::ConstraintExtractor;
use concierge_intent::templates;
use concierge_store::{ConversationStore, Role};

use crate::context::PipelineContext;
use crate::orchestrator::merge_metadata;
use crate::step::{PipelineStep, StepError};
use crate::util::spawn_store_message;

/// Extract and enforce conversation constraints.
///
/// A meta-reset clears everything in one transaction and short-circuits
/// the pipeline with a localized confirmation. Otherwise the extractor's
/// deltas are applied and persisted, and `constraints_changed` is flagged
/// for the state echo downstream.
pub struct ConstraintEnforcementStep {
    store: Arc<dyn ConversationStore>,
    extractor: ConstraintExtractor,
}

impl ConstraintEnforcementStep {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            extractor: ConstraintExtractor::new(),
        }
    }
}

#[async_trait]
impl PipelineStep for ConstraintEnforcementStep {
    fn name(&self) -> &'static str {
        "constraint_enforcement"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let session_id = ctx.session_id.clone().unwrap_or_default();

        // Meta-reset: clear everything, confirm, stop.
        if self.extractor.is_meta_reset(&ctx.message) {
            info!("meta-reset triggered, clearing all constraints");
            ctx.is_meta_reset = true;

            self.store.clear_constraints(&session_id).await.map_err(|e| {
                StepError::new(self.name(), format!("constraint clear failed: {e}"))
                    .with_snapshot(ctx.snapshot())
            })?;

            let confirmation = templates::reset_confirmation(ctx.detected_language).to_string();
            spawn_store_message(
                &self.store,
                &session_id,
                Role::Assistant,
                &confirmation,
                &ctx.from_phone,
                json!({ "reset": true }),
            );

            ctx.constraints = Some(Default::default());
            ctx.constraints_changed = false;
            ctx.response = Some(confirmation);
            merge_metadata(&mut ctx.response_metadata, json!({ "reset": true }));
            return Ok(false);
        }

        let mut constraints = self
            .store
            .get_constraints(&session_id)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "constraint load failed, starting empty");
                Default::default()
            });

        let now = Utc::now().naive_utc();
        let changed =
            self.extractor
                .apply(&mut constraints, &ctx.message, ctx.detected_language, now);

        if changed {
            info!(
                desired = ?constraints.desired_service,
                excluded_services = constraints.excluded_services.len(),
                excluded_doctors = constraints.excluded_doctors.len(),
                "constraints updated"
            );
            self.store
                .save_constraints(&session_id, &constraints)
                .await
                .map_err(|e| {
                    StepError::new(self.name(), format!("constraint save failed: {e}"))
                        .with_snapshot(ctx.snapshot())
                })?;
        }

        ctx.constraints = Some(constraints);
        ctx.constraints_changed = changed;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::store;
    use concierge_core::types::Language;

    #[tokio::test]
    async fn meta_reset_clears_and_stops() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        let sid = handle.session.id.clone();

        // Seed a constraint to prove it gets wiped.
        let mut seeded = concierge_constraints::ConversationConstraints::default();
        seeded.set_desired_service("cleaning");
        store.save_constraints(&sid, &seeded).await.unwrap();

        let step = ConstraintEnforcementStep::new(Arc::clone(&store));
        let mut ctx = PipelineContext::new("давай начнём сначала", "1555", "c1", "whatsapp");
        ctx.session_id = Some(sid.clone());
        ctx.detected_language = Language::Ru;

        let should_continue = step.execute(&mut ctx).await.unwrap();
        assert!(!should_continue);
        assert!(ctx.is_meta_reset);
        assert!(ctx
            .response
            .as_deref()
            .unwrap()
            .starts_with("Понял, начинаем с чистого листа!"));
        assert!(store.get_constraints(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forget_persists_exclusions() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        let sid = handle.session.id.clone();

        let step = ConstraintEnforcementStep::new(Arc::clone(&store));
        let mut ctx = PipelineContext::new("please forget the whitening", "1555", "c1", "whatsapp");
        ctx.session_id = Some(sid.clone());

        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(ctx.constraints_changed);

        let persisted = store.get_constraints(&sid).await.unwrap();
        assert!(persisted.excluded_services.contains("whitening"));
        assert!(persisted.invariant_holds());
    }

    #[tokio::test]
    async fn plain_message_changes_nothing() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();

        let step = ConstraintEnforcementStep::new(Arc::clone(&store));
        let mut ctx = PipelineContext::new("hello there", "1555", "c1", "whatsapp");
        ctx.session_id = Some(handle.session.id.clone());

        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(!ctx.constraints_changed);
        assert!(ctx.constraints.as_ref().unwrap().is_empty());
    }
}
