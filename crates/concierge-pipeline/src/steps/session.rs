use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use concierge_core::types::clean_phone;
use concierge_memory::{MemoryJob, MemoryWriter};
use concierge_store::{ConversationStore, Role};

use crate::context::PipelineContext;
use crate::ports::ClinicDirectory;
use crate::step::{PipelineStep, StepError};
use crate::util::spawn_store_message;

/// Resolve identities, load or create the session, store the inbound
/// message, and kick the async clinic warmup.
pub struct SessionManagementStep {
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn ClinicDirectory>,
    memory: Option<Arc<MemoryWriter>>,
    /// organization id → clinic id, per process. May briefly diverge across
    /// replicas; correctness does not depend on it.
    org_to_clinic: DashMap<String, String>,
}

impl SessionManagementStep {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn ClinicDirectory>,
        memory: Option<Arc<MemoryWriter>>,
    ) -> Self {
        Self {
            store,
            directory,
            memory,
            org_to_clinic: DashMap::new(),
        }
    }

    /// Fill in the phone from request metadata fallbacks when the primary
    /// field is missing or the literal "unknown".
    fn resolve_phone(&self, ctx: &mut PipelineContext) {
        if !ctx.from_phone.is_empty() && ctx.from_phone.to_lowercase() != "unknown" {
            return;
        }

        let metadata = &ctx.request_metadata;
        let fallback = metadata["from_number"]
            .as_str()
            .or_else(|| metadata["phone_number"].as_str())
            .or_else(|| metadata["from"].as_str())
            .map(str::to_string)
            .or_else(|| {
                // whatsapp_<phone>_<sid> message ids carry the phone too.
                ctx.message_sid
                    .strip_prefix("whatsapp_")
                    .and_then(|rest| rest.split('_').next())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
            });

        if let Some(phone) = fallback {
            ctx.from_phone = phone;
        }
    }

    async fn resolve_clinic(&self, organization_id: &str) -> String {
        if let Some(hit) = self.org_to_clinic.get(organization_id) {
            return hit.clone();
        }
        match self.directory.resolve_clinic_id(organization_id).await {
            Some(clinic_id) => {
                self.org_to_clinic
                    .insert(organization_id.to_string(), clinic_id.clone());
                clinic_id
            }
            None => organization_id.to_string(),
        }
    }
}

#[async_trait]
impl PipelineStep for SessionManagementStep {
    fn name(&self) -> &'static str {
        "session_management"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        self.resolve_phone(ctx);
        // Session keys use the cleaned form: digits only, JID suffix gone.
        ctx.from_phone = clean_phone(&ctx.from_phone);
        if ctx.from_phone.is_empty() {
            return Err(StepError::new(self.name(), "no phone number resolvable"));
        }

        ctx.correlation_id = Some(Uuid::new_v4().to_string()[..8].to_string());
        ctx.resolved_clinic_id = Some(self.resolve_clinic(&ctx.clinic_id).await);

        // Async warmup — deduplicated inside the writer, never awaited here.
        if let Some(ref memory) = self.memory {
            memory
                .enqueue(MemoryJob::Warmup {
                    clinic_id: ctx.effective_clinic_id().to_string(),
                })
                .await;
        }

        // Upsert the patient so a record exists from first contact.
        if let Err(e) = self
            .store
            .upsert_patient(
                ctx.effective_clinic_id(),
                &ctx.from_phone,
                Some(&ctx.profile_name),
                None,
                None,
                None,
            )
            .await
        {
            warn!(error = %e, "patient upsert failed");
        }

        let handle = self
            .store
            .get_or_create_session(&ctx.from_phone, ctx.effective_clinic_id(), &ctx.channel)
            .await
            .map_err(|e| {
                StepError::new(self.name(), format!("session load failed: {e}"))
                    .with_snapshot(ctx.snapshot())
            })?;

        ctx.session_id = Some(handle.session.id.clone());
        ctx.is_new_session = handle.is_new;
        ctx.previous_session_summary = handle.previous_session_summary.clone();
        ctx.turn_status = handle.session.turn_status;
        ctx.last_agent_action = handle.session.pending_action.clone();
        ctx.pending_since = handle.session.pending_since.clone();
        ctx.session_language = handle.session.session_language.clone();
        ctx.session = Some(handle.session);

        // Store the inbound user message, fire-and-forget.
        spawn_store_message(
            &self.store,
            ctx.session_id.as_deref().unwrap_or_default(),
            Role::User,
            &ctx.message,
            &ctx.from_phone,
            json!({
                "message_sid": ctx.message_sid,
                "profile_name": ctx.profile_name,
                "clinic_id": ctx.effective_clinic_id(),
                "channel": ctx.channel,
                "correlation_id": ctx.correlation_id,
            }),
        );

        let session_short = ctx.session_id.as_deref().unwrap_or("");
        info!(
            session = &session_short[..session_short.len().min(8)],
            new = ctx.is_new_session,
            phone = %ctx.masked_phone(),
            "session resolved"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testsupport::{store, EmptyDirectory};

    fn step() -> SessionManagementStep {
        SessionManagementStep::new(store(), Arc::new(EmptyDirectory), None)
    }

    #[tokio::test]
    async fn phone_falls_back_to_metadata() {
        let step = step();
        let mut ctx = PipelineContext::new("hi", "unknown", "c1", "whatsapp");
        ctx.request_metadata = json!({ "from_number": "15551230000" });
        step.resolve_phone(&mut ctx);
        assert_eq!(ctx.from_phone, "15551230000");
    }

    #[tokio::test]
    async fn phone_falls_back_to_message_sid() {
        let step = step();
        let mut ctx = PipelineContext::new("hi", "", "c1", "whatsapp");
        ctx.message_sid = "whatsapp_15557770000_abc".to_string();
        step.resolve_phone(&mut ctx);
        assert_eq!(ctx.from_phone, "15557770000");
    }
}
