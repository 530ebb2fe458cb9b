use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use concierge_store::{ConversationStore, TurnStatus};

use crate::context::PipelineContext;
use crate::ports::ClinicDirectory;
use crate::step::{PipelineStep, StepError};

/// How much history feeds the LLM context.
const HISTORY_LIMIT: usize = 40;

/// Names that carry no information about who the patient actually is.
const GENERIC_NAMES: &[&str] = &["whatsapp", "unknown", "user", "usuario"];

/// Load clinic, patient, and conversation context onto the ctx.
///
/// Clinic and patient lookups fan out in parallel but join before the step
/// returns.
pub struct ContextHydrationStep {
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn ClinicDirectory>,
}

impl ContextHydrationStep {
    pub fn new(store: Arc<dyn ConversationStore>, directory: Arc<dyn ClinicDirectory>) -> Self {
        Self { store, directory }
    }

    fn extract_patient_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
        let first = first.unwrap_or("").trim();
        let last = last.unwrap_or("").trim();

        let first_generic = GENERIC_NAMES.contains(&first.to_lowercase().as_str());
        let last_generic = last.is_empty() || GENERIC_NAMES.contains(&last.to_lowercase().as_str());

        if first.is_empty() || first_generic {
            return None;
        }
        if last_generic {
            Some(first.to_string())
        } else {
            Some(format!("{first} {last}"))
        }
    }

    fn build_additional_context(ctx: &PipelineContext) -> String {
        let mut additional = String::new();

        // A pending agent promise dominates everything else this turn.
        if ctx.turn_status == TurnStatus::AgentActionPending {
            if let Some(ref action) = ctx.last_agent_action {
                let time_pending = ctx
                    .pending_since
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| {
                        let hours = (Utc::now() - dt.with_timezone(&Utc)).num_minutes() as f64 / 60.0;
                        format!(" (pending for {hours:.1} hours)")
                    })
                    .unwrap_or_default();

                additional = format!(
                    "\nIMPORTANT: you previously promised a follow-up: \"{action}\"{time_pending}.\n\
                     The user is now following up. Acknowledge the promise and deliver the answer.\n\
                     If you still do not have it, apologize and escalate to a human.\n\
                     Do NOT say \"let me check\" again."
                );
            }
        } else if ctx.turn_status == TurnStatus::Escalated {
            additional = "\nThis conversation is escalated to a human agent. \
                          Give a brief acknowledgment that the team is handling it; \
                          do not attempt to answer complex questions."
                .to_string();
        }

        let stage_context = if ctx.session_messages.is_empty() {
            "This is the first turn with this user. Give a warm introduction, confirm clinic \
             details, and collect any necessary intake information before addressing their request."
        } else {
            "The user has chatted with the clinic before. Maintain continuity, reference relevant \
             prior context, and move quickly to the substance of their request."
        };

        if additional.is_empty() {
            stage_context.to_string()
        } else {
            format!("{additional}\n\n{stage_context}")
        }
    }
}

#[async_trait]
impl PipelineStep for ContextHydrationStep {
    fn name(&self) -> &'static str {
        "context_hydration"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let clinic_id = ctx.effective_clinic_id().to_string();

        // Clinic and patient context load in parallel; join before returning.
        let (profile, services, doctors, faqs, patient) = tokio::join!(
            self.directory.clinic_profile(&clinic_id),
            self.directory.services(&clinic_id),
            self.directory.doctors(&clinic_id),
            self.directory.faqs(&clinic_id),
            self.directory.patient_profile(&clinic_id, &ctx.from_phone),
        );

        if let Some(ref profile) = profile {
            if !profile.name.is_empty() {
                ctx.clinic_name = profile.name.clone();
            }
        }
        ctx.clinic_profile = profile;
        ctx.clinic_services = services;
        ctx.clinic_doctors = doctors;
        ctx.clinic_faqs = faqs;

        if let Some((patient_id, first, last, language)) = patient {
            ctx.patient_id = Some(patient_id);
            ctx.patient_name = Self::extract_patient_name(first.as_deref(), last.as_deref());
            if let Some(ref name) = ctx.patient_name {
                // DB name beats the WhatsApp push name for greetings.
                ctx.profile_name = name.clone();
            }
            if ctx.session_language.is_none() {
                ctx.session_language = language;
            }
        }

        match self
            .store
            .get_conversation_history(&ctx.from_phone, &clinic_id, HISTORY_LIMIT, false)
            .await
        {
            Ok(history) => {
                ctx.session_messages = history
                    .iter()
                    .map(|m| (m.role.as_str().to_string(), m.content.clone()))
                    .collect();
            }
            Err(e) => warn!(error = %e, "history load failed, continuing without"),
        }

        ctx.additional_context = Self::build_additional_context(ctx);

        info!(
            services = ctx.clinic_services.len(),
            doctors = ctx.clinic_doctors.len(),
            history = ctx.session_messages.len(),
            "context hydrated"
        );
        Ok(true)
    }
}
