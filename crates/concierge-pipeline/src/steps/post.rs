use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use concierge_constraints::ConversationConstraints;
use concierge_core::types::Language;
use concierge_store::{ConversationStore, Role, SessionPatch, TurnStatus};

use crate::context::PipelineContext;
use crate::orchestrator::merge_metadata;
use crate::ports::ReplyQueue;
use crate::step::{PipelineStep, StepError};
use crate::util::spawn_store_message;

/// Default delay before a promised follow-up is re-woken.
const FOLLOWUP_DELAY_HOURS: i64 = 2;

// Phrases that mean the assistant promised out-of-band work.
static PROMISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\blet me (check|verify|look into|find out)\b",
        r"(?i)\bi'?ll (check|get back|look into|confirm|verify|follow up)\b",
        r"(?i)\b(one|give me a) moment\b",
        r"(?i)\bя (проверю|уточню|узнаю)\b",
        r"(?i)\b(секунду|минуту), (проверяю|уточняю)\b",
        r"(?i)\b(déjeme|déjame) (verificar|revisar|consultar)\b",
        r"(?i)\bvoy a (verificar|consultar|revisar)\b",
        r"(?i)\bvou (verificar|confirmar)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct ReplyAnalysis {
    pub turn_status: TurnStatus,
    pub promises_followup: bool,
    pub followup_action: Option<String>,
}

/// Inspect the assistant reply for follow-up promises.
pub fn analyze_reply(reply: &str) -> ReplyAnalysis {
    for pattern in PROMISE_PATTERNS.iter() {
        if let Some(m) = pattern.find(reply) {
            // The matched sentence is the promise description.
            let sentence_end = reply[m.start()..]
                .find(['.', '!', '\n'])
                .map(|i| m.start() + i)
                .unwrap_or(reply.len());
            return ReplyAnalysis {
                turn_status: TurnStatus::AgentActionPending,
                promises_followup: true,
                followup_action: Some(reply[m.start()..sentence_end].trim().to_string()),
            };
        }
    }
    ReplyAnalysis {
        turn_status: TurnStatus::UserTurn,
        promises_followup: false,
        followup_action: None,
    }
}

/// Brief "state echo" prepended when constraints changed this turn, so the
/// user sees what the agent now believes.
pub fn format_state_echo(constraints: &ConversationConstraints, language: Language) -> String {
    let mut parts = Vec::new();
    if let Some(ref service) = constraints.desired_service {
        parts.push(service.clone());
    }
    if let Some(ref doctor) = constraints.desired_doctor {
        parts.push(doctor.clone());
    }
    if let Some(ref label) = constraints.time_window_label {
        parts.push(label.clone());
    }
    let excluded: Vec<String> = constraints
        .excluded_services
        .iter()
        .chain(constraints.excluded_doctors.iter())
        .cloned()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let noted = parts.join(", ");
    let mut echo = match language {
        Language::Ru => format!("Записал: {noted}."),
        Language::Es => format!("Anotado: {noted}."),
        Language::Pt => format!("Anotado: {noted}."),
        Language::He => format!("רשמתי: {noted}."),
        Language::En => format!("Noted: {noted}."),
    };
    if noted.is_empty() {
        echo = String::new();
    }
    if !excluded.is_empty() {
        let skip = excluded.join(", ");
        let line = match language {
            Language::Ru => format!("Исключено: {skip}."),
            Language::Es => format!("Descartado: {skip}."),
            Language::Pt => format!("Descartado: {skip}."),
            Language::He => format!("לא רלוונטי: {skip}."),
            Language::En => format!("Ruled out: {skip}."),
        };
        if !echo.is_empty() {
            echo.push(' ');
        }
        echo.push_str(&line);
    }
    echo
}

/// Final stage: echo, persistence, follow-up scheduling, and handing the
/// reply to the egress queue. Session state commits HERE, after the reply
/// exists — a failed turn leaves state untouched.
pub struct PostProcessingStep {
    store: Arc<dyn ConversationStore>,
    replies: Arc<dyn ReplyQueue>,
}

impl PostProcessingStep {
    pub fn new(store: Arc<dyn ConversationStore>, replies: Arc<dyn ReplyQueue>) -> Self {
        Self { store, replies }
    }
}

#[async_trait]
impl PipelineStep for PostProcessingStep {
    fn name(&self) -> &'static str {
        "post_processing"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let session_id = ctx.session_id.clone().unwrap_or_default();

        // 1. State echo when constraints changed this turn.
        if ctx.constraints_changed {
            if let Some(ref constraints) = ctx.constraints {
                if !constraints.is_empty() {
                    let echo = format_state_echo(constraints, ctx.detected_language);
                    if !echo.is_empty() {
                        info!("state echo prepended");
                        let reply = ctx.response.clone().unwrap_or_default();
                        ctx.response = Some(format!("{echo}\n\n{reply}"));
                    }
                }
            }
        }

        let reply = ctx.response.clone().unwrap_or_default();

        // 2. Patient upsert with whatever got extracted this turn.
        if let Err(e) = self
            .store
            .upsert_patient(
                ctx.effective_clinic_id(),
                &ctx.from_phone,
                None,
                ctx.extracted_first_name.as_deref(),
                ctx.extracted_last_name.as_deref(),
                Some(ctx.detected_language.as_str()),
            )
            .await
        {
            warn!(error = %e, "patient upsert failed in post-processing");
        }

        // 3. Log the assistant message with its metrics.
        spawn_store_message(
            &self.store,
            &session_id,
            Role::Assistant,
            &reply,
            &ctx.from_phone,
            json!({
                "detected_language": ctx.detected_language.as_str(),
                "correlation_id": ctx.correlation_id,
                "llm_provider": ctx.llm_metrics.provider,
                "llm_model": ctx.llm_metrics.model,
                "llm_tokens_input": ctx.llm_metrics.tokens_input,
                "llm_tokens_output": ctx.llm_metrics.tokens_output,
                "llm_latency_ms": ctx.llm_metrics.latency_ms,
                "llm_cost_usd": ctx.llm_metrics.cost_usd,
            }),
        );

        // 4. Follow-up analysis drives the next turn status.
        let analysis = analyze_reply(&reply);
        let mut patch = SessionPatch::default().turn_status(analysis.turn_status);
        if analysis.promises_followup {
            warn!(action = ?analysis.followup_action, "agent promised a follow-up");
            patch.pending_action = Some(analysis.followup_action.clone());
            patch.pending_since = Some(Some(Utc::now().to_rfc3339()));
            patch.scheduled_followup_at = Some(Some(
                (Utc::now() + Duration::hours(FOLLOWUP_DELAY_HOURS)).to_rfc3339(),
            ));
        } else {
            patch.pending_action = Some(None);
            patch.pending_since = Some(None);
        }

        // 5. Session language persists so inertia works next turn.
        patch.session_language = ctx.session_language.clone();

        if let Err(e) = self.store.update_session(&session_id, patch).await {
            warn!(error = %e, "session update failed");
        }

        // 6. Queue the outbound reply, keyed by the clinic's instance.
        let instance = ctx
            .clinic_profile
            .as_ref()
            .and_then(|p| p.instance_name.clone());
        if let Some(instance) = instance {
            if !reply.is_empty() {
                if let Err(e) = self
                    .replies
                    .enqueue_reply(
                        &instance,
                        &ctx.from_phone,
                        &reply,
                        json!({
                            "session_id": session_id,
                            "correlation_id": ctx.correlation_id,
                        }),
                    )
                    .await
                {
                    warn!(error = %e, "reply enqueue failed");
                }
            }
        } else {
            warn!("no instance configured for clinic, reply not queued");
        }

        let response_metadata_update = json!({
            "detected_language": ctx.detected_language.as_str(),
            "is_new_conversation": ctx.is_new_session,
            "clinic_id": ctx.effective_clinic_id(),
            "turn_status": analysis.turn_status.as_str(),
            "step_timings": ctx.step_timings,
        });
        merge_metadata(&mut ctx.response_metadata, response_metadata_update);

        info!(
            chars = reply.len(),
            turn_status = analysis.turn_status.as_str(),
            "response ready"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{store, RecordingQueue};
    use crate::context::ClinicProfile;

    #[test]
    fn promise_detection_multilingual() {
        let english = analyze_reply("Let me check with the doctor and get back to you.");
        assert!(english.promises_followup);
        assert_eq!(english.turn_status, TurnStatus::AgentActionPending);
        assert!(english.followup_action.unwrap().starts_with("Let me check"));

        let russian = analyze_reply("Я проверю расписание и вернусь к вам.");
        assert!(russian.promises_followup);

        let plain = analyze_reply("Your appointment is at 10:00 tomorrow.");
        assert!(!plain.promises_followup);
        assert_eq!(plain.turn_status, TurnStatus::UserTurn);
    }

    #[test]
    fn state_echo_lists_wants_and_exclusions() {
        let mut constraints = ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        constraints.set_time_window("a", "b", "tomorrow morning");
        constraints.exclude("whitening");

        let echo = format_state_echo(&constraints, Language::En);
        assert!(echo.contains("Noted: cleaning, tomorrow morning."));
        assert!(echo.contains("Ruled out: whitening."));
    }

    #[tokio::test]
    async fn reply_is_enqueued_and_session_updated() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        let queue = Arc::new(RecordingQueue::default());

        let step = PostProcessingStep::new(Arc::clone(&store), queue.clone());
        let mut ctx = PipelineContext::new("cleaning please", "1555", "c1", "whatsapp");
        ctx.session_id = Some(handle.session.id.clone());
        ctx.response = Some("Let me check availability and get back to you.".to_string());
        ctx.session_language = Some("en".to_string());
        ctx.clinic_profile = Some(ClinicProfile {
            instance_name: Some("inst-a".to_string()),
            ..Default::default()
        });

        assert!(step.execute(&mut ctx).await.unwrap());

        let sent = queue.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "inst-a");
        assert_eq!(sent[0].1, "1555");

        let session = store
            .get_session(&handle.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.turn_status, TurnStatus::AgentActionPending);
        assert!(session.scheduled_followup_at.is_some());
        assert_eq!(session.session_language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn state_echo_prepends_when_constraints_changed() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        let queue = Arc::new(RecordingQueue::default());

        let step = PostProcessingStep::new(Arc::clone(&store), queue);
        let mut ctx = PipelineContext::new("cleaning tomorrow", "1555", "c1", "whatsapp");
        ctx.session_id = Some(handle.session.id.clone());
        ctx.response = Some("What time works for you?".to_string());
        let mut constraints = ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        ctx.constraints = Some(constraints);
        ctx.constraints_changed = true;

        assert!(step.execute(&mut ctx).await.unwrap());
        let reply = ctx.response.unwrap();
        assert!(reply.starts_with("Noted: cleaning."));
        assert!(reply.ends_with("What time works for you?"));
    }

    #[tokio::test]
    async fn empty_reply_is_not_enqueued() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        let queue = Arc::new(RecordingQueue::default());

        let step = PostProcessingStep::new(Arc::clone(&store), queue.clone());
        let mut ctx = PipelineContext::new("hi", "1555", "c1", "whatsapp");
        ctx.session_id = Some(handle.session.id.clone());
        ctx.response = Some(String::new());
        ctx.clinic_profile = Some(ClinicProfile {
            instance_name: Some("inst-a".to_string()),
            ..Default::default()
        });

        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(queue.sent.lock().await.is_empty());
    }
}
