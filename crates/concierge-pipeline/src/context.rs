//! The mutable context threaded through pipeline steps.
//!
//! Explicitly MUTABLE: each step modifies it in place behind `&mut`, no
//! copies. The field groups below are annotated with the step that sets
//! them, which doubles as the read/write contract for testing steps in
//! isolation.

use std::collections::HashMap;

use serde_json::json;

use concierge_constraints::ConversationConstraints;
use concierge_core::types::Language;
use concierge_narrowing::{Doctor, NarrowingInstruction};
use concierge_store::{Session, TurnStatus};

/// A clinic's hydrated profile, as loaded by the context hydration step.
#[derive(Debug, Clone, Default)]
pub struct ClinicProfile {
    pub name: String,
    pub location: String,
    pub timezone: String,
    pub instance_name: Option<String>,
    pub weekday_hours: String,
    pub saturday_hours: String,
    pub sunday_hours: String,
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub price: Option<f64>,
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

/// LLM call accounting collected by the generation step.
#[derive(Debug, Clone, Default)]
pub struct LlmMetrics {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub error_occurred: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    // ----- Request data (immutable after init) -----
    pub message: String,
    pub from_phone: String,
    pub to_phone: String,
    pub message_sid: String,
    /// May be an organization id; the session step resolves it.
    pub clinic_id: String,
    pub clinic_name: String,
    pub channel: String,
    pub profile_name: String,
    pub request_metadata: serde_json::Value,

    // ----- Resolved identifiers (session step) -----
    pub resolved_clinic_id: Option<String>,
    pub session_id: Option<String>,
    pub patient_id: Option<String>,
    pub correlation_id: Option<String>,

    // ----- Session state (session step) -----
    pub session: Option<Session>,
    pub is_new_session: bool,
    pub previous_session_summary: Option<String>,
    pub turn_status: TurnStatus,
    pub last_agent_action: Option<String>,
    pub pending_since: Option<String>,

    // ----- Hydrated context (hydration step) -----
    pub clinic_profile: Option<ClinicProfile>,
    pub clinic_services: Vec<ServiceInfo>,
    pub clinic_doctors: Vec<Doctor>,
    pub clinic_faqs: Vec<FaqEntry>,
    pub patient_name: Option<String>,
    /// (role, content) pairs, oldest first.
    pub session_messages: Vec<(String, String)>,
    pub additional_context: String,

    // ----- Routing (routing step) -----
    pub detected_language: Language,
    pub session_language: Option<String>,
    pub lane: Option<Lane>,

    // ----- Constraints (constraint step) -----
    pub constraints: Option<ConversationConstraints>,
    pub constraints_changed: bool,
    pub is_meta_reset: bool,

    // ----- Narrowing (narrowing step) -----
    pub narrowing_instruction: Option<NarrowingInstruction>,

    // ----- Response (fast path / LLM / post-processing) -----
    pub response: Option<String>,
    pub response_metadata: serde_json::Value,
    pub fast_path_handled: bool,

    // ----- Extracted data -----
    pub extracted_first_name: Option<String>,
    pub extracted_last_name: Option<String>,

    // ----- Metrics -----
    pub step_timings: HashMap<String, f64>,
    pub llm_metrics: LlmMetrics,

    // ----- Flags -----
    pub should_escalate: bool,
    pub escalation_reason: Option<String>,
}

/// Classification of an inbound turn for downstream handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Faq,
    Price,
    ServiceInfo,
    Scheduling,
    Complex,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Faq => "FAQ",
            Lane::Price => "PRICE",
            Lane::ServiceInfo => "SERVICE_INFO",
            Lane::Scheduling => "SCHEDULING",
            Lane::Complex => "COMPLEX",
        }
    }
}

impl PipelineContext {
    pub fn new(message: &str, from_phone: &str, clinic_id: &str, channel: &str) -> Self {
        Self {
            message: message.to_string(),
            from_phone: from_phone.to_string(),
            clinic_id: clinic_id.to_string(),
            channel: channel.to_string(),
            profile_name: "Usuario".to_string(),
            request_metadata: json!({}),
            response_metadata: json!({}),
            ..Default::default()
        }
    }

    /// The resolved clinic id, falling back to the raw request value.
    pub fn effective_clinic_id(&self) -> &str {
        self.resolved_clinic_id.as_deref().unwrap_or(&self.clinic_id)
    }

    /// Masked phone for PII-safe logging.
    pub fn masked_phone(&self) -> String {
        if self.from_phone.len() > 7 {
            format!(
                "{}***{}",
                &self.from_phone[..3],
                &self.from_phone[self.from_phone.len() - 4..]
            )
        } else {
            format!("{}***", &self.from_phone[..self.from_phone.len().min(3)])
        }
    }

    /// Debug snapshot captured before each step runs.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "session_id": self.session_id,
            "turn_status": self.turn_status.as_str(),
            "lane": self.lane.map(|l| l.as_str()),
            "has_response": self.response.is_some(),
            "detected_language": self.detected_language.as_str(),
            "step_timings": self.step_timings,
            "constraints_active": self
                .constraints
                .as_ref()
                .map(|c| !c.is_empty())
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_phone_hides_the_middle() {
        let ctx = PipelineContext::new("hi", "15551234567", "c1", "whatsapp");
        assert_eq!(ctx.masked_phone(), "155***4567");

        let short = PipelineContext::new("hi", "1234", "c1", "whatsapp");
        assert_eq!(short.masked_phone(), "123***");
    }

    #[test]
    fn effective_clinic_prefers_resolved() {
        let mut ctx = PipelineContext::new("hi", "1555", "org-1", "whatsapp");
        assert_eq!(ctx.effective_clinic_id(), "org-1");
        ctx.resolved_clinic_id = Some("clinic-9".to_string());
        assert_eq!(ctx.effective_clinic_id(), "clinic-9");
    }
}
