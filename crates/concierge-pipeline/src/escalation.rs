//! Escalation detection and execution.
//!
//! Detection is a keyword heuristic over the last turns plus the current
//! message; execution flips the session to human control, stores a holding
//! message, and fans one notification out to each configured operator.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use concierge_core::types::Language;
use concierge_intent::templates;
use concierge_store::{ConversationStore, Role, SessionPatch};

use crate::ports::ReplyQueue;

static ESCALATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(complaint|lawyer|sue|legal action|refund)\b",
        r"(?i)\b(terrible|awful|worst|unacceptable) (service|experience|clinic)\b",
        r"(?i)\bstop (texting|messaging) me\b",
        r"(?i)\b(жалоба|жаловаться|верните деньги|адвокат)\b",
        r"(?i)\b(queja|reembolso|abogado)\b",
        r"(?i)this (bot|robot|ai) (is useless|doesn'?t understand)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct EscalationCheck {
    pub should_escalate: bool,
    pub reason: String,
    pub confidence: f64,
}

/// Keyword-based escalation detector. An LLM confirmation layer can sit
/// behind the same signature.
pub fn check_should_escalate(conversation_context: &str, user_message: &str) -> EscalationCheck {
    let combined = format!("{conversation_context}\n{user_message}");
    for pattern in ESCALATION_PATTERNS.iter() {
        if pattern.is_match(&combined) {
            return EscalationCheck {
                should_escalate: true,
                reason: format!("matched escalation pattern: {}", pattern.as_str()),
                confidence: 0.9,
            };
        }
    }
    EscalationCheck {
        should_escalate: false,
        reason: String::new(),
        confidence: 0.0,
    }
}

pub struct EscalationOutcome {
    pub holding_message: String,
}

/// Escalate a session: terminal state, human control, operator fan-out.
pub async fn escalate_conversation(
    store: &Arc<dyn ConversationStore>,
    replies: &Arc<dyn ReplyQueue>,
    session_id: &str,
    from_phone: &str,
    instance: Option<&str>,
    operator_phones: &[String],
    language: Language,
    reason: &str,
) -> EscalationOutcome {
    info!(session = &session_id[..session_id.len().min(8)], reason, "escalating conversation");

    if let Err(e) = store
        .update_session(session_id, SessionPatch::default().escalate())
        .await
    {
        warn!(error = %e, "failed to mark session escalated");
    }

    let holding = templates::escalation_holding(language).to_string();

    if let Err(e) = store
        .store_message(
            session_id,
            Role::Assistant,
            &holding,
            from_phone,
            json!({ "escalated": true, "reason": reason }),
        )
        .await
    {
        warn!(error = %e, "failed to store escalation holding message");
    }

    // One enqueue per operator so each gets their own delivery + retries.
    if let Some(instance) = instance {
        for operator in operator_phones {
            let note = format!(
                "Patient {from_phone} needs a human. Reason: {reason}. Last message is in the dashboard."
            );
            if let Err(e) = replies
                .enqueue_reply(instance, operator, &note, json!({ "operator_alert": true }))
                .await
            {
                warn!(operator, error = %e, "failed to notify operator");
            }
        }
    }

    EscalationOutcome {
        holding_message: holding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_complaint_keywords() {
        let check = check_should_escalate("", "I want a refund, this is unacceptable service");
        assert!(check.should_escalate);
        assert!(check.confidence > 0.5);
    }

    #[test]
    fn detects_russian_complaint() {
        let check = check_should_escalate("", "Это жалоба, верните деньги");
        assert!(check.should_escalate);
    }

    #[test]
    fn benign_messages_pass() {
        let check = check_should_escalate("user: hi\nassistant: hello", "can I book a cleaning?");
        assert!(!check.should_escalate);
    }
}
