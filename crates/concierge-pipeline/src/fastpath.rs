//! Fast handlers for common intents — template replies without the LLM.
//!
//! A fast handler must still persist both turns (fire-and-forget) and
//! return the same metadata envelope the LLM path would, so downstream
//! consumers cannot tell the difference.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use concierge_core::types::Language;
use concierge_intent::{detect_language, templates, Intent, IntentRouter};
use concierge_store::{ConversationStore, Role};

use crate::escalation;
use crate::ports::{ClinicDirectory, ReplyQueue};
use crate::util::spawn_store_message;

/// One inbound message as seen by the fast path.
pub struct FastPathRequest<'a> {
    pub session_id: &'a str,
    pub message: &'a str,
    pub from_phone: &'a str,
    pub clinic_id: &'a str,
    /// Tenant instance for operator notifications, when known.
    pub instance: Option<&'a str>,
}

pub struct FastPathReply {
    pub response: String,
    pub metadata: serde_json::Value,
    pub language: Language,
    pub escalated: bool,
}

/// What the fast path decided.
pub enum FastPathOutcome {
    /// A reply was produced locally; skip the full pipeline.
    Handled(FastPathReply),
    /// Partially understood (e.g. time WITH date): continue with the full
    /// pipeline, carrying advisory metadata forward.
    FallThrough { advisory: serde_json::Value },
    /// No fast handler applies.
    NotApplicable,
}

pub struct FastPath {
    router: IntentRouter,
    store: Arc<dyn ConversationStore>,
    replies: Arc<dyn ReplyQueue>,
    directory: Arc<dyn ClinicDirectory>,
    operator_phones: Vec<String>,
}

impl FastPath {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        replies: Arc<dyn ReplyQueue>,
        directory: Arc<dyn ClinicDirectory>,
        operator_phones: Vec<String>,
    ) -> Self {
        Self {
            router: IntentRouter::new(),
            store,
            replies,
            directory,
            operator_phones,
        }
    }

    pub async fn try_handle(&self, request: &FastPathRequest<'_>) -> FastPathOutcome {
        let intent = self.router.detect_intent(request.message);
        if !intent.has_fast_handler() {
            return FastPathOutcome::NotApplicable;
        }

        match intent {
            Intent::Greeting => self.handle_greeting(request).await,
            Intent::HandoffHuman => self.handle_handoff(request).await,
            Intent::ConfirmTime => self.handle_confirm_time(request).await,
            Intent::PriceQuery => self.handle_price_query(request).await,
            _ => FastPathOutcome::NotApplicable,
        }
    }

    async fn handle_greeting(&self, request: &FastPathRequest<'_>) -> FastPathOutcome {
        let language = detect_language(request.message);
        let response = templates::greeting(language).to_string();

        self.store_turn(
            request,
            json!({ "intent": "greeting", "lang": language.as_str() }),
            &response,
        );

        info!(lang = language.as_str(), "fast-path greeting");
        FastPathOutcome::Handled(FastPathReply {
            response,
            metadata: json!({
                "fast_path": true,
                "intent": "greeting",
                "language": language.as_str(),
                "template": true,
            }),
            language,
            escalated: false,
        })
    }

    async fn handle_handoff(&self, request: &FastPathRequest<'_>) -> FastPathOutcome {
        let language = detect_language(request.message);

        spawn_store_message(
            &self.store,
            request.session_id,
            Role::User,
            request.message,
            request.from_phone,
            json!({ "intent": "handoff_human", "clinic_id": request.clinic_id }),
        );

        let outcome = escalation::escalate_conversation(
            &self.store,
            &self.replies,
            request.session_id,
            request.from_phone,
            request.instance,
            &self.operator_phones,
            language,
            "User requested human agent (fast-path)",
        )
        .await;

        info!("fast-path handoff complete");
        FastPathOutcome::Handled(FastPathReply {
            response: outcome.holding_message,
            metadata: json!({
                "fast_path": true,
                "intent": "handoff_human",
                "escalated": true,
            }),
            language,
            escalated: true,
        })
    }

    async fn handle_confirm_time(&self, request: &FastPathRequest<'_>) -> FastPathOutcome {
        let language = detect_language(request.message);

        let Some(time) = self.router.parse_time(request.message) else {
            // Matched the intent but no parseable time: full processing.
            return FastPathOutcome::NotApplicable;
        };

        // With a date the turn needs availability checks — full pipeline,
        // but carry what we parsed so it isn't re-derived.
        if let Some(date) = self.router.parse_date(request.message) {
            info!(%date, "time confirmation carries a date, falling through");
            return FastPathOutcome::FallThrough {
                advisory: json!({
                    "intent": "confirm_time",
                    "parsed_time": format!("{:02}:{:02}", time.hour, time.minute),
                    "parsed_date": date,
                }),
            };
        }

        let response = templates::need_date(language, time.hour, time.minute);
        self.store_turn(
            request,
            json!({
                "intent": "confirm_time",
                "hour": time.hour,
                "minute": time.minute,
            }),
            &response,
        );

        FastPathOutcome::Handled(FastPathReply {
            response,
            metadata: json!({
                "fast_path": true,
                "intent": "confirm_time",
                "language": language.as_str(),
                "parsed_time": format!("{:02}:{:02}", time.hour, time.minute),
                "template": true,
            }),
            language,
            escalated: false,
        })
    }

    async fn handle_price_query(&self, request: &FastPathRequest<'_>) -> FastPathOutcome {
        let language = detect_language(request.message);
        let services = self.directory.services(request.clinic_id).await;

        // Match service names against the message words.
        let lower = request.message.to_lowercase();
        let matched: Vec<_> = services
            .iter()
            .filter(|s| {
                let name = s.name.to_lowercase();
                lower.contains(&name) || name.split_whitespace().any(|w| w.len() > 3 && lower.contains(w))
            })
            .take(3)
            .collect();

        let response = if matched.is_empty() {
            match language {
                Language::Ru => "К сожалению, я не нашел услугу по вашему запросу. Уточните, пожалуйста, что именно вас интересует?".to_string(),
                Language::Es => "Lo siento, no encontré ese servicio. ¿Puede especificar qué está buscando?".to_string(),
                _ => "I couldn't find that service. Can you specify what you're looking for?".to_string(),
            }
        } else {
            let lines: Vec<String> = matched
                .iter()
                .map(|s| {
                    let duration = s
                        .duration_minutes
                        .map(|d| format!(" ({d} min)"))
                        .unwrap_or_default();
                    match s.price {
                        Some(price) => format!("• {}: ${price}{duration}", s.name),
                        None => format!("• {}{duration}", s.name),
                    }
                })
                .collect();
            match language {
                Language::Ru => format!(
                    "Нашел следующие услуги:\n\n{}\n\nХотите записаться?",
                    lines.join("\n")
                ),
                Language::Es => format!(
                    "Encontré los siguientes servicios:\n\n{}\n\n¿Desea hacer una cita?",
                    lines.join("\n")
                ),
                _ => format!(
                    "I found the following services:\n\n{}\n\nWould you like to book an appointment?",
                    lines.join("\n")
                ),
            }
        };

        self.store_turn(
            request,
            json!({ "intent": "price_query", "lang": language.as_str() }),
            &response,
        );

        info!(matched = matched.len(), "fast-path price query");
        FastPathOutcome::Handled(FastPathReply {
            response,
            metadata: json!({
                "fast_path": true,
                "intent": "price_query",
                "language": language.as_str(),
                "matched_services": matched.len(),
            }),
            language,
            escalated: false,
        })
    }

    /// Persist the user and assistant messages, fire-and-forget.
    fn store_turn(
        &self,
        request: &FastPathRequest<'_>,
        user_metadata: serde_json::Value,
        response: &str,
    ) {
        spawn_store_message(
            &self.store,
            request.session_id,
            Role::User,
            request.message,
            request.from_phone,
            user_metadata,
        );
        spawn_store_message(
            &self.store,
            request.session_id,
            Role::Assistant,
            response,
            request.from_phone,
            json!({ "fast_path": true, "template": true, "clinic_id": request.clinic_id }),
        );
    }
}
