use async_trait::async_trait;
use tracing::{debug, info};

use concierge_core::types::Language;
use concierge_intent::language::{detect_language, has_strong_indicator};

use crate::context::{Lane, PipelineContext};
use crate::step::{PipelineStep, StepError};

/// Messages shorter than this inherit the persisted session language
/// unless they carry a strong language indicator. Calibrated empirically;
/// keep in one place.
pub const SHORT_MESSAGE_CHARS: usize = 12;

/// Detect language with inertia and classify the lane.
pub struct RoutingStep;

impl RoutingStep {
    pub fn new() -> Self {
        Self
    }

    /// Language inertia: short follow-ups ("ok", "yes", "9am") must not
    /// flip the conversation language.
    fn detect_with_inertia(message: &str, session_language: Option<&str>) -> Language {
        let detected = detect_language(message);
        let is_short = message.chars().count() < SHORT_MESSAGE_CHARS;

        if is_short && !has_strong_indicator(message) {
            if let Some(previous) = session_language.and_then(|s| s.parse::<Language>().ok()) {
                debug!(
                    inherited = previous.as_str(),
                    "short message, inheriting session language"
                );
                return previous;
            }
        }
        detected
    }

    fn classify_lane(message: &str) -> Lane {
        let lower = message.to_lowercase();

        let price_words = [
            "price", "cost", "how much", "сколько стоит", "цена", "стоимость", "cuánto", "precio",
            "quanto custa", "מחיר",
        ];
        if price_words.iter().any(|w| lower.contains(w)) {
            return Lane::Price;
        }

        let scheduling_words = [
            "book", "appointment", "schedule", "reschedule", "cancel", "available", "slot",
            "записаться", "запись", "перенести", "отменить", "cita", "agendar", "consulta",
            "תור",
        ];
        if scheduling_words.iter().any(|w| lower.contains(w)) {
            return Lane::Scheduling;
        }

        let faq_words = [
            "hours", "address", "location", "insurance", "parking", "policy", "часы", "адрес",
            "страховка", "horario", "dirección", "seguro",
        ];
        if faq_words.iter().any(|w| lower.contains(w)) {
            return Lane::Faq;
        }

        let service_words = [
            "what is", "tell me about", "do you offer", "procedure", "treatment", "что такое",
            "расскажите", "qué es", "tratamiento",
        ];
        if service_words.iter().any(|w| lower.contains(w)) {
            return Lane::ServiceInfo;
        }

        Lane::Complex
    }
}

impl Default for RoutingStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStep for RoutingStep {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        ctx.detected_language =
            Self::detect_with_inertia(&ctx.message, ctx.session_language.as_deref());
        ctx.lane = Some(Self::classify_lane(&ctx.message));

        info!(
            language = ctx.detected_language.as_str(),
            lane = ctx.lane.map(|l| l.as_str()).unwrap_or(""),
            "routing decided"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_inherits_session_language() {
        let lang = RoutingStep::detect_with_inertia("ok", Some("ru"));
        assert_eq!(lang, Language::Ru);
    }

    #[test]
    fn strong_indicator_overrides_inertia() {
        // "да" is short but unambiguously Cyrillic.
        let lang = RoutingStep::detect_with_inertia("да", Some("en"));
        assert_eq!(lang, Language::Ru);
    }

    #[test]
    fn long_message_redetects() {
        let lang = RoutingStep::detect_with_inertia(
            "hola, quisiera una cita por favor, gracias",
            Some("en"),
        );
        assert_eq!(lang, Language::Es);
    }

    #[test]
    fn no_session_language_falls_back_to_detection() {
        let lang = RoutingStep::detect_with_inertia("ok", None);
        assert_eq!(lang, Language::En);
    }

    #[test]
    fn lane_classification() {
        assert_eq!(RoutingStep::classify_lane("how much is a cleaning?"), Lane::Price);
        assert_eq!(RoutingStep::classify_lane("I want to book an appointment"), Lane::Scheduling);
        assert_eq!(RoutingStep::classify_lane("what are your hours?"), Lane::Faq);
        assert_eq!(RoutingStep::classify_lane("tell me about whitening"), Lane::ServiceInfo);
        assert_eq!(RoutingStep::classify_lane("my jaw clicks when I chew gum"), Lane::Complex);
        assert_eq!(RoutingStep::classify_lane("сколько стоит имплант"), Lane::Price);
    }
}
