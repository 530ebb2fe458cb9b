use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDateTime};
use tracing::debug;

use concierge_constraints::ConversationConstraints;
use concierge_narrowing::{Doctor, NarrowingInstruction};

use crate::components::{
    build_constraints_section, build_conversation_summary, build_doctors_text,
    build_narrowing_block, build_profile_section, substitute, BASE_PERSONA, BOOKING_POLICY,
    CLINIC_CONTEXT, DATE_RULES, DATE_TIME_CONTEXT, TOOL_ONLY_MARKERS,
};

/// Everything the composer needs from a pipeline turn.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub clinic_name: String,
    pub clinic_location: String,
    pub services: Vec<String>,
    pub doctors: Vec<Doctor>,
    pub weekday_hours: String,
    pub saturday_hours: String,
    pub sunday_hours: String,
    /// Clinic-local reference instant for the date/time section.
    pub now: Option<NaiveDateTime>,
    pub patient_name: Option<String>,
    pub patient_language: Option<String>,
    /// (role, content) pairs, oldest first.
    pub session_messages: Vec<(String, String)>,
    pub previous_session_summary: Option<String>,
    pub additional_context: String,
    pub constraints: Option<ConversationConstraints>,
    pub narrowing: Option<NarrowingInstruction>,
}

/// Composes the system prompt from ordered sections.
///
/// Section text comes from the defaults in [`crate::components`] unless a
/// per-clinic override replaces it. Overrides are plain strings with the
/// same `{name}` placeholders.
#[derive(Default)]
pub struct PromptComposer {
    overrides: BTreeMap<String, String>,
}

/// Override keys accepted by [`PromptComposer::with_override`].
pub const SECTION_KEYS: &[&str] = &[
    "base_persona",
    "clinic_context",
    "date_time_context",
    "date_rules",
    "booking_policy",
];

impl PromptComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a per-clinic override for one section.
    pub fn with_override(mut self, key: &str, template: &str) -> Self {
        self.overrides.insert(key.to_string(), template.to_string());
        self
    }

    /// Compose the full system prompt.
    ///
    /// `tool_mode` — whether the prompt will be used with tool calling.
    /// When false, lines instructing the LLM to invoke tools are filtered
    /// out so it cannot hallucinate tool calls.
    pub fn compose(&self, inputs: &PromptInputs, tool_mode: bool) -> String {
        let context = self.build_context(inputs);
        let get = |key: &str, default: &str| -> String {
            self.overrides
                .get(key)
                .map(String::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let mut sections: Vec<String> = Vec::new();
        sections.push(substitute(&get("base_persona", BASE_PERSONA), &context));
        sections.push(substitute(&get("clinic_context", CLINIC_CONTEXT), &context));
        sections.push(substitute(
            &get("date_time_context", DATE_TIME_CONTEXT),
            &context,
        ));
        sections.push(substitute(&get("date_rules", DATE_RULES), &context));

        let mut booking = substitute(&get("booking_policy", BOOKING_POLICY), &context);
        if !tool_mode {
            booking = strip_tool_lines(&booking);
        }
        sections.push(booking);

        let profile = build_profile_section(
            inputs.patient_name.as_deref(),
            inputs.patient_language.as_deref(),
        );
        if !profile.is_empty() {
            sections.push(profile);
        }

        let summary = build_conversation_summary(&inputs.session_messages);
        if !summary.is_empty() {
            sections.push(summary);
        }

        if let Some(ref previous) = inputs.previous_session_summary {
            sections.push(format!(
                "PREVIOUS SESSION CONTEXT\n{previous}\n(Use if relevant, but prioritize the current request.)"
            ));
        }

        if !inputs.additional_context.is_empty() {
            sections.push(inputs.additional_context.clone());
        }

        let mut prompt = sections
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        if let Some(ref constraints) = inputs.constraints {
            let section = build_constraints_section(constraints);
            if !section.is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(&section);
            }
        }

        // The control block goes FIRST — it is the most binding instruction.
        if let Some(ref narrowing) = inputs.narrowing {
            let block = build_narrowing_block(narrowing);
            if !block.is_empty() {
                prompt = format!("{block}\n\n{prompt}");
            }
        }

        debug!(chars = prompt.len(), "system prompt composed");
        prompt
    }

    fn build_context(&self, inputs: &PromptInputs) -> BTreeMap<String, String> {
        let now = inputs
            .now
            .unwrap_or_else(|| chrono::Utc::now().naive_utc());
        let tomorrow = now + Duration::days(1);

        let todays_hours = match now.weekday() {
            chrono::Weekday::Sat => &inputs.saturday_hours,
            chrono::Weekday::Sun => &inputs.sunday_hours,
            _ => &inputs.weekday_hours,
        };

        let services_text = if inputs.services.is_empty() {
            "Information available upon request".to_string()
        } else {
            inputs
                .services
                .iter()
                .take(6)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut context = BTreeMap::new();
        context.insert("clinic_name".into(), fallback(&inputs.clinic_name, "Clinic"));
        context.insert(
            "clinic_location".into(),
            fallback(&inputs.clinic_location, "Unknown"),
        );
        context.insert("services_text".into(), services_text);
        context.insert("doctors_text".into(), build_doctors_text(&inputs.doctors));
        context.insert(
            "weekday_hours".into(),
            fallback(&inputs.weekday_hours, "Not provided"),
        );
        context.insert(
            "saturday_hours".into(),
            fallback(&inputs.saturday_hours, "Not provided"),
        );
        context.insert(
            "sunday_hours".into(),
            fallback(&inputs.sunday_hours, "Not provided"),
        );
        context.insert("current_date".into(), now.format("%Y-%m-%d").to_string());
        context.insert("current_day".into(), now.format("%A").to_string());
        context.insert("current_time".into(), now.format("%H:%M").to_string());
        context.insert(
            "tomorrow_date".into(),
            tomorrow.format("%Y-%m-%d").to_string(),
        );
        context.insert("tomorrow_day".into(), tomorrow.format("%A").to_string());
        context.insert("todays_hours".into(), fallback(todays_hours, "Not provided"));
        context
    }
}

fn fallback(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn strip_tool_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !TOOL_ONLY_MARKERS.iter().any(|marker| line.contains(marker)))
        .collect::<Vec<_>>()
        .join("\n")
}
