//! Default prompt section templates and the small helpers that render
//! data-driven sections.
//!
//! Templates are plain strings with `{name}` placeholders; `substitute`
//! replaces known names and leaves unknown braces alone.

use std::collections::BTreeMap;

use concierge_constraints::ConversationConstraints;
use concierge_narrowing::{Doctor, NarrowingAction, NarrowingInstruction};

pub const BASE_PERSONA: &str = "\
You are the virtual front-desk assistant for {clinic_name}.
You help patients with appointments, prices, and general questions.
Reply in the user's language. Be warm, brief, and concrete — WhatsApp
messages, not letters.";

pub const CLINIC_CONTEXT: &str = "\
CLINIC
Name: {clinic_name}
Location: {clinic_location}
Services: {services_text}
Doctors:
{doctors_text}
Hours: weekdays {weekday_hours}, Saturday {saturday_hours}, Sunday {sunday_hours}";

pub const DATE_TIME_CONTEXT: &str = "\
CURRENT DATE AND TIME
Today is {current_day}, {current_date}. The time is {current_time}.
Tomorrow is {tomorrow_day}, {tomorrow_date}.
Today's hours: {todays_hours}";

pub const DATE_RULES: &str = "\
DATE RULES
- Resolve relative dates ('tomorrow', 'Friday') against today's date above.
- Never invent dates or times. If unsure which day the user means, ask.
- Past dates are invalid for booking; offer the next occurrence instead.";

pub const BOOKING_POLICY: &str = "\
BOOKING POLICY
- YOU DO NOT know availability. Before proposing a slot you MUST call check_availability.
- YOU DO NOT know any prices from memory. For prices you MUST call query_service_prices.
- Confirm service, doctor, and time with the patient before booking.
- One question per message. Do not list more than 3 options at once.";

pub const NARROWING_ASK_QUESTION: &str = "\
AGENT CONTROL — THIS TURN
Known so far: {case}.
Your next message must do exactly one thing: {question_guidance}
Keep it to one short question in the user's language.";

pub const NARROWING_CALL_TOOL: &str = "\
AGENT CONTROL — THIS TURN
Known so far: {case}.
Call check_availability now with these parameters: {params}.
Report the result plainly; do not ask a question first.";

pub const NARROWING_PASS_THROUGH: &str = "\
AGENT CONTROL — THIS TURN
Known so far: {case}. {note}";

/// Lines stripped from the booking policy when the prompt is used without
/// tool calling, to keep the LLM from hallucinating tool invocations.
pub const TOOL_ONLY_MARKERS: &[&str] = &[
    "MUST call query_service_prices",
    "MUST call check_availability",
    "MANDATORY TOOL CALLS",
    "YOU DO NOT know any prices",
    "YOU DO NOT know availability",
    "CALL THE TOOL FIRST",
    "Call check_availability now",
];

/// Question-type guidance, localized later by the LLM.
pub fn question_guidance(question_type: &str, args: &BTreeMap<String, serde_json::Value>) -> String {
    let template = match question_type {
        "ask_for_service" => "Ask what service the user needs (e.g., cleaning, checkup, whitening)",
        "ask_for_time" => "Ask what day and time works best for the user",
        "ask_for_doctor" => "Ask if the user prefers {doctor_names} or first available",
        "ask_time_with_doctor" => "Ask when the user would like to see {doctor_name}",
        "ask_time_with_service" => "Ask when the user would like their {service_name} appointment",
        "ask_today_or_tomorrow" => "Ask if the user prefers today or tomorrow (urgent case)",
        "suggest_consultation" => "Explain there is no specialist for {service_name} and suggest a general consultation",
        "ask_first_available" => "Ask if the user prefers {doctor_names} or the first available slot",
        _ => "Ask a clarifying question",
    };

    let mut subs = BTreeMap::new();
    for (key, value) in args {
        subs.insert(key.clone(), json_to_text(value));
    }
    substitute(template, &subs)
}

/// Replace `{name}` placeholders from the map; unknown names are left as-is.
pub fn substitute(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(json_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Render the doctors list, one per line.
pub fn build_doctors_text(doctors: &[Doctor]) -> String {
    if doctors.is_empty() {
        return "- (ask for the current list)".to_string();
    }
    doctors
        .iter()
        .map(|d| format!("- {}", d.doctor_name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Patient profile section; empty when nothing useful is known.
pub fn build_profile_section(patient_name: Option<&str>, language: Option<&str>) -> String {
    let mut lines = Vec::new();
    if let Some(name) = patient_name {
        lines.push(format!("Name: {name}"));
    }
    if let Some(lang) = language {
        lines.push(format!("Preferred language: {lang}"));
    }
    if lines.is_empty() {
        return String::new();
    }
    format!("PATIENT\n{}", lines.join("\n"))
}

/// Compact transcript of the most recent turns.
pub fn build_conversation_summary(messages: &[(String, String)]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let recent: Vec<String> = messages
        .iter()
        .rev()
        .take(6)
        .map(|(role, content)| {
            let content = if content.chars().count() > 160 {
                let cut: String = content.chars().take(160).collect();
                format!("{cut}…")
            } else {
                content.clone()
            };
            format!("{role}: {content}")
        })
        .collect();
    format!(
        "RECENT CONVERSATION (oldest first)\n{}",
        recent.into_iter().rev().collect::<Vec<_>>().join("\n")
    )
}

/// Active constraints rendered for the LLM.
pub fn build_constraints_section(constraints: &ConversationConstraints) -> String {
    if constraints.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    if let Some(ref service) = constraints.desired_service {
        lines.push(format!("Wanted service: {service}"));
    }
    if let Some(ref doctor) = constraints.desired_doctor {
        lines.push(format!("Wanted doctor: {doctor}"));
    }
    if let Some(ref label) = constraints.time_window_label {
        lines.push(format!("Time window: {label}"));
    }
    if !constraints.excluded_services.is_empty() {
        lines.push(format!(
            "Ruled-out services: {}",
            constraints
                .excluded_services
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if !constraints.excluded_doctors.is_empty() {
        lines.push(format!(
            "Ruled-out doctors: {}",
            constraints
                .excluded_doctors
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    format!(
        "ACTIVE CONSTRAINTS (do not contradict these)\n{}",
        lines.join("\n")
    )
}

/// The narrowing control block — prepended at the top of the prompt.
pub fn build_narrowing_block(instruction: &NarrowingInstruction) -> String {
    match instruction.action {
        NarrowingAction::AskQuestion => {
            let question_type = instruction
                .question_type
                .map(|q| q.as_str())
                .unwrap_or_default();
            let guidance = question_guidance(question_type, &instruction.question_args);
            let mut subs = BTreeMap::new();
            subs.insert("case".to_string(), instruction.case.as_str().to_string());
            subs.insert("question_guidance".to_string(), guidance);
            substitute(NARROWING_ASK_QUESTION, &subs)
        }
        NarrowingAction::CallTool => {
            let params = instruction
                .tool_call
                .as_ref()
                .map(|t| t.params.to_string())
                .unwrap_or_else(|| "{}".to_string());
            let mut subs = BTreeMap::new();
            subs.insert("case".to_string(), instruction.case.as_str().to_string());
            subs.insert("params".to_string(), params);
            substitute(NARROWING_CALL_TOOL, &subs)
        }
        NarrowingAction::PassThrough => {
            let mut subs = BTreeMap::new();
            subs.insert("case".to_string(), instruction.case.as_str().to_string());
            subs.insert(
                "note".to_string(),
                instruction
                    .question_context
                    .clone()
                    .unwrap_or_else(|| "Proceeding without narrowing.".to_string()),
            );
            substitute(NARROWING_PASS_THROUGH, &subs)
        }
    }
}
