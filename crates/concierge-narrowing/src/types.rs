use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What the agent should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrowingAction {
    AskQuestion,
    CallTool,
    /// No narrowing applies — an external orchestrator owns the turn.
    PassThrough,
}

/// Language-neutral question types. The LLM localizes them into the user's
/// language; the templates in the prompt crate describe each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    AskForService,
    AskForTime,
    AskForDoctor,
    AskTimeWithDoctor,
    AskTimeWithService,
    AskTodayOrTomorrow,
    SuggestConsultation,
    AskFirstAvailable,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::AskForService => "ask_for_service",
            QuestionType::AskForTime => "ask_for_time",
            QuestionType::AskForDoctor => "ask_for_doctor",
            QuestionType::AskTimeWithDoctor => "ask_time_with_doctor",
            QuestionType::AskTimeWithService => "ask_time_with_service",
            QuestionType::AskTodayOrTomorrow => "ask_today_or_tomorrow",
            QuestionType::SuggestConsultation => "suggest_consultation",
            QuestionType::AskFirstAvailable => "ask_first_available",
        }
    }
}

/// Canonical label for how much the agent knows about service/doctor/time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrowingCase {
    FullySpecified,
    ServiceOnly,
    ServiceAndTime,
    ServiceAndDoctor,
    DoctorOnly,
    TimeOnly,
    NothingKnown,
    UrgentNoTime,
}

impl NarrowingCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrowingCase::FullySpecified => "fully_specified",
            NarrowingCase::ServiceOnly => "service_only",
            NarrowingCase::ServiceAndTime => "service+time",
            NarrowingCase::ServiceAndDoctor => "service+doctor",
            NarrowingCase::DoctorOnly => "doctor_only",
            NarrowingCase::TimeOnly => "time_only",
            NarrowingCase::NothingKnown => "nothing_known",
            NarrowingCase::UrgentNoTime => "urgent_no_time",
        }
    }
}

/// Urgency classification from the user message.
///
/// routine → 7-14 days out; soon → 3-7 days; urgent → today/tomorrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    #[default]
    Routine,
    Soon,
    Urgent,
}

/// Parameters for a planned tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPlan {
    pub tool_name: String,
    pub params: serde_json::Value,
}

impl ToolCallPlan {
    pub fn check_availability(params: serde_json::Value) -> Self {
        Self {
            tool_name: "check_availability".to_string(),
            params,
        }
    }
}

/// An eligible doctor row as returned by the directory lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doctor {
    pub doctor_id: String,
    pub doctor_name: String,
}

/// The decision record emitted each turn.
///
/// Either tells the LLM to ask a specific question OR to call a tool with
/// specific params. `eligible_doctor_count` is `None` iff the directory
/// lookup itself failed — distinct from `Some(0)`, genuinely no doctors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowingInstruction {
    pub action: NarrowingAction,
    pub case: NarrowingCase,

    pub question_type: Option<QuestionType>,
    #[serde(default)]
    pub question_args: BTreeMap<String, serde_json::Value>,
    pub question_context: Option<String>,

    pub tool_call: Option<ToolCallPlan>,

    pub eligible_doctor_count: Option<u32>,
    pub urgency: UrgencyLevel,
}

impl NarrowingInstruction {
    pub fn ask(case: NarrowingCase, question_type: QuestionType, urgency: UrgencyLevel) -> Self {
        Self {
            action: NarrowingAction::AskQuestion,
            case,
            question_type: Some(question_type),
            question_args: BTreeMap::new(),
            question_context: None,
            tool_call: None,
            eligible_doctor_count: None,
            urgency,
        }
    }

    pub fn call(case: NarrowingCase, tool_call: ToolCallPlan, urgency: UrgencyLevel) -> Self {
        Self {
            action: NarrowingAction::CallTool,
            case,
            question_type: None,
            question_args: BTreeMap::new(),
            question_context: None,
            tool_call: Some(tool_call),
            eligible_doctor_count: None,
            urgency,
        }
    }

    pub fn pass_through(case: NarrowingCase) -> Self {
        Self {
            action: NarrowingAction::PassThrough,
            case,
            question_type: None,
            question_args: BTreeMap::new(),
            question_context: None,
            tool_call: None,
            eligible_doctor_count: None,
            urgency: UrgencyLevel::Routine,
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.question_args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.question_context = Some(context.to_string());
        self
    }

    pub fn with_doctor_count(mut self, count: Option<u32>) -> Self {
        self.eligible_doctor_count = count;
        self
    }
}
