//! Deterministic narrowing: given the current constraints and the latest
//! user message, decide whether the agent should ask a structured question
//! or call a tool — so agent behavior stays consistent and testable.

pub mod service;
pub mod types;

pub use service::{DoctorDirectory, NarrowingService};
pub use types::{
    Doctor, NarrowingAction, NarrowingCase, NarrowingInstruction, QuestionType, ToolCallPlan,
    UrgencyLevel,
};
