//! The fixed step order:
//!
//! 1. session_management  — resolve identities, load/create the session
//! 2. control_mode_gate   — human/paused sessions bypass the LLM
//! 3. context_hydration   — clinic, patient, and history context
//! 4. escalation_check    — complaint heuristics, stop with holding message
//! 5. routing             — language (with inertia) and lane
//! 6. constraint_enforcement — meta-reset or constraint extraction
//! 7. narrowing           — deterministic next-action decision
//! 8. delegation          — optional external orchestrator hand-off
//! 9. llm_generation      — prompt composition, tool loop, reply
//! 10. post_processing    — state echo, persistence, follow-ups, egress

pub mod constraint;
pub mod control_mode;
pub mod delegation;
pub mod escalation_check;
pub mod hydration;
pub mod llm;
pub mod narrowing;
pub mod post;
pub mod routing;
pub mod session;

pub use constraint::ConstraintEnforcementStep;
pub use control_mode::ControlModeGateStep;
pub use delegation::DelegationStep;
pub use escalation_check::EscalationCheckStep;
pub use hydration::ContextHydrationStep;
pub use llm::LlmGenerationStep;
pub use narrowing::NarrowingStep;
pub use post::PostProcessingStep;
pub use routing::RoutingStep;
pub use session::SessionManagementStep;
