//! Two-layer conversation state.
//!
//! `FlowState` says where we are in the workflow; `TurnStatus` says whose
//! turn it is. The two are orthogonal: a conversation can be in
//! `CollectingSlots` while `AgentActionPending` because the assistant
//! promised a follow-up.

use serde::{Deserialize, Serialize};

/// Domain/workflow state — where are we in the conversation flow?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    InfoSeeking,
    Greeting,
    CollectingSlots,
    PresentingSlots,
    AwaitingClarification,
    AwaitingConfirmation,
    Disambiguating,
    Booking,
    Completed,
    Failed,
    Escalated,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::InfoSeeking => "info_seeking",
            FlowState::Greeting => "greeting",
            FlowState::CollectingSlots => "collecting_slots",
            FlowState::PresentingSlots => "presenting_slots",
            FlowState::AwaitingClarification => "awaiting_clarification",
            FlowState::AwaitingConfirmation => "awaiting_confirmation",
            FlowState::Disambiguating => "disambiguating",
            FlowState::Booking => "booking",
            FlowState::Completed => "completed",
            FlowState::Failed => "failed",
            FlowState::Escalated => "escalated",
        }
    }

    /// Unknown values map to Idle rather than erroring — old rows survive
    /// enum changes.
    pub fn parse(value: &str) -> Self {
        match value {
            "idle" => FlowState::Idle,
            "info_seeking" => FlowState::InfoSeeking,
            "greeting" => FlowState::Greeting,
            "collecting_slots" => FlowState::CollectingSlots,
            "presenting_slots" => FlowState::PresentingSlots,
            "awaiting_clarification" => FlowState::AwaitingClarification,
            "awaiting_confirmation" => FlowState::AwaitingConfirmation,
            "disambiguating" => FlowState::Disambiguating,
            "booking" => FlowState::Booking,
            "completed" => FlowState::Completed,
            "failed" => FlowState::Failed,
            "escalated" => FlowState::Escalated,
            _ => FlowState::Idle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Failed | FlowState::Escalated)
    }

    pub fn is_booking_flow(&self) -> bool {
        matches!(
            self,
            FlowState::CollectingSlots
                | FlowState::PresentingSlots
                | FlowState::AwaitingClarification
                | FlowState::AwaitingConfirmation
                | FlowState::Disambiguating
                | FlowState::Booking
        )
    }

    /// Booking-lane steps and tools may only run in these states.
    pub fn allows_booking_tools(&self) -> bool {
        matches!(
            self,
            FlowState::Idle
                | FlowState::CollectingSlots
                | FlowState::PresentingSlots
                | FlowState::AwaitingConfirmation
                | FlowState::Booking
        )
    }
}

/// Interaction-level status — whose turn is it?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    UserTurn,
    AgentActionPending,
    AgentTurn,
    Resolved,
    Escalated,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::UserTurn => "user_turn",
            TurnStatus::AgentActionPending => "agent_action_pending",
            TurnStatus::AgentTurn => "agent_turn",
            TurnStatus::Resolved => "resolved",
            TurnStatus::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "user_turn" => TurnStatus::UserTurn,
            "agent_action_pending" => TurnStatus::AgentActionPending,
            "agent_turn" => TurnStatus::AgentTurn,
            "resolved" => TurnStatus::Resolved,
            "escalated" => TurnStatus::Escalated,
            _ => TurnStatus::UserTurn,
        }
    }
}

/// Who owns the session: the bot, a human operator, or nobody (paused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Agent,
    Human,
    Paused,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Agent => "agent",
            ControlMode::Human => "human",
            ControlMode::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "human" => ControlMode::Human,
            "paused" => ControlMode::Paused,
            _ => ControlMode::Agent,
        }
    }

    /// When not agent-owned, inbound messages bypass the LLM entirely.
    pub fn bypasses_agent(&self) -> bool {
        !matches!(self, ControlMode::Agent)
    }
}

/// Composite record persisting both layers plus the pending-action details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub flow_state: FlowState,
    pub turn_status: TurnStatus,
    /// Free-text description of what the agent promised ("check availability").
    pub pending_action: Option<String>,
    /// RFC3339 timestamp of when the promise was made.
    pub pending_since: Option<String>,
}

impl ConversationState {
    pub fn is_terminal(&self) -> bool {
        self.flow_state.is_terminal()
    }

    pub fn agent_needs_to_act(&self) -> bool {
        matches!(
            self.turn_status,
            TurnStatus::AgentActionPending | TurnStatus::AgentTurn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_state_roundtrip_and_fallback() {
        for s in [
            FlowState::Idle,
            FlowState::CollectingSlots,
            FlowState::Escalated,
        ] {
            assert_eq!(FlowState::parse(s.as_str()), s);
        }
        assert_eq!(FlowState::parse("garbage"), FlowState::Idle);
    }

    #[test]
    fn booking_tool_gate() {
        assert!(FlowState::Idle.allows_booking_tools());
        assert!(FlowState::Booking.allows_booking_tools());
        assert!(!FlowState::Escalated.allows_booking_tools());
        assert!(!FlowState::AwaitingClarification.allows_booking_tools());
    }

    #[test]
    fn terminal_states() {
        assert!(FlowState::Completed.is_terminal());
        assert!(FlowState::Failed.is_terminal());
        assert!(FlowState::Escalated.is_terminal());
        assert!(!FlowState::Booking.is_terminal());
    }

    #[test]
    fn control_mode_gating() {
        assert!(!ControlMode::Agent.bypasses_agent());
        assert!(ControlMode::Human.bypasses_agent());
        assert!(ControlMode::Paused.bypasses_agent());
    }
}
