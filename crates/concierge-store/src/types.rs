use serde::{Deserialize, Serialize};

use crate::state::{ControlMode, FlowState, TurnStatus};

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// A persisted conversation session — one user at one clinic on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    /// Cleaned phone number (digits only).
    pub user_identifier: String,
    pub clinic_id: String,
    pub channel: String,
    pub flow_state: FlowState,
    pub turn_status: TurnStatus,
    pub pending_action: Option<String>,
    pub pending_since: Option<String>,
    pub control_mode: ControlMode,
    pub unread_for_human_count: u32,
    /// Last detected language; short follow-ups inherit it (inertia).
    pub session_language: Option<String>,
    /// When set, the follow-up engine re-wakes this session at the instant.
    pub scheduled_followup_at: Option<String>,
    /// "active" | "ended".
    pub status: String,
    /// Summary written when an idle session is archived.
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub ended_at: Option<String>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.status == "active" && self.ended_at.is_none()
    }

    /// The two-layer state view of this session.
    pub fn conversation_state(&self) -> crate::state::ConversationState {
        crate::state::ConversationState {
            flow_state: self.flow_state,
            turn_status: self.turn_status,
            pending_action: self.pending_action.clone(),
            pending_since: self.pending_since.clone(),
        }
    }
}

/// Result of a get-or-create: the session plus context the pipeline needs.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session: Session,
    pub is_new: bool,
    /// Summary of this user's previous archived session, if one exists.
    pub previous_session_summary: Option<String>,
}

/// A stored inbound or outbound turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub phone: String,
    /// JSON blob: language, intent tag, correlation id, fast-path flags…
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// Partial session update applied after a reply is produced — never before,
/// so a failed reply leaves state unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub flow_state: Option<FlowState>,
    pub turn_status: Option<TurnStatus>,
    pub pending_action: Option<Option<String>>,
    pub pending_since: Option<Option<String>>,
    pub control_mode: Option<ControlMode>,
    pub session_language: Option<String>,
    pub scheduled_followup_at: Option<Option<String>>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub ended_at: Option<Option<String>>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.flow_state.is_none()
            && self.turn_status.is_none()
            && self.pending_action.is_none()
            && self.pending_since.is_none()
            && self.control_mode.is_none()
            && self.session_language.is_none()
            && self.scheduled_followup_at.is_none()
            && self.status.is_none()
            && self.summary.is_none()
            && self.ended_at.is_none()
    }

    pub fn turn_status(mut self, status: TurnStatus) -> Self {
        self.turn_status = Some(status);
        self
    }

    pub fn flow_state(mut self, state: FlowState) -> Self {
        self.flow_state = Some(state);
        self
    }

    pub fn escalate(mut self) -> Self {
        self.flow_state = Some(FlowState::Escalated);
        self.turn_status = Some(TurnStatus::Escalated);
        self.control_mode = Some(ControlMode::Human);
        self
    }
}
