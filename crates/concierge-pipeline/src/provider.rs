//! LLM provider and tool-execution seams.
//!
//! Messages travel as raw JSON values so tool_use / tool_result content
//! blocks pass through untouched, whatever the provider's dialect.

use async_trait::async_trait;

use concierge_store::FlowState;

/// A request to the chat model.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    /// Raw role/content messages, oldest first.
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<serde_json::Value>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<LlmToolCall>,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, String>;
}

/// Executes one tool call on behalf of the LLM.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool schemas advertised to the model for this clinic.
    fn tool_schemas(&self, clinic_id: &str) -> Vec<serde_json::Value>;

    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        clinic_id: &str,
        session_id: &str,
    ) -> Result<serde_json::Value, String>;
}

/// Booking tools that only run in booking-compatible flow states.
const BOOKING_TOOLS: &[&str] = &["check_availability", "book_appointment"];

/// Per-turn gate over tool execution: flow-state restrictions plus a
/// calendar-call budget. Counters reset at the start of every LLM turn.
#[derive(Debug)]
pub struct ToolStateGate {
    calendar_calls: u32,
    max_calendar_calls: u32,
}

impl ToolStateGate {
    pub fn new(max_calendar_calls: u32) -> Self {
        Self {
            calendar_calls: 0,
            max_calendar_calls,
        }
    }

    pub fn reset_turn_counters(&mut self) {
        self.calendar_calls = 0;
    }

    /// Whether the named tool may run now. Calendar-backed tools consume
    /// budget; information tools always pass.
    pub fn allow(&mut self, tool_name: &str, flow_state: FlowState) -> Result<(), String> {
        if BOOKING_TOOLS.contains(&tool_name) {
            if !flow_state.allows_booking_tools() {
                return Err(format!(
                    "tool '{tool_name}' not allowed in state '{}'",
                    flow_state.as_str()
                ));
            }
            if self.calendar_calls >= self.max_calendar_calls {
                return Err("calendar call budget exhausted for this turn".to_string());
            }
            self.calendar_calls += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_tools_gated_by_flow_state() {
        let mut gate = ToolStateGate::new(10);
        assert!(gate.allow("check_availability", FlowState::Idle).is_ok());
        assert!(gate.allow("check_availability", FlowState::Escalated).is_err());
        // Info tools pass regardless.
        assert!(gate.allow("query_service_prices", FlowState::Escalated).is_ok());
    }

    #[test]
    fn calendar_budget_resets_per_turn() {
        let mut gate = ToolStateGate::new(2);
        assert!(gate.allow("check_availability", FlowState::Idle).is_ok());
        assert!(gate.allow("book_appointment", FlowState::Idle).is_ok());
        assert!(gate.allow("check_availability", FlowState::Idle).is_err());
        gate.reset_turn_counters();
        assert!(gate.allow("check_availability", FlowState::Idle).is_ok());
    }
}
