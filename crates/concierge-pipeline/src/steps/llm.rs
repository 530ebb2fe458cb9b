use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use concierge_core::config::{LLM_HISTORY_TURNS, LLM_TIMEOUT_SECS, MAX_TOOL_TURNS};
use concierge_intent::{detect_language, templates};
use concierge_prompt::{PromptComposer, PromptInputs};
use concierge_store::ConversationStore;

use crate::context::PipelineContext;
use crate::provider::{LlmProvider, LlmRequest, LlmResponse, ToolExecutor, ToolStateGate};
use crate::step::{PipelineStep, StepError};

/// Calendar calls allowed inside one turn.
const MAX_CALENDAR_CALLS: u32 = 10;

/// Generate the reply with the LLM: compose the prompt, run the multi-turn
/// tool loop, clean the output, detect its language.
pub struct LlmGenerationStep {
    provider: Arc<dyn LlmProvider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    store: Arc<dyn ConversationStore>,
    composer: PromptComposer,
}

impl LlmGenerationStep {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Option<Arc<dyn ToolExecutor>>,
        store: Arc<dyn ConversationStore>,
        composer: PromptComposer,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            composer,
        }
    }

    fn prompt_inputs(ctx: &PipelineContext) -> PromptInputs {
        let profile = ctx.clinic_profile.clone().unwrap_or_default();
        PromptInputs {
            clinic_name: if ctx.clinic_name.is_empty() {
                profile.name.clone()
            } else {
                ctx.clinic_name.clone()
            },
            clinic_location: profile.location,
            services: ctx.clinic_services.iter().map(|s| s.name.clone()).collect(),
            doctors: ctx.clinic_doctors.clone(),
            weekday_hours: profile.weekday_hours,
            saturday_hours: profile.saturday_hours,
            sunday_hours: profile.sunday_hours,
            now: Some(chrono::Utc::now().naive_utc()),
            patient_name: ctx.patient_name.clone(),
            patient_language: ctx.session_language.clone(),
            session_messages: ctx.session_messages.clone(),
            previous_session_summary: ctx.previous_session_summary.clone(),
            additional_context: ctx.additional_context.clone(),
            constraints: ctx.constraints.clone(),
            narrowing: ctx.narrowing_instruction.clone(),
        }
    }

    fn build_messages(ctx: &PipelineContext) -> Vec<serde_json::Value> {
        let mut messages: Vec<serde_json::Value> = ctx
            .session_messages
            .iter()
            .rev()
            .take(LLM_HISTORY_TURNS)
            .rev()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect();
        messages.push(json!({ "role": "user", "content": ctx.message }));
        messages
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmFailure> {
        match timeout(
            Duration::from_secs(LLM_TIMEOUT_SECS),
            self.provider.generate(request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(LlmFailure::Provider(e)),
            Err(_) => Err(LlmFailure::Timeout),
        }
    }

    async fn run_with_tools(
        &self,
        ctx: &mut PipelineContext,
        mut request: LlmRequest,
    ) -> Result<LlmResponse, LlmFailure> {
        let mut response = self.generate(&request).await?;

        let Some(ref executor) = self.tools else {
            return Ok(response);
        };

        let conversation_state = ctx
            .session
            .as_ref()
            .map(|s| s.conversation_state())
            .unwrap_or_default();
        let flow_state = conversation_state.flow_state;
        let mut gate = ToolStateGate::new(MAX_CALENDAR_CALLS);
        gate.reset_turn_counters();

        let clinic_id = ctx.effective_clinic_id().to_string();
        let session_id = ctx.session_id.clone().unwrap_or_default();

        let mut turn = 0;
        while turn < MAX_TOOL_TURNS && !response.tool_calls.is_empty() {
            turn += 1;
            info!(calls = response.tool_calls.len(), turn, "LLM requested tool calls");

            // Assistant turn with its tool_use blocks.
            let assistant_calls: Vec<serde_json::Value> = response
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments.to_string() },
                    })
                })
                .collect();
            request.messages.push(json!({
                "role": "assistant",
                "content": response.content,
                "tool_calls": assistant_calls,
            }));

            for call in &response.tool_calls {
                let result = match gate.allow(&call.name, flow_state) {
                    Ok(()) => executor
                        .execute(&call.name, &call.arguments, &clinic_id, &session_id)
                        .await
                        .unwrap_or_else(|e| json!({ "error": e })),
                    Err(denied) => json!({ "error": denied }),
                };

                request.messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": result.to_string(),
                }));

                // Persist context derived from tool calls so later turns
                // (and the narrowing step) see what the model committed to.
                if matches!(call.name.as_str(), "check_availability" | "book_appointment") {
                    self.persist_tool_constraints(&session_id, &call.arguments).await;
                }
            }

            response = self.generate(&request).await?;
        }

        if turn >= MAX_TOOL_TURNS {
            warn!(max = MAX_TOOL_TURNS, "max tool turns reached");
        }
        Ok(response)
    }

    async fn persist_tool_constraints(&self, session_id: &str, arguments: &serde_json::Value) {
        let service = arguments["service_name"].as_str();
        let doctor_id = arguments["doctor_id"].as_str();
        if service.is_none() && doctor_id.is_none() {
            return;
        }
        let mut constraints = match self.store.get_constraints(session_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not load constraints for tool persistence");
                return;
            }
        };
        if let Some(service) = service {
            constraints.set_desired_service(service);
        }
        if let Some(doctor_id) = doctor_id {
            constraints.desired_doctor_id = Some(doctor_id.to_string());
        }
        if let Err(e) = self.store.save_constraints(session_id, &constraints).await {
            warn!(error = %e, "could not persist tool-derived constraints");
        }
    }

    /// Remove reasoning tags the model may leak into its reply.
    fn clean_response(response: &str) -> String {
        let mut text = response.to_string();
        while let (Some(start), Some(end)) = (text.find("<think>"), text.find("</think>")) {
            if end > start {
                text.replace_range(start..end + "</think>".len(), "");
            } else {
                break;
            }
        }
        if let Some(pos) = text.rfind("</think>") {
            text = text[pos + "</think>".len()..].to_string();
        }
        if let Some(pos) = text.find("<think>") {
            text.truncate(pos);
        }
        // Collapse runs of blank lines left by the removals.
        while text.contains("\n\n\n") {
            text = text.replace("\n\n\n", "\n\n");
        }
        text.trim().to_string()
    }

    /// Timeout fallback: a doctor listing if the user asked about doctors,
    /// else the generic line.
    fn timeout_fallback(ctx: &PipelineContext) -> String {
        let lower = ctx.message.to_lowercase();
        let doctor_query = ["doctor", "доктор", "врач", "médico", "doutor"]
            .iter()
            .any(|w| lower.contains(w));

        if doctor_query && !ctx.clinic_doctors.is_empty() {
            let list = ctx
                .clinic_doctors
                .iter()
                .map(|d| format!("- {}", d.doctor_name))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "{}\n\n{list}",
                templates::doctor_list_header(ctx.detected_language)
            )
        } else {
            templates::generic_fallback(ctx.detected_language).to_string()
        }
    }
}

enum LlmFailure {
    Timeout,
    Provider(String),
}

#[async_trait]
impl PipelineStep for LlmGenerationStep {
    fn name(&self) -> &'static str {
        "llm_generation"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
        let started = Instant::now();

        let inputs = Self::prompt_inputs(ctx);
        let system = self.composer.compose(&inputs, self.tools.is_some());
        let tool_schemas = self
            .tools
            .as_ref()
            .map(|t| t.tool_schemas(ctx.effective_clinic_id()))
            .unwrap_or_default();
        info!(tools = tool_schemas.len(), "invoking LLM");

        let request = LlmRequest {
            system,
            messages: Self::build_messages(ctx),
            tools: tool_schemas,
            temperature: 1.0,
            max_tokens: 300,
        };

        match self.run_with_tools(ctx, request).await {
            Ok(response) => {
                let cleaned = Self::clean_response(&response.content);
                let reply = if cleaned.is_empty() {
                    templates::generic_fallback(ctx.detected_language).to_string()
                } else {
                    cleaned
                };

                // The reply's own language wins; it is what gets persisted.
                ctx.detected_language = detect_language(&reply);
                ctx.session_language = Some(ctx.detected_language.as_str().to_string());

                ctx.llm_metrics.provider = Some(response.provider);
                ctx.llm_metrics.model = Some(response.model);
                ctx.llm_metrics.tokens_input = response.tokens_in;
                ctx.llm_metrics.tokens_output = response.tokens_out;
                ctx.llm_metrics.latency_ms = started.elapsed().as_millis() as u64;
                ctx.response = Some(reply);

                info!(latency_ms = ctx.llm_metrics.latency_ms, "LLM reply generated");
            }
            Err(LlmFailure::Timeout) => {
                warn!("LLM call exceeded timeout, using fallback");
                ctx.response = Some(Self::timeout_fallback(ctx));
                ctx.llm_metrics.error_occurred = true;
                ctx.llm_metrics.error_message = Some("LLM timeout".to_string());
            }
            Err(LlmFailure::Provider(e)) => {
                warn!(error = %e, "LLM generation failed, using fallback");
                ctx.response = Some(templates::generic_fallback(ctx.detected_language).to_string());
                ctx.llm_metrics.error_occurred = true;
                ctx.llm_metrics.error_message = Some(e);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LlmToolCall;
    use crate::testsupport::store;
    use concierge_narrowing::Doctor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<LlmResponse>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, String> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Err("script exhausted".to_string())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        fn tool_schemas(&self, _clinic_id: &str) -> Vec<serde_json::Value> {
            vec![json!({ "name": "check_availability" })]
        }
        async fn execute(
            &self,
            _name: &str,
            _arguments: &serde_json::Value,
            _clinic_id: &str,
            _session_id: &str,
        ) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "slots": ["10:00"] }))
        }
    }

    fn text_response(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            provider: "test".to_string(),
            model: "test-1".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            ..Default::default()
        }
    }

    #[test]
    fn think_tags_are_stripped() {
        let cleaned = LlmGenerationStep::clean_response(
            "<think>the user wants a slot</think>How about 10:00?",
        );
        assert_eq!(cleaned, "How about 10:00?");

        let partial = LlmGenerationStep::clean_response("reasoning...</think>Final answer");
        assert_eq!(partial, "Final answer");

        let open = LlmGenerationStep::clean_response("Answer first<think>then rambling");
        assert_eq!(open, "Answer first");
    }

    #[test]
    fn doctor_query_timeout_fallback_lists_doctors() {
        let mut ctx = PipelineContext::new("which doctor is best?", "1555", "c1", "whatsapp");
        ctx.clinic_doctors = vec![Doctor {
            doctor_id: "d1".to_string(),
            doctor_name: "Dr. Li".to_string(),
        }];
        let fallback = LlmGenerationStep::timeout_fallback(&ctx);
        assert!(fallback.contains("Dr. Li"));

        let generic = PipelineContext::new("how much is it?", "1555", "c1", "whatsapp");
        assert_eq!(
            LlmGenerationStep::timeout_fallback(&generic),
            "I understand. How can I help you today?"
        );
    }

    #[tokio::test]
    async fn tool_loop_executes_and_finishes() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();

        let tool_call = LlmResponse {
            tool_calls: vec![LlmToolCall {
                id: "t1".to_string(),
                name: "check_availability".to_string(),
                arguments: json!({ "service_name": "cleaning" }),
            }],
            provider: "test".to_string(),
            model: "test-1".to_string(),
            ..Default::default()
        };

        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![tool_call, text_response("10:00 is free, book it?")]),
        });
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });

        let step = LlmGenerationStep::new(
            provider,
            Some(executor.clone() as Arc<dyn ToolExecutor>),
            Arc::clone(&store),
            PromptComposer::new(),
        );

        let mut ctx = PipelineContext::new("cleaning tomorrow?", "1555", "c1", "whatsapp");
        ctx.session_id = Some(handle.session.id.clone());
        ctx.session = Some(handle.session.clone());

        assert!(step.execute(&mut ctx).await.unwrap());
        assert_eq!(ctx.response.as_deref(), Some("10:00 is free, book it?"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        // The tool call's service was persisted as a constraint.
        let constraints = store.get_constraints(&handle.session.id).await.unwrap();
        assert_eq!(constraints.desired_service.as_deref(), Some("cleaning"));
    }

    #[tokio::test]
    async fn provider_error_falls_back_not_fails() {
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![]),
        });
        let step = LlmGenerationStep::new(provider, None, store(), PromptComposer::new());

        let mut ctx = PipelineContext::new("hello", "1555", "c1", "whatsapp");
        assert!(step.execute(&mut ctx).await.unwrap());
        assert!(ctx.llm_metrics.error_occurred);
        assert_eq!(
            ctx.response.as_deref(),
            Some("I understand. How can I help you today?")
        );
    }
}
