//! Whole-pipeline tests: the fixed step order wired against in-memory
//! fakes, exercising the short-circuit paths end to end.

use std::sync::Arc;
use std::time::Duration;

use concierge_core::types::Language;
use concierge_prompt::PromptComposer;
use concierge_store::{ControlMode, ConversationStore, SessionPatch};

use crate::context::PipelineContext;
use crate::fastpath::{FastPath, FastPathOutcome, FastPathRequest};
use crate::orchestrator::MessagePipeline;
use crate::steps::{
    ConstraintEnforcementStep, ContextHydrationStep, ControlModeGateStep, DelegationStep,
    EscalationCheckStep, LlmGenerationStep, NarrowingStep, PostProcessingStep, RoutingStep,
    SessionManagementStep,
};
use crate::testsupport::{FakeDirectory, FixedProvider, RecordingQueue};

struct Harness {
    pipeline: MessagePipeline,
    store: Arc<dyn ConversationStore>,
    queue: Arc<RecordingQueue>,
}

fn harness(reply: &'static str) -> Harness {
    let store: Arc<dyn ConversationStore> =
        Arc::new(concierge_store::SqliteStore::in_memory().unwrap());
    let directory = Arc::new(FakeDirectory::default());
    let queue = Arc::new(RecordingQueue::default());
    let provider = Arc::new(FixedProvider(reply));

    let pipeline = MessagePipeline::new(vec![
        Box::new(SessionManagementStep::new(
            Arc::clone(&store),
            directory.clone(),
            None,
        )),
        Box::new(ControlModeGateStep::new(Arc::clone(&store))),
        Box::new(ContextHydrationStep::new(
            Arc::clone(&store),
            directory.clone(),
        )),
        Box::new(EscalationCheckStep::new(
            Arc::clone(&store),
            queue.clone(),
            vec!["19990001111".to_string()],
        )),
        Box::new(RoutingStep::new()),
        Box::new(ConstraintEnforcementStep::new(Arc::clone(&store))),
        Box::new(NarrowingStep::new(directory.clone(), "service_first")),
        Box::new(DelegationStep::new(None)),
        Box::new(LlmGenerationStep::new(
            provider,
            None,
            Arc::clone(&store),
            PromptComposer::new(),
        )),
        Box::new(PostProcessingStep::new(Arc::clone(&store), queue.clone())),
    ]);

    Harness {
        pipeline,
        store,
        queue,
    }
}

#[tokio::test]
async fn full_turn_replies_and_enqueues_once() {
    let h = harness("We have a cleaning slot at 10:00 tomorrow.");
    let ctx = PipelineContext::new("I'd like a cleaning", "15551234567", "c1", "whatsapp");

    let result = h.pipeline.execute(ctx).await;

    assert_eq!(
        result.response.as_deref(),
        Some("We have a cleaning slot at 10:00 tomorrow.")
    );
    // Every step ran and was timed.
    for step in [
        "session_management",
        "control_mode_gate",
        "context_hydration",
        "escalation_check",
        "routing",
        "constraint_enforcement",
        "narrowing",
        "delegation",
        "llm_generation",
        "post_processing",
        "_total",
    ] {
        assert!(result.step_timings.contains_key(step), "missing timing: {step}");
    }

    let sent = h.queue.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "inst-a");
    assert_eq!(sent[0].1, "15551234567");
}

#[tokio::test]
async fn meta_reset_stops_at_constraint_enforcement() {
    let h = harness("never used");
    let mut ctx = PipelineContext::new(
        "давай начнём сначала",
        "15551234567",
        "c1",
        "whatsapp",
    );
    ctx.session_language = Some("ru".to_string());

    let result = h.pipeline.execute(ctx).await;

    assert!(result
        .response
        .as_deref()
        .unwrap()
        .starts_with("Понял, начинаем с чистого листа!"));
    assert_eq!(result.detected_language, Language::Ru);
    assert!(result.step_timings.contains_key("constraint_enforcement"));
    assert!(!result.step_timings.contains_key("narrowing"));
    assert!(!result.step_timings.contains_key("llm_generation"));

    // All constraints are gone.
    let session_id = result.session_id.unwrap();
    assert!(h.store.get_constraints(&session_id).await.unwrap().is_empty());

    // The reset confirmation was stored (fire-and-forget — allow it to land).
    tokio::time::sleep(Duration::from_millis(100)).await;
    let history = h
        .store
        .get_conversation_history("15551234567", "c1", 10, false)
        .await
        .unwrap();
    assert!(history
        .iter()
        .any(|m| m.content.starts_with("Понял, начинаем")));
}

#[tokio::test]
async fn human_control_mode_silences_the_bot() {
    let h = harness("never used");

    // First contact creates the session; flip it to human control.
    let handle = h
        .store
        .get_or_create_session("15551234567", "c1", "whatsapp")
        .await
        .unwrap();
    h.store
        .update_session(
            &handle.session.id,
            SessionPatch {
                control_mode: Some(ControlMode::Human),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let ctx = PipelineContext::new("hello?", "15551234567", "c1", "whatsapp");
    let result = h.pipeline.execute(ctx).await;

    assert_eq!(result.response.as_deref(), Some(""));
    assert_eq!(result.response_metadata["hitl_gated"], serde_json::json!(true));
    assert!(!result.step_timings.contains_key("llm_generation"));

    // Unread bumped exactly once; nothing queued outbound.
    let session = h
        .store
        .get_session(&handle.session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.unread_for_human_count, 1);
    assert!(h.queue.sent.lock().await.is_empty());
}

#[tokio::test]
async fn greeting_fast_path_skips_the_llm() {
    std::env::set_var("FAST_PATH_ENABLED", "1");
    concierge_core::flags::reload();

    let store: Arc<dyn ConversationStore> =
        Arc::new(concierge_store::SqliteStore::in_memory().unwrap());
    let queue = Arc::new(RecordingQueue::default());
    let fast_path = FastPath::new(
        Arc::clone(&store),
        queue.clone(),
        Arc::new(FakeDirectory::default()),
        vec![],
    );

    let handle = store
        .get_or_create_session("15551234567", "c1", "whatsapp")
        .await
        .unwrap();

    let outcome = fast_path
        .try_handle(&FastPathRequest {
            session_id: &handle.session.id,
            message: "Hello",
            from_phone: "15551234567",
            clinic_id: "c1",
            instance: Some("inst-a"),
        })
        .await;

    let FastPathOutcome::Handled(reply) = outcome else {
        panic!("greeting should be fast-handled");
    };
    assert_eq!(
        reply.response,
        "Hello! How can I help you today? Would you like to schedule an appointment?"
    );
    assert_eq!(reply.metadata["intent"], "greeting");
    assert_eq!(reply.metadata["fast_path"], serde_json::json!(true));

    // Both turns were persisted (fire-and-forget).
    tokio::time::sleep(Duration::from_millis(100)).await;
    let history = store
        .get_conversation_history("15551234567", "c1", 10, false)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "Hello");
}
