use std::time::Instant;

use serde_json::json;
use tracing::{error, info};

use concierge_intent::templates;

use crate::context::PipelineContext;
use crate::step::PipelineStep;

/// Runs the ordered steps over one shared mutable context.
///
/// Each step is timed; `step_timings` gains one entry per executed step
/// plus `_total`. On failure the user sees a localized fallback, never the
/// internal error — that goes to `response_metadata` and the logs.
pub struct MessagePipeline {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl MessagePipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self { steps }
    }

    pub async fn execute(&self, mut ctx: PipelineContext) -> PipelineContext {
        let total_start = Instant::now();

        for step in &self.steps {
            let step_start = Instant::now();
            let snapshot = ctx.snapshot(); // state BEFORE the risky step

            match step.execute(&mut ctx).await {
                Ok(should_continue) => {
                    let elapsed_ms = step_start.elapsed().as_secs_f64() * 1000.0;
                    ctx.step_timings.insert(step.name().to_string(), elapsed_ms);
                    info!(step = step.name(), elapsed_ms = format!("{elapsed_ms:.1}"), "step complete");

                    if !should_continue {
                        info!(
                            step = step.name(),
                            response_ready = ctx.response.is_some(),
                            "pipeline stopped early"
                        );
                        break;
                    }
                }
                Err(e) => {
                    let elapsed_ms = step_start.elapsed().as_secs_f64() * 1000.0;
                    ctx.step_timings.insert(step.name().to_string(), elapsed_ms);

                    let snapshot = if e.context_snapshot.is_null() {
                        snapshot
                    } else {
                        e.context_snapshot.clone()
                    };
                    error!(
                        step = %e.step_name,
                        error = %e.message,
                        correlation_id = ctx.correlation_id.as_deref().unwrap_or(""),
                        %snapshot,
                        "step failed"
                    );

                    ctx.response = Some(templates::pipeline_error(ctx.detected_language).to_string());
                    merge_metadata(
                        &mut ctx.response_metadata,
                        json!({ "error": e.message, "failed_step": e.step_name }),
                    );
                    break;
                }
            }
        }

        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        ctx.step_timings.insert("_total".to_string(), total_ms);
        info!(
            total_ms = format!("{total_ms:.1}"),
            steps = ctx.step_timings.len() - 1,
            "pipeline complete"
        );

        ctx
    }
}

pub(crate) fn merge_metadata(target: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(target_map), Some(extra_map)) = (target.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            target_map.insert(k.clone(), v.clone());
        }
    } else {
        *target = extra;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{PipelineStep, StepError};
    use async_trait::async_trait;
    use concierge_core::types::Language;

    struct SetResponse {
        name: &'static str,
        response: Option<&'static str>,
        stop: bool,
    }

    #[async_trait]
    impl PipelineStep for SetResponse {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError> {
            if let Some(r) = self.response {
                ctx.response = Some(r.to_string());
            }
            Ok(!self.stop)
        }
    }

    struct Failing;

    #[async_trait]
    impl PipelineStep for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn execute(&self, _ctx: &mut PipelineContext) -> Result<bool, StepError> {
            Err(StepError::new("failing", "boom"))
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new("hi", "15551234567", "c1", "whatsapp")
    }

    #[tokio::test]
    async fn timings_include_every_ran_step_plus_total() {
        let pipeline = MessagePipeline::new(vec![
            Box::new(SetResponse { name: "a", response: None, stop: false }),
            Box::new(SetResponse { name: "b", response: Some("done"), stop: false }),
        ]);
        let result = pipeline.execute(ctx()).await;
        assert!(result.step_timings.contains_key("a"));
        assert!(result.step_timings.contains_key("b"));
        assert!(result.step_timings.contains_key("_total"));
        assert_eq!(result.response.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn early_stop_skips_later_steps() {
        let pipeline = MessagePipeline::new(vec![
            Box::new(SetResponse { name: "first", response: Some("early"), stop: true }),
            Box::new(SetResponse { name: "second", response: Some("late"), stop: false }),
        ]);
        let result = pipeline.execute(ctx()).await;
        assert_eq!(result.response.as_deref(), Some("early"));
        assert!(!result.step_timings.contains_key("second"));
    }

    #[tokio::test]
    async fn failure_yields_localized_fallback() {
        let pipeline = MessagePipeline::new(vec![
            Box::new(SetResponse { name: "a", response: None, stop: false }),
            Box::new(Failing),
            Box::new(SetResponse { name: "never", response: Some("nope"), stop: false }),
        ]);
        let mut input = ctx();
        input.detected_language = Language::Ru;
        let result = pipeline.execute(input).await;

        assert_eq!(
            result.response.as_deref(),
            Some("Извините, произошла ошибка. Пожалуйста, попробуйте снова.")
        );
        assert_eq!(result.response_metadata["failed_step"], "failing");
        assert_eq!(result.response_metadata["error"], "boom");
        assert!(!result.step_timings.contains_key("never"));
    }
}
