use async_trait::async_trait;
use thiserror::Error;

use crate::context::PipelineContext;

/// A recoverable step failure carrying a pre-step context snapshot.
#[derive(Debug, Error)]
#[error("[{step_name}] {message}")]
pub struct StepError {
    pub step_name: String,
    pub message: String,
    pub context_snapshot: serde_json::Value,
}

impl StepError {
    pub fn new(step_name: &str, message: impl Into<String>) -> Self {
        Self {
            step_name: step_name.to_string(),
            message: message.into(),
            context_snapshot: serde_json::Value::Null,
        }
    }

    pub fn with_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.context_snapshot = snapshot;
        self
    }
}

/// One stage of the pipeline.
///
/// A step mutates the context in place and says whether the chain should
/// continue. `Ok(false)` stops the pipeline with whatever `ctx.response`
/// holds; `Err` makes the orchestrator emit a localized fallback.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Lowercase, underscore-separated identifier for logs and timings.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<bool, StepError>;
}
