//! Background follow-up engine.
//!
//! When the assistant promises out-of-band work, post-processing stamps the
//! session with `scheduled_followup_at`. This engine polls for sessions
//! whose stamp is due, flips them to `agent_turn`, and emits them on a
//! channel so the host can re-wake the conversation.

pub mod engine;

pub use engine::{FollowupEngine, FollowupEvent};
