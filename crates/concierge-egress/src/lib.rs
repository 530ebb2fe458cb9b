//! WhatsApp egress queue-worker.
//!
//! Outbound messages land in a per-instance Redis Stream and are delivered
//! by consumer-group workers with token-bucket rate limiting, bounded
//! retries, and a dead-letter stream. Redis is the only coordinator: the
//! queue survives worker crashes, and pending entries orphaned by a dead
//! consumer are adopted by the next worker's autoclaim pass.

pub mod admin;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod jid;
pub mod limiter;
pub mod pubsub;
pub mod queue;
pub mod streams;
pub mod worker;

pub use client::ProviderClient;
pub use config::EgressConfig;
pub use envelope::QueueMessage;
pub use error::{EgressError, Result};
pub use queue::EgressQueue;
pub use worker::EgressWorker;
