//! Queue-worker tunables, overridable via WA_* environment variables.

use concierge_core::config::{env_f64, env_u64};

/// Pub/sub channel announcing new tenant instances.
pub const INSTANCE_ADDED_CHANNEL: &str = "wa:instances:added";
/// Pub/sub channel announcing removed/disabled instances.
pub const INSTANCE_REMOVED_CHANNEL: &str = "wa:instances:removed";

/// Idempotency key TTL — the queue will not duplicate a message id within
/// this window.
pub const IDEMPOTENCY_TTL_SECS: u64 = 86_400;
/// Streams are trimmed to roughly this many entries on insert.
pub const STREAM_MAXLEN: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct EgressConfig {
    pub consumer_group: String,
    pub max_deliveries: u32,
    /// Base retry backoff, seconds.
    pub base_backoff: f64,
    /// Retry backoff cap, seconds.
    pub max_backoff: f64,
    pub tokens_per_second: f64,
    pub bucket_capacity: u32,
    /// XAUTOCLAIM minimum idle time, milliseconds.
    pub claim_idle_ms: u64,
    /// Messages per XREADGROUP batch.
    pub read_count: u64,
    /// XREADGROUP block timeout, milliseconds.
    pub read_block_ms: u64,
    /// Max in-flight sends inside one worker.
    pub worker_concurrency: usize,
    /// Skip the connection-state check before sending.
    pub optimistic_send: bool,
    /// Connection-state cache TTL, seconds.
    pub check_conn_ttl: f64,
    /// Idle sleep between empty reads, seconds.
    pub idle_sleep_base: f64,
}

impl EgressConfig {
    /// Resolve from the environment with the documented defaults.
    pub fn from_env() -> Self {
        Self {
            consumer_group: std::env::var("WA_CONSUMER_GROUP")
                .unwrap_or_else(|_| "wa_workers".to_string()),
            max_deliveries: env_u64("WA_MAX_DELIVERIES", 5) as u32,
            base_backoff: env_f64("WA_BASE_BACKOFF", 2.0),
            max_backoff: env_f64("WA_MAX_BACKOFF", 60.0),
            tokens_per_second: env_f64("WA_TOKENS_PER_SECOND", 1.0),
            bucket_capacity: env_u64("WA_BUCKET_CAPACITY", 5) as u32,
            claim_idle_ms: env_u64("WA_STREAM_CLAIM_IDLE_MS", 15_000),
            read_count: env_u64("WA_READ_COUNT", 32),
            read_block_ms: env_u64("WA_READ_BLOCK_MS", 250),
            worker_concurrency: env_u64("WA_WORKER_CONCURRENCY", 4) as usize,
            optimistic_send: std::env::var("WA_OPTIMISTIC_SEND").as_deref() != Ok("0"),
            check_conn_ttl: env_f64("WA_CHECK_CONN_TTL", 3.0),
            idle_sleep_base: env_f64("WA_IDLE_SLEEP_BASE", 0.05),
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            consumer_group: "wa_workers".to_string(),
            max_deliveries: 5,
            base_backoff: 2.0,
            max_backoff: 60.0,
            tokens_per_second: 1.0,
            bucket_capacity: 5,
            claim_idle_ms: 15_000,
            read_count: 32,
            read_block_ms: 250,
            worker_concurrency: 4,
            optimistic_send: true,
            check_conn_ttl: 3.0,
            idle_sleep_base: 0.05,
        }
    }
}
