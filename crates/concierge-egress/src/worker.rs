use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use concierge_core::types::InstanceName;

use crate::client::ProviderClient;
use crate::config::EgressConfig;
use crate::envelope::QueueMessage;
use crate::error::Result;
use crate::limiter::TokenBucket;
use crate::queue::{dlq_key, ensure_group, stream_key};
use crate::streams::{parse_autoclaim_reply, parse_read_reply, StreamEntry};

/// Heartbeat log cadence.
const HEARTBEAT: Duration = Duration::from_secs(300);

/// Exponential backoff with ±25% jitter.
///
/// `min(cap, base · 2^(attempts-1))`, jittered. The jitter source is the
/// subsecond clock — good enough for retry spreading without a rand
/// dependency.
pub fn exponential_backoff(attempts: u32, base: f64, cap: f64) -> f64 {
    let exp = attempts.saturating_sub(1).min(16);
    let delay = (base * 2f64.powi(exp as i32)).min(cap);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter = 0.75 + (nanos % 501) as f64 / 1000.0; // 0.75 … 1.25
    delay * jitter
}

struct WorkerInner {
    instance: InstanceName,
    consumer_name: String,
    conn: ConnectionManager,
    limiter: TokenBucket,
    client: ProviderClient,
    config: EgressConfig,
    semaphore: Semaphore,
    processed: AtomicU64,
    failed: AtomicU64,
    /// Connection-state memo for the non-optimistic send path.
    /// None = never checked.
    conn_memo: Mutex<Option<(Instant, bool)>>,
}

/// Per-instance consumer-group worker.
///
/// One worker owns one consumer name inside the shared group. Each loop
/// iteration first adopts pending entries idle past the claim threshold
/// (crashed-worker recovery), then reads new entries, then processes the
/// batch with bounded in-flight concurrency.
pub struct EgressWorker {
    inner: Arc<WorkerInner>,
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub instance: String,
    pub consumer_name: String,
    pub processed: u64,
    pub failed: u64,
}

impl EgressWorker {
    pub fn new(
        conn: ConnectionManager,
        limiter: TokenBucket,
        client: ProviderClient,
        instance: InstanceName,
        config: EgressConfig,
        consumer_name: Option<String>,
    ) -> Self {
        let consumer_name = consumer_name.unwrap_or_else(|| {
            format!(
                "worker-{}-{}",
                chrono::Utc::now().timestamp(),
                std::process::id()
            )
        });
        let semaphore = Semaphore::new(config.worker_concurrency);
        Self {
            inner: Arc::new(WorkerInner {
                instance,
                consumer_name,
                conn,
                limiter,
                client,
                config,
                semaphore,
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                conn_memo: Mutex::new(None),
            }),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            instance: self.inner.instance.to_string(),
            consumer_name: self.inner.consumer_name.clone(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Main worker loop. Returns when `shutdown` flips to true; in-flight
    /// sends are awaited before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let inner = &self.inner;
        let key = stream_key(&inner.instance);

        info!(
            instance = %inner.instance,
            consumer = %inner.consumer_name,
            group = %inner.config.consumer_group,
            rate = inner.config.tokens_per_second,
            max_deliveries = inner.config.max_deliveries,
            "egress worker starting"
        );

        {
            let mut conn = inner.conn.clone();
            if let Err(e) = ensure_group(&mut conn, &inner.instance, &inner.config.consumer_group).await {
                error!(error = %e, "failed to ensure consumer group on start");
            }
            // No-op read registers the consumer so it shows in XINFO CONSUMERS.
            let _: redis::RedisResult<redis::Value> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&inner.config.consumer_group)
                .arg(&inner.consumer_name)
                .arg("COUNT")
                .arg(0)
                .arg("BLOCK")
                .arg(1)
                .arg("STREAMS")
                .arg(&key)
                .arg(">")
                .query_async(&mut conn)
                .await;
        }

        // The autoclaim cursor is per-worker, per-process; restart from 0-0.
        let mut cursor = "0-0".to_string();
        let mut last_heartbeat = Instant::now();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_heartbeat.elapsed() >= HEARTBEAT {
                info!(
                    processed = inner.processed.load(Ordering::Relaxed),
                    failed = inner.failed.load(Ordering::Relaxed),
                    "worker heartbeat"
                );
                last_heartbeat = Instant::now();
            }

            // Drain finished sends without blocking.
            while tasks.try_join_next().is_some() {}

            let entries = match self.fetch_batch(&key, &mut cursor).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "redis error in worker loop, re-ensuring group");
                    let mut conn = inner.conn.clone();
                    let _ =
                        ensure_group(&mut conn, &inner.instance, &inner.config.consumer_group).await;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                // Idle sleep with jitter so workers don't poll in lockstep.
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.subsec_nanos())
                    .unwrap_or(0);
                let factor = 0.9 + (nanos % 401) as f64 / 1000.0; // 0.9 … 1.3
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(inner.config.idle_sleep_base * factor)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            info!(count = entries.len(), "processing message batch");
            for (entry_id, fields) in entries {
                let inner = Arc::clone(&self.inner);
                tasks.spawn(async move {
                    let _permit = inner.semaphore.acquire().await.expect("semaphore open");
                    inner.handle_entry(&entry_id, fields).await;
                });
            }
        }

        // Graceful shutdown: await the in-flight sends bounded by the
        // semaphore, then report.
        while tasks.join_next().await.is_some() {}
        info!(
            processed = inner.processed.load(Ordering::Relaxed),
            failed = inner.failed.load(Ordering::Relaxed),
            "worker stopped"
        );
    }

    /// One fetch pass: adopt orphaned pending entries first, then read new.
    async fn fetch_batch(&self, key: &str, cursor: &mut String) -> Result<Vec<StreamEntry>> {
        let inner = &self.inner;
        let mut conn = inner.conn.clone();

        // 1) XAUTOCLAIM adopts entries pending on dead/idle consumers.
        let autoclaim: redis::RedisResult<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(&inner.config.consumer_group)
            .arg(&inner.consumer_name)
            .arg(inner.config.claim_idle_ms)
            .arg(cursor.as_str())
            .arg("COUNT")
            .arg(inner.config.read_count)
            .query_async(&mut conn)
            .await;

        match autoclaim {
            Ok(value) => {
                if let Ok((next_cursor, claimed)) = parse_autoclaim_reply(&value) {
                    *cursor = next_cursor;
                    if !claimed.is_empty() {
                        debug!(count = claimed.len(), "adopted pending entries");
                        return Ok(claimed);
                    }
                }
            }
            // XAUTOCLAIM may be unavailable (old server); treat as no claims.
            Err(e) => debug!(error = %e, "XAUTOCLAIM unavailable or failed"),
        }

        // 2) Read NEW messages only.
        let value: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&inner.config.consumer_group)
            .arg(&inner.consumer_name)
            .arg("COUNT")
            .arg(inner.config.read_count)
            .arg("BLOCK")
            .arg(inner.config.read_block_ms)
            .arg("STREAMS")
            .arg(key)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        Ok(parse_read_reply(&value))
    }
}

impl WorkerInner {
    async fn handle_entry(&self, entry_id: &str, fields: HashMap<String, String>) {
        let raw = fields.get("payload").map(String::as_str).unwrap_or("{}");
        let message: QueueMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                // Malformed payloads are never retried: dead-letter and ack.
                error!(entry_id, error = %e, "failed to parse stream entry");
                let dead = serde_json::json!({
                    "error": format!("json_decode_error: {e}"),
                    "raw": raw,
                });
                self.push_dlq(&dead).await;
                self.ack_del(entry_id).await;
                return;
            }
        };

        if let Err(e) = self.process_message(entry_id, message).await {
            error!(entry_id, error = %e, "error processing message");
            let dead = serde_json::json!({
                "error": format!("processing_error: {e}"),
                "raw": raw,
            });
            self.push_dlq(&dead).await;
            self.ack_del(entry_id).await;
        }
    }

    async fn process_message(&self, entry_id: &str, message: QueueMessage) -> Result<()> {
        let attempts = message.attempts;
        info!(
            message_id = %message.message_id,
            attempt = attempts + 1,
            max = self.config.max_deliveries,
            "processing message"
        );

        self.limiter.wait_for_token().await?;

        if !self.config.optimistic_send && !self.connection_ok().await {
            warn!(instance = %self.instance, "provider not connected, scheduling retry");
            self.retry_message(message, entry_id, attempts + 1).await;
            return Ok(());
        }

        let outcome = self
            .client
            .send_text(&self.instance, &message.to, &message.text)
            .await;

        if outcome.success {
            info!(message_id = %message.message_id, "message sent");
            self.processed.fetch_add(1, Ordering::Relaxed);
            self.ack_del(entry_id).await;
        } else {
            warn!(
                message_id = %message.message_id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "send failed"
            );
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.retry_message(message, entry_id, attempts + 1).await;
        }
        Ok(())
    }

    /// Cached connection check, refreshed at most every `check_conn_ttl`.
    async fn connection_ok(&self) -> bool {
        let mut memo = self.conn_memo.lock().await;
        let stale = memo
            .map(|(at, _)| at.elapsed().as_secs_f64() >= self.config.check_conn_ttl)
            .unwrap_or(true);
        if stale {
            let ok = self.client.is_connected(&self.instance).await;
            *memo = Some((Instant::now(), ok));
        }
        memo.map(|(_, ok)| ok).unwrap_or(false)
    }

    /// Retry with backoff or dead-letter after max deliveries.
    ///
    /// The current entry is acked+deleted BEFORE the re-append so pending
    /// never accumulates; the retried message becomes a fresh tail entry.
    async fn retry_message(&self, mut message: QueueMessage, entry_id: &str, attempts: u32) {
        if attempts >= self.config.max_deliveries {
            error!(
                message_id = %message.message_id,
                max = self.config.max_deliveries,
                "max deliveries exceeded, moving to DLQ"
            );
            let dead = message.into_dead_letter("max_deliveries_exceeded");
            self.push_dlq(&dead).await;
            self.ack_del(entry_id).await;
            return;
        }

        let delay = exponential_backoff(attempts, self.config.base_backoff, self.config.max_backoff);
        info!(
            message_id = %message.message_id,
            delay_secs = format!("{delay:.1}"),
            attempt = attempts,
            "retrying message"
        );

        self.ack_del(entry_id).await;
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;

        message.attempts = attempts;
        let mut conn = self.conn.clone();
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to serialize retry payload");
                return;
            }
        };
        let requeued: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(stream_key(&self.instance))
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await;
        match requeued {
            Ok(new_id) => debug!(message_id = %message.message_id, %new_id, "message requeued"),
            Err(e) => error!(error = %e, "failed to requeue message"),
        }
    }

    async fn push_dlq(&self, payload: &serde_json::Value) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(dlq_key(&self.instance))
            .arg("*")
            .arg("payload")
            .arg(payload.to_string())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            error!(error = %e, "failed to append to DLQ");
        }
    }

    async fn ack_del(&self, entry_id: &str) {
        let mut conn = self.conn.clone();
        let key = stream_key(&self.instance);
        let ack: redis::RedisResult<i64> = redis::cmd("XACK")
            .arg(&key)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = ack {
            warn!(entry_id, error = %e, "XACK failed");
        }
        let del: redis::RedisResult<i64> = redis::cmd("XDEL")
            .arg(&key)
            .arg(entry_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = del {
            warn!(entry_id, error = %e, "XDEL failed");
        }
    }
}
