//! Operational controls for the stream queues.
//!
//! These are the recovery levers for stuck queues: consumer-group resets,
//! bulk claims, and a health report with actionable issue tags. The outer
//! layer wires them to authenticated endpoints.

use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{info, instrument};

use concierge_core::types::InstanceName;

use crate::error::Result;
use crate::queue::{dlq_key, stream_key};
use crate::streams::{parse_autoclaim_reply, parse_info_reply, value_to_i64, value_to_string};

/// Queue depth above which the health report raises HIGH_QUEUE_DEPTH.
const HIGH_QUEUE_DEPTH: u64 = 100;
/// DLQ depth above which the health report raises HIGH_DLQ_DEPTH.
const HIGH_DLQ_DEPTH: u64 = 10;
/// A consumer with pending entries idle past this is considered stuck.
const STUCK_IDLE_MS: i64 = 300_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupState {
    pub last_delivered_id: String,
    pub pending: i64,
    pub consumers: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub mode: String,
    pub before: Option<GroupState>,
    pub after: Option<GroupState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHealth {
    pub name: String,
    pub pending: i64,
    pub idle_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub instance: String,
    pub queue_depth: u64,
    pub dlq_depth: u64,
    pub consumers_count: i64,
    pub pending: i64,
    pub last_delivered_id: String,
    pub consumers: Vec<ConsumerHealth>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Admin handle over one Redis connection.
pub struct StreamAdmin {
    conn: ConnectionManager,
    group: String,
}

impl StreamAdmin {
    pub fn new(conn: ConnectionManager, group: &str) -> Self {
        Self {
            conn,
            group: group.to_string(),
        }
    }

    /// Reset the group to `$` — skip the backlog, process new entries only.
    #[instrument(skip(self), fields(%instance))]
    pub async fn reset_to_latest(&self, instance: &InstanceName) -> Result<ResetReport> {
        self.reset_to(instance, "$", "latest").await
    }

    /// Reset the group to `0` — redeliver everything. Relies on enqueue
    /// idempotency to avoid duplicate sends.
    #[instrument(skip(self), fields(%instance))]
    pub async fn reset_to_begin(&self, instance: &InstanceName) -> Result<ResetReport> {
        self.reset_to(instance, "0", "begin").await
    }

    async fn reset_to(&self, instance: &InstanceName, id: &str, mode: &str) -> Result<ResetReport> {
        let before = self.group_state(instance).await?;
        let mut conn = self.conn.clone();
        redis::cmd("XGROUP")
            .arg("SETID")
            .arg(stream_key(instance))
            .arg(&self.group)
            .arg(id)
            .query_async::<()>(&mut conn)
            .await?;
        let after = self.group_state(instance).await?;
        info!(mode, "consumer group reset");
        Ok(ResetReport {
            mode: mode.to_string(),
            before,
            after,
        })
    }

    /// Destroy and recreate the group at `$`. All pending references are
    /// lost; the stream itself is untouched.
    #[instrument(skip(self), fields(%instance))]
    pub async fn destroy_recreate(&self, instance: &InstanceName) -> Result<ResetReport> {
        let before = self.group_state(instance).await?;
        let key = stream_key(instance);
        let mut conn = self.conn.clone();

        let destroy: redis::RedisResult<i64> = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(&key)
            .arg(&self.group)
            .query_async(&mut conn)
            .await;
        if let Err(e) = destroy {
            // Missing group/key is fine — we are recreating anyway.
            let text = e.to_string();
            if !text.contains("NOGROUP") && !text.to_lowercase().contains("no such key") {
                return Err(e.into());
            }
        }

        redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await?;

        let after = self.group_state(instance).await?;
        info!("consumer group destroyed and recreated at tail");
        Ok(ResetReport {
            mode: "recreated".to_string(),
            before,
            after,
        })
    }

    /// Bulk-claim pending entries (any idle time) to the named consumer.
    /// Recovery path for entries orphaned by crashed workers.
    #[instrument(skip(self), fields(%instance, consumer))]
    pub async fn claim_pending_to(
        &self,
        instance: &InstanceName,
        consumer: &str,
    ) -> Result<usize> {
        let mut conn = self.conn.clone();
        let value: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream_key(instance))
            .arg(&self.group)
            .arg(consumer)
            .arg(0)
            .arg("0-0")
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await?;
        let (_, claimed) = parse_autoclaim_reply(&value)?;
        info!(claimed = claimed.len(), "pending entries claimed");
        Ok(claimed.len())
    }

    /// Comprehensive queue health with issue tags and recommendations.
    #[instrument(skip(self), fields(%instance))]
    pub async fn health(&self, instance: &InstanceName) -> Result<HealthReport> {
        let mut conn = self.conn.clone();

        let queue_depth: i64 = redis::cmd("XLEN")
            .arg(stream_key(instance))
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        let dlq_depth: i64 = redis::cmd("XLEN")
            .arg(dlq_key(instance))
            .query_async(&mut conn)
            .await
            .unwrap_or(0);

        let group = self.group_state(instance).await?.unwrap_or_default();
        let consumers = self.consumer_states(instance).await.unwrap_or_default();

        let report = build_health_report(
            instance,
            queue_depth.max(0) as u64,
            dlq_depth.max(0) as u64,
            &group,
            consumers,
        );
        Ok(report)
    }

    async fn group_state(&self, instance: &InstanceName) -> Result<Option<GroupState>> {
        let mut conn = self.conn.clone();
        let value: redis::RedisResult<redis::Value> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream_key(instance))
            .query_async(&mut conn)
            .await;
        let Ok(value) = value else {
            return Ok(None);
        };
        let state = parse_info_reply(&value).into_iter().find_map(|row| {
            let name = row.get("name").and_then(value_to_string)?;
            if name != self.group {
                return None;
            }
            Some(GroupState {
                last_delivered_id: row
                    .get("last-delivered-id")
                    .and_then(value_to_string)
                    .unwrap_or_else(|| "0-0".to_string()),
                pending: row.get("pending").and_then(value_to_i64).unwrap_or(0),
                consumers: row.get("consumers").and_then(value_to_i64).unwrap_or(0),
            })
        });
        Ok(state)
    }

    async fn consumer_states(&self, instance: &InstanceName) -> Result<Vec<ConsumerHealth>> {
        let mut conn = self.conn.clone();
        let value: redis::RedisResult<redis::Value> = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream_key(instance))
            .arg(&self.group)
            .query_async(&mut conn)
            .await;
        let Ok(value) = value else {
            return Ok(Vec::new());
        };
        Ok(parse_info_reply(&value)
            .into_iter()
            .filter_map(|row| {
                Some(ConsumerHealth {
                    name: row.get("name").and_then(value_to_string)?,
                    pending: row.get("pending").and_then(value_to_i64).unwrap_or(0),
                    idle_ms: row.get("idle").and_then(value_to_i64).unwrap_or(0),
                })
            })
            .collect())
    }
}

/// Pure assembly of the health verdict — split out for tests.
fn build_health_report(
    instance: &InstanceName,
    queue_depth: u64,
    dlq_depth: u64,
    group: &GroupState,
    consumers: Vec<ConsumerHealth>,
) -> HealthReport {
    let mut issues = Vec::new();

    if group.consumers == 0 {
        issues.push("NO_ACTIVE_CONSUMERS".to_string());
    }
    if queue_depth > HIGH_QUEUE_DEPTH {
        issues.push("HIGH_QUEUE_DEPTH".to_string());
    }
    if group.pending > 0 && group.consumers == 0 {
        issues.push("PENDING_WITHOUT_CONSUMER".to_string());
    }
    if dlq_depth > HIGH_DLQ_DEPTH {
        issues.push("HIGH_DLQ_DEPTH".to_string());
    }
    for consumer in &consumers {
        if consumer.pending > 0 && consumer.idle_ms > STUCK_IDLE_MS {
            issues.push(format!("STUCK_CONSUMER_{}", consumer.name));
        }
    }

    let status = if issues.is_empty() {
        "healthy"
    } else if group.consumers > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    let mut recommendations = Vec::new();
    if issues.iter().any(|i| i == "NO_ACTIVE_CONSUMERS") {
        recommendations.push("Start or restart the worker process".to_string());
    }
    if issues.iter().any(|i| i == "HIGH_QUEUE_DEPTH") {
        recommendations.push("Scale up workers or investigate slow processing".to_string());
    }
    if issues.iter().any(|i| i == "PENDING_WITHOUT_CONSUMER") {
        recommendations.push("Bulk-claim pending entries to a live consumer".to_string());
    }
    if issues.iter().any(|i| i == "HIGH_DLQ_DEPTH") {
        recommendations.push("Investigate DLQ entries for recurring failures".to_string());
    }
    if issues.iter().any(|i| i.starts_with("STUCK_CONSUMER")) {
        recommendations.push("Restart the stuck worker or bulk-claim its pending".to_string());
    }

    HealthReport {
        status: status.to_string(),
        instance: instance.to_string(),
        queue_depth,
        dlq_depth,
        consumers_count: group.consumers,
        pending: group.pending,
        last_delivered_id: group.last_delivered_id.clone(),
        consumers,
        issues,
        recommendations,
    }
}
