//! Redis-backed token bucket, one per tenant instance.
//!
//! Tokens refill at a constant rate up to a cap; each send consumes one.
//! Consumption is an optimistic WATCH/MULTI/EXEC transaction so workers on
//! different hosts share one budget. The bucket runs on its own dedicated
//! connection: WATCH state is connection-scoped and must not be multiplexed
//! with the worker's stream reads.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use concierge_core::types::InstanceName;

use crate::error::Result;

pub struct TokenBucket {
    conn: Mutex<MultiplexedConnection>,
    tokens_per_second: f64,
    capacity: u32,
    bucket_key: String,
    timestamp_key: String,
    instance: InstanceName,
}

impl TokenBucket {
    pub fn new(
        conn: MultiplexedConnection,
        instance: InstanceName,
        tokens_per_second: f64,
        capacity: u32,
    ) -> Self {
        let bucket_key = format!("wa:{instance}:bucket");
        let timestamp_key = format!("wa:{instance}:bucket:ts");
        Self {
            conn: Mutex::new(conn),
            tokens_per_second,
            capacity,
            bucket_key,
            timestamp_key,
            instance,
        }
    }

    pub async fn connect(
        redis_url: &str,
        instance: InstanceName,
        tokens_per_second: f64,
        capacity: u32,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn, instance, tokens_per_second, capacity))
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Refill tokens for elapsed time, capped at capacity. A missing
    /// timestamp initialises the bucket full.
    async fn refill(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let now = Self::now();
        let last: Option<String> = redis::cmd("GET")
            .arg(&self.timestamp_key)
            .query_async(conn)
            .await?;

        let Some(last) = last.and_then(|v| v.parse::<f64>().ok()) else {
            redis::cmd("SET")
                .arg(&self.timestamp_key)
                .arg(now.to_string())
                .query_async::<()>(conn)
                .await?;
            redis::cmd("SET")
                .arg(&self.bucket_key)
                .arg(self.capacity)
                .query_async::<()>(conn)
                .await?;
            debug!(instance = %self.instance, "token bucket initialised");
            return Ok(());
        };

        let elapsed = (now - last).max(0.0);
        let tokens_to_add = (elapsed * self.tokens_per_second).floor() as i64;
        if tokens_to_add > 0 {
            redis::cmd("SET")
                .arg(&self.timestamp_key)
                .arg(now.to_string())
                .query_async::<()>(conn)
                .await?;
            let current: Option<i64> = redis::cmd("GET")
                .arg(&self.bucket_key)
                .query_async(conn)
                .await?;
            let new_count = (current.unwrap_or(0) + tokens_to_add).min(self.capacity as i64);
            redis::cmd("SET")
                .arg(&self.bucket_key)
                .arg(new_count)
                .query_async::<()>(conn)
                .await?;
            debug!(instance = %self.instance, added = tokens_to_add, now_at = new_count, "bucket refilled");
        }
        Ok(())
    }

    /// Try to take one token. False when the bucket is empty or another
    /// client won the optimistic transaction.
    pub async fn take_token(&self) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        self.refill(&mut *conn).await?;

        redis::cmd("WATCH")
            .arg(&self.bucket_key)
            .query_async::<()>(&mut *conn)
            .await?;

        let current: Option<i64> = redis::cmd("GET")
            .arg(&self.bucket_key)
            .query_async(&mut *conn)
            .await?;
        if current.unwrap_or(0) <= 0 {
            redis::cmd("UNWATCH").query_async::<()>(&mut *conn).await?;
            return Ok(false);
        }

        // EXEC returns nil when the watched key changed under us.
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DECR").arg(&self.bucket_key);
        let executed: Option<(i64,)> = pipe.query_async(&mut *conn).await?;
        Ok(executed.is_some())
    }

    /// Block until a token is available, backing off exponentially between
    /// polls (capped at 1s). A long wait resets to moderate backoff so the
    /// caller keeps probing.
    pub async fn wait_for_token(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        while !self.take_token().await? {
            let delay = (0.1 * 2f64.powi(attempt as i32)).min(1.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            attempt += 1;
            if attempt >= 10 {
                warn!(instance = %self.instance, "long wait for rate-limit token");
                attempt = 5;
            }
        }
        debug!(instance = %self.instance, attempts = attempt, "token acquired");
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
