use redis::aio::ConnectionManager;
use tracing::{debug, info, instrument};

use concierge_core::types::InstanceName;

use crate::config::{EgressConfig, IDEMPOTENCY_TTL_SECS, STREAM_MAXLEN};
use crate::envelope::QueueMessage;
use crate::error::Result;

pub fn stream_key(instance: &InstanceName) -> String {
    format!("wa:{instance}:stream")
}

pub fn dlq_key(instance: &InstanceName) -> String {
    format!("wa:{instance}:dlq")
}

pub fn idempotency_key(message_id: &str) -> String {
    format!("wa:msg:{message_id}")
}

/// Create the consumer group at `$` (tail) if it does not exist.
///
/// Reading from the tail prevents the orphaned-entry problem: messages
/// added before group creation are never considered already-delivered.
pub async fn ensure_group(
    conn: &mut ConnectionManager,
    instance: &InstanceName,
    group: &str,
) -> Result<()> {
    let reply: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream_key(instance))
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match reply {
        Ok(()) => {
            info!(%instance, group, "created consumer group at tail");
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Producer-side queue handle.
#[derive(Clone)]
pub struct EgressQueue {
    conn: ConnectionManager,
    config: EgressConfig,
}

impl EgressQueue {
    pub fn new(conn: ConnectionManager, config: EgressConfig) -> Self {
        Self { conn, config }
    }

    pub async fn connect(redis_url: &str, config: EgressConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, config))
    }

    /// Queue a message for delivery. Returns immediately after the XADD.
    ///
    /// Idempotent on `message_id`: a SET NX with 24h TTL guards the stream,
    /// so double enqueues within the window return success without a second
    /// entry.
    #[instrument(skip(self, text, metadata), fields(%instance))]
    pub async fn enqueue(
        &self,
        instance: &InstanceName,
        to: &str,
        text: &str,
        message_id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        let message = QueueMessage::new(to, text, message_id, metadata);
        let mut conn = self.conn.clone();

        let inserted: Option<String> = redis::cmd("SET")
            .arg(idempotency_key(&message.message_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if inserted.is_none() {
            info!(message_id = %message.message_id, "message already queued (idempotent)");
            return Ok(true);
        }

        ensure_group(&mut conn, instance, &self.config.consumer_group).await?;

        let entry_id: String = redis::cmd("XADD")
            .arg(stream_key(instance))
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(serde_json::to_string(&message)?)
            .query_async(&mut conn)
            .await?;

        info!(message_id = %message.message_id, %entry_id, "message queued");
        Ok(true)
    }

    /// Current stream length for an instance.
    pub async fn queue_depth(&self, instance: &InstanceName) -> Result<u64> {
        let mut conn = self.conn.clone();
        let depth: i64 = redis::cmd("XLEN")
            .arg(stream_key(instance))
            .query_async(&mut conn)
            .await?;
        Ok(depth.max(0) as u64)
    }

    /// Current dead-letter stream length.
    pub async fn dlq_depth(&self, instance: &InstanceName) -> Result<u64> {
        let mut conn = self.conn.clone();
        let depth: i64 = redis::cmd("XLEN")
            .arg(dlq_key(instance))
            .query_async(&mut conn)
            .await?;
        debug!(%instance, depth, "dlq depth");
        Ok(depth.max(0) as u64)
    }

    pub fn config(&self) -> &EgressConfig {
        &self.config
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}
