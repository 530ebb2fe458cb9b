//! Push-based instance discovery over Redis pub/sub.
//!
//! When a tenant's WhatsApp integration is created or disabled, a JSON
//! event is published; the supervisor reacts by starting or draining the
//! per-instance worker loop.

use std::collections::HashMap;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use concierge_core::config::ProviderConfig;
use concierge_core::types::InstanceName;

use crate::client::ProviderClient;
use crate::config::{EgressConfig, INSTANCE_ADDED_CHANNEL, INSTANCE_REMOVED_CHANNEL};
use crate::error::Result;
use crate::limiter::TokenBucket;
use crate::worker::EgressWorker;

/// Wire format on both discovery channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance_name: String,
    pub organization_id: String,
    pub action: String,
}

/// Publisher side — called by the integration-management layer.
pub struct InstanceNotifier {
    conn: ConnectionManager,
}

impl InstanceNotifier {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn notify_added(&self, instance_name: &str, organization_id: &str) -> Result<()> {
        self.publish(INSTANCE_ADDED_CHANNEL, instance_name, organization_id, "added")
            .await
    }

    pub async fn notify_removed(&self, instance_name: &str, organization_id: &str) -> Result<()> {
        self.publish(
            INSTANCE_REMOVED_CHANNEL,
            instance_name,
            organization_id,
            "removed",
        )
        .await
    }

    async fn publish(
        &self,
        channel: &str,
        instance_name: &str,
        organization_id: &str,
        action: &str,
    ) -> Result<()> {
        let payload = serde_json::to_string(&InstanceEvent {
            instance_name: instance_name.to_string(),
            organization_id: organization_id.to_string(),
            action: action.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let subscribers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        info!(instance = instance_name, subscribers, action, "instance event published");
        Ok(())
    }
}

/// Subscriber side: one worker task per live instance.
pub struct WorkerSupervisor {
    redis_url: String,
    provider: ProviderConfig,
    config: EgressConfig,
    /// instance name → that worker's shutdown sender and task handle.
    workers: Mutex<HashMap<String, (watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
}

impl WorkerSupervisor {
    pub fn new(redis_url: &str, provider: ProviderConfig, config: EgressConfig) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            provider,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a consumer loop for an instance. No-op if one is running.
    pub async fn start_instance(&self, name: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(name) {
            return Ok(());
        }

        let instance = InstanceName::new(name);
        let client = redis::Client::open(self.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let limiter = TokenBucket::connect(
            &self.redis_url,
            instance.clone(),
            self.config.tokens_per_second,
            self.config.bucket_capacity,
        )
        .await?;
        let provider = ProviderClient::new(&self.provider)?;

        let (tx, rx) = watch::channel(false);
        let worker = EgressWorker::new(conn, limiter, provider, instance.clone(), self.config.clone(), None);
        let handle = tokio::spawn(async move {
            worker.run(rx).await;
        });

        workers.insert(name.to_string(), (tx, handle));
        info!(instance = name, "worker started");
        Ok(())
    }

    /// Stop an instance's loop and wait for it to drain in-flight sends.
    pub async fn stop_instance(&self, name: &str) {
        let entry = {
            let mut workers = self.workers.lock().await;
            workers.remove(name)
        };
        if let Some((tx, handle)) = entry {
            let _ = tx.send(true);
            info!(instance = name, "worker stopping");
            if let Err(e) = handle.await {
                error!(instance = name, error = %e, "worker task panicked");
            }
            info!(instance = name, "worker stopped");
        }
    }

    pub async fn active_instances(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut names: Vec<String> = workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Listen for instance events until `shutdown` flips. Stops every
    /// worker before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(INSTANCE_ADDED_CHANNEL).await?;
        pubsub.subscribe(INSTANCE_REMOVED_CHANNEL).await?;
        info!("subscribed to instance change notifications");

        {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    message = stream.next() => {
                        let Some(message) = message else {
                            warn!("pub/sub stream closed");
                            break;
                        };
                        let channel = message.get_channel_name().to_string();
                        let payload: String = match message.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                error!(error = %e, "bad pub/sub payload");
                                continue;
                            }
                        };
                        let event: InstanceEvent = match serde_json::from_str(&payload) {
                            Ok(e) => e,
                            Err(e) => {
                                error!(error = %e, "failed to parse instance notification");
                                continue;
                            }
                        };
                        match channel.as_str() {
                            INSTANCE_ADDED_CHANNEL => {
                                if let Err(e) = self.start_instance(&event.instance_name).await {
                                    error!(instance = %event.instance_name, error = %e, "failed to start worker");
                                }
                            }
                            INSTANCE_REMOVED_CHANNEL => {
                                self.stop_instance(&event.instance_name).await;
                            }
                            other => warn!(channel = other, "unexpected pub/sub channel"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        // Drain all workers on the way out.
        let names = self.active_instances().await;
        for name in names {
            self.stop_instance(&name).await;
        }
        info!("instance supervisor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format() {
        let event = InstanceEvent {
            instance_name: "clinic-abc-1".to_string(),
            organization_id: "org-1".to_string(),
            action: "added".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["instance_name"], "clinic-abc-1");
        assert_eq!(json["organization_id"], "org-1");
        assert_eq!(json["action"], "added");
    }
}
