use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use concierge_store::{ConversationStore, SessionPatch, TurnStatus};

/// Poll cadence for due follow-ups.
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Pause between consecutive re-wakes so the egress rate limiter is not
/// slammed by a backlog.
const PER_SESSION_PAUSE: Duration = Duration::from_secs(1);

/// A session whose promised follow-up is now due.
#[derive(Debug, Clone)]
pub struct FollowupEvent {
    pub session_id: String,
    pub user_identifier: String,
    pub clinic_id: String,
    pub pending_action: Option<String>,
}

/// Polls the store and forwards due sessions for re-waking.
///
/// The engine only flips state and emits events; generating the actual
/// follow-up reply is the host's job (it owns the pipeline).
pub struct FollowupEngine {
    store: Arc<dyn ConversationStore>,
    fired_tx: mpsc::Sender<FollowupEvent>,
}

impl FollowupEngine {
    /// Returns the engine and the receiving end of the fired-events channel.
    pub fn new(store: Arc<dyn ConversationStore>) -> (Self, mpsc::Receiver<FollowupEvent>) {
        let (fired_tx, fired_rx) = mpsc::channel(64);
        (Self { store, fired_tx }, fired_rx)
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("follow-up engine started");
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "follow-up tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("follow-up engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process every session whose follow-up time has arrived.
    pub async fn tick(&self) -> Result<usize, concierge_store::StoreError> {
        let now = Utc::now().to_rfc3339();
        let due = self.store.due_followups(&now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        info!(count = due.len(), "due follow-ups found");

        let mut processed = 0;
        for session in due {
            // Clear the schedule and hand the turn to the agent. Doing this
            // BEFORE emitting means a crashed consumer cannot double-fire.
            let patch = SessionPatch {
                turn_status: Some(TurnStatus::AgentTurn),
                scheduled_followup_at: Some(None),
                ..Default::default()
            };
            if let Err(e) = self.store.update_session(&session.id, patch).await {
                error!(session = %&session.id[..8.min(session.id.len())], error = %e, "failed to mark follow-up");
                continue;
            }

            let event = FollowupEvent {
                session_id: session.id.clone(),
                user_identifier: session.user_identifier.clone(),
                clinic_id: session.clinic_id.clone(),
                pending_action: session.pending_action.clone(),
            };
            if self.fired_tx.try_send(event).is_err() {
                warn!("follow-up channel full or closed, event dropped");
            }
            processed += 1;
            tokio::time::sleep(PER_SESSION_PAUSE).await;
        }

        info!(processed, "follow-ups processed");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_store::SqliteStore;

    async fn seeded_store() -> (Arc<dyn ConversationStore>, String) {
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let handle = store
            .get_or_create_session("1555", "c1", "whatsapp")
            .await
            .unwrap();
        store
            .update_session(
                &handle.session.id,
                SessionPatch {
                    turn_status: Some(TurnStatus::AgentActionPending),
                    pending_action: Some(Some("check Friday availability".to_string())),
                    scheduled_followup_at: Some(Some("2020-01-01T00:00:00+00:00".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (store, handle.session.id)
    }

    #[tokio::test]
    async fn due_session_is_fired_once() {
        let (store, session_id) = seeded_store().await;
        let (engine, mut fired) = FollowupEngine::new(Arc::clone(&store));

        let processed = engine.tick().await.unwrap();
        assert_eq!(processed, 1);

        let event = fired.recv().await.unwrap();
        assert_eq!(event.session_id, session_id);
        assert_eq!(event.pending_action.as_deref(), Some("check Friday availability"));

        // The schedule is cleared and the turn handed to the agent.
        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.turn_status, TurnStatus::AgentTurn);
        assert!(session.scheduled_followup_at.is_none());

        // A second tick finds nothing.
        assert_eq!(engine.tick().await.unwrap(), 0);
    }
}
