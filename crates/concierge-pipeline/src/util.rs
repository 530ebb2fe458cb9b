use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use concierge_core::config::STORE_WRITE_TIMEOUT_MS;
use concierge_core::flags;
use concierge_store::{ConversationStore, Role};

/// Fire-and-forget message write with a soft timeout.
///
/// The request path never blocks on conversation logging; failures log a
/// warning. `CONVERSATION_LOG_FAIL_FAST` turns the spawn into an awaited
/// write that panics the test on failure.
pub fn spawn_store_message(
    store: &Arc<dyn ConversationStore>,
    session_id: &str,
    role: Role,
    content: &str,
    phone: &str,
    metadata: serde_json::Value,
) {
    let store = Arc::clone(store);
    let session_id = session_id.to_string();
    let content = content.to_string();
    let phone = phone.to_string();
    let fail_fast = flags::get().conversation_log_fail_fast;

    let write = async move {
        let result = tokio::time::timeout(
            Duration::from_millis(STORE_WRITE_TIMEOUT_MS),
            store.store_message(&session_id, role, &content, &phone, metadata),
        )
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if fail_fast {
                    panic!("conversation log write failed: {e}");
                }
                warn!(error = %e, "conversation log write failed");
            }
            Err(_) => {
                if fail_fast {
                    panic!("conversation log write timed out");
                }
                warn!(timeout_ms = STORE_WRITE_TIMEOUT_MS, "conversation log write timed out");
            }
        }
    };

    tokio::spawn(write);
}
