use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The JSON envelope carried in each stream entry's `payload` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Idempotency key. Enqueueing the same id twice within 24h is a no-op.
    pub message_id: String,
    pub to: String,
    pub text: String,
    /// Epoch seconds at enqueue time.
    pub queued_at: f64,
    /// Delivery attempts so far; incremented on every re-enqueue.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl QueueMessage {
    pub fn new(to: &str, text: &str, message_id: Option<String>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            message_id: message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            to: to.to_string(),
            text: text.to_string(),
            queued_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            attempts: 0,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        }
    }

    /// Terminal-failure form appended to the DLQ stream.
    pub fn into_dead_letter(self, final_error: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(&self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert("final_error".to_string(), final_error.into());
            map.insert(
                "failed_at".to_string(),
                (chrono::Utc::now().timestamp_millis() as f64 / 1000.0).into(),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let msg = QueueMessage::new("+1000", "hi", Some("m1".to_string()), None);
        let text = serde_json::to_string(&msg).unwrap();
        let back: QueueMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.message_id, "m1");
        assert_eq!(back.attempts, 0);
    }

    #[test]
    fn dead_letter_carries_error_and_timestamp() {
        let msg = QueueMessage::new("+1000", "hi", Some("m1".to_string()), None);
        let dlq = msg.into_dead_letter("max_deliveries_exceeded");
        assert_eq!(dlq["final_error"], "max_deliveries_exceeded");
        assert!(dlq["failed_at"].as_f64().unwrap() > 0.0);
        assert_eq!(dlq["message_id"], "m1");
    }

    #[test]
    fn missing_attempts_defaults_to_zero() {
        let back: QueueMessage =
            serde_json::from_str(r#"{"message_id":"m","to":"1","text":"t","queued_at":0.0}"#)
                .unwrap();
        assert_eq!(back.attempts, 0);
    }
}
