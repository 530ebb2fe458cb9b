use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, error, info, warn};

use concierge_core::config::ProviderConfig;
use concierge_core::types::InstanceName;

use crate::error::Result;
use crate::jid::to_jid;

/// Result of a send attempt. 2xx counts as success; the provider message id
/// is recorded when present but never required for correctness.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// HTTP client for the Evolution-like WhatsApp gateway.
///
/// All calls share one hard timeout; helper endpoints (presence, mark
/// unread) are best-effort and only log on failure.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str, instance: &InstanceName) -> String {
        format!("{}/{path}/{instance}", self.base_url)
    }

    /// Whether the instance's WhatsApp connection state is `open`.
    pub async fn is_connected(&self, instance: &InstanceName) -> bool {
        let url = self.url("instance/connectionState", instance);
        let response = match self.http.get(&url).header("apikey", &self.api_key).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%instance, error = %e, "connection check failed");
                return false;
            }
        };
        if response.status() != StatusCode::OK {
            warn!(%instance, status = %response.status(), "connection check non-200");
            return false;
        }
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return false,
        };
        // The API has returned both {instance:{state}} and {state} over time.
        let state = body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str());
        debug!(%instance, ?state, "connection state");
        state == Some("open")
    }

    /// Send a text message. 2xx is success; the reply body is parsed for
    /// `key.id` on a best-effort basis.
    pub async fn send_text(&self, instance: &InstanceName, to: &str, text: &str) -> SendOutcome {
        self.post_message(
            instance,
            "message/sendText",
            json!({ "number": to_jid(to), "text": text, "delay": 1000 }),
        )
        .await
    }

    /// Immediate acknowledgment that bypasses the queue — instant feedback
    /// while the full reply is being generated.
    pub async fn send_quick_ack(&self, instance: &InstanceName, to: &str, text: &str) -> bool {
        self.post_message(
            instance,
            "message/sendText",
            json!({ "number": to_jid(to), "text": text, "delay": 0 }),
        )
        .await
        .success
    }

    /// Show the typing indicator while the agent is working.
    pub async fn send_typing(&self, instance: &InstanceName, to: &str) -> bool {
        self.send_presence(instance, to, "composing").await
    }

    /// Mark the agent as unavailable (session under human control).
    pub async fn send_presence_unavailable(&self, instance: &InstanceName, to: &str) -> bool {
        self.send_presence(instance, to, "unavailable").await
    }

    async fn send_presence(&self, instance: &InstanceName, to: &str, presence: &str) -> bool {
        let url = self.url("chat/sendPresence", instance);
        let body = json!({ "number": to_jid(to), "presence": presence, "delay": 0 });
        match self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                debug!(%instance, status = %r.status(), presence, "presence send refused");
                false
            }
            Err(e) => {
                debug!(%instance, error = %e, presence, "presence send failed (non-critical)");
                false
            }
        }
    }

    /// Ask the provider to badge the chat unread for the human operator.
    /// Best-effort: not all gateway versions expose the endpoint.
    pub async fn mark_chat_unread(&self, instance: &InstanceName, to: &str) -> bool {
        let url = self.url("chat/markChatUnread", instance);
        let body = json!({
            "number": to_jid(to),
            "lastMessage": { "key": { "fromMe": false } }
        });
        match self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                debug!(%instance, status = %r.status(), "mark unread refused (best-effort)");
                false
            }
            Err(e) => {
                debug!(%instance, error = %e, "mark unread failed (best-effort)");
                false
            }
        }
    }

    /// Send a location pin.
    pub async fn send_location(
        &self,
        instance: &InstanceName,
        to: &str,
        lat: f64,
        lng: f64,
        name: Option<&str>,
        address: Option<&str>,
    ) -> SendOutcome {
        self.post_message(
            instance,
            "message/sendLocation",
            json!({
                "number": to_jid(to),
                "name": name.unwrap_or("Clinic Location"),
                "address": address.unwrap_or(""),
                "latitude": lat,
                "longitude": lng,
                "delay": 1000
            }),
        )
        .await
    }

    /// Send an interactive button message.
    pub async fn send_buttons(
        &self,
        instance: &InstanceName,
        to: &str,
        text: &str,
        buttons: &[(String, String)],
        title: Option<&str>,
        footer: Option<&str>,
    ) -> SendOutcome {
        let formatted: Vec<serde_json::Value> = buttons
            .iter()
            .map(|(id, label)| {
                json!({ "buttonId": id, "buttonText": { "displayText": label } })
            })
            .collect();
        self.post_message(
            instance,
            "message/sendButtons",
            json!({
                "number": to_jid(to),
                "title": title.unwrap_or(""),
                "description": text,
                "footer": footer.unwrap_or(""),
                "buttons": formatted,
                "delay": 1000
            }),
        )
        .await
    }

    /// Send a pre-approved template message (Business API compliance).
    pub async fn send_template(
        &self,
        instance: &InstanceName,
        to: &str,
        template_name: &str,
        language: &str,
        components: Option<serde_json::Value>,
    ) -> SendOutcome {
        let mut body = json!({
            "number": to_jid(to),
            "name": template_name,
            "language": language,
            "delay": 1000
        });
        if let Some(components) = components {
            body["components"] = components;
        }
        self.post_message(instance, "message/sendTemplate", body).await
    }

    async fn post_message(
        &self,
        instance: &InstanceName,
        path: &str,
        body: serde_json::Value,
    ) -> SendOutcome {
        let url = self.url(path, instance);
        let response = match self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                error!(%instance, path, "provider call timed out");
                return SendOutcome::failure("timeout");
            }
            Err(e) => {
                error!(%instance, path, error = %e, "provider call failed");
                return SendOutcome::failure(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!(%instance, path, %status, "provider returned error status");
            return SendOutcome::failure(format!("HTTP {status}"));
        }

        // Success is decided by the status code; a malformed body only
        // costs us the provider message id.
        let provider_message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["key"]["id"].as_str().map(str::to_string));

        info!(%instance, path, ?provider_message_id, "provider send ok");
        SendOutcome {
            success: true,
            provider_message_id,
            error: None,
        }
    }
}
