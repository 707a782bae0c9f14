use chrono::{DateTime, Utc};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::channels::{Channel, DeliveryAddress};
use crate::errors::RelevoError;
use crate::events::{
    BridgeRouting, ChannelKind, EventKind, InboundEvent, MediaRef, MediaType, Provider,
};
use crate::tenant::normalize_phone;
use async_trait::async_trait;

/// Verify the shared-secret query parameter the bridge appends to webhook
/// calls.
pub fn verify_secret(expected: &str, provided: Option<&str>) -> Result<(), RelevoError> {
    if expected.is_empty() {
        return Err(RelevoError::Auth(
            "bridge webhook secret is not configured".to_string(),
        ));
    }
    let Some(provided) = provided else {
        return Err(RelevoError::Auth("missing secret parameter".to_string()));
    };
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(())
    } else {
        Err(RelevoError::Auth("secret mismatch".to_string()))
    }
}

/// Which platform an inbox fronts, inferred from its free-text labels.
/// Instagram is checked before Facebook because Instagram inboxes ride the
/// Facebook channel type.
fn infer_channel(label: &str) -> Option<ChannelKind> {
    let label = label.to_lowercase();
    if label.contains("whatsapp") {
        Some(ChannelKind::Whatsapp)
    } else if label.contains("instagram") {
        Some(ChannelKind::Instagram)
    } else if label.contains("facebook") || label.contains("messenger") {
        Some(ChannelKind::Facebook)
    } else {
        None
    }
}

/// Normalize a bridge webhook payload into inbound events. Only
/// `message_created` events are accepted; private notes and our own API sends
/// are dropped, and operator replies become echo events.
pub fn parse_webhook(payload: &Value) -> Vec<InboundEvent> {
    let items: Vec<&Value> = match payload.as_array() {
        Some(list) => list.iter().collect(),
        None => vec![payload],
    };
    items.into_iter().filter_map(parse_event).collect()
}

fn parse_event(payload: &Value) -> Option<InboundEvent> {
    let event_name = payload["event"].as_str().unwrap_or("");
    if event_name != "message_created" {
        debug!("bridge webhook: ignoring event type: {}", event_name);
        return None;
    }
    if payload["private"].as_bool().unwrap_or(false) {
        debug!("bridge webhook: ignoring private note");
        return None;
    }

    let message_type = payload["message_type"].as_str().unwrap_or("");
    let is_echo = match message_type {
        "incoming" => false,
        "outgoing" => {
            // Our own API sends come back through the same webhook; only a
            // human operator's reply counts as an echo.
            let sender_type = payload["sender"]["type"].as_str().unwrap_or("");
            let automated = payload["content_attributes"]["automated"]
                .as_bool()
                .unwrap_or(false);
            if sender_type.eq_ignore_ascii_case("agent_bot") || automated {
                debug!("bridge webhook: ignoring our own outgoing message");
                return None;
            }
            true
        }
        other => {
            debug!("bridge webhook: ignoring message_type: {}", other);
            return None;
        }
    };

    let conversation = &payload["conversation"];
    let account_id = payload["account"]["id"].as_i64()?;
    let conversation_id = conversation["id"].as_i64()?;
    let message_id = payload["id"].as_i64()?;

    let label = format!(
        "{} {}",
        payload["inbox"]["name"].as_str().unwrap_or(""),
        conversation["channel"].as_str().unwrap_or("")
    );
    let Some(channel) = infer_channel(&label) else {
        warn!("bridge webhook: unrecognized channel label: {}", label.trim());
        return None;
    };

    let contact = &conversation["meta"]["sender"];
    let from = contact_identity(contact)?;
    let text = payload["content"]
        .as_str()
        .map(str::to_string)
        .filter(|t| !t.is_empty());
    let media = parse_attachments(&payload["attachments"]);

    let kind = if is_echo {
        EventKind::Echo
    } else if let Some(first) = media.first() {
        match first.media_type {
            MediaType::Image => EventKind::Image,
            MediaType::Audio => EventKind::Audio,
            MediaType::Document => EventKind::Document,
        }
    } else {
        EventKind::Text
    };
    if kind == EventKind::Text && text.is_none() {
        debug!("bridge webhook: message without content, skipping");
        return None;
    }

    let tenant_hint = conversation["custom_attributes"]["tenant_id"]
        .as_str()
        .map(str::to_string)
        .or_else(|| payload["tenant_id"].as_str().map(str::to_string));

    Some(InboundEvent {
        provider: Provider::Chatwoot,
        channel,
        event_id: message_id.to_string(),
        provider_message_id: message_id.to_string(),
        from,
        to: account_id.to_string(),
        text,
        media,
        customer_name: contact["name"].as_str().map(str::to_string),
        kind,
        tenant_hint,
        routing: Some(BridgeRouting {
            conversation_id,
            account_id,
        }),
        timestamp: parse_created_at(&payload["created_at"]),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    })
}

/// Platform-scoped contact identity: phone digits when the platform has
/// phones, otherwise the bridge identifier, otherwise the contact row id.
fn contact_identity(contact: &Value) -> Option<String> {
    if let Some(phone) = contact["phone_number"].as_str() {
        let digits = normalize_phone(phone);
        if !digits.is_empty() {
            return Some(digits);
        }
    }
    if let Some(identifier) = contact["identifier"].as_str() {
        if !identifier.is_empty() {
            return Some(identifier.to_string());
        }
    }
    contact["id"].as_i64().map(|id| id.to_string())
}

fn parse_attachments(node: &Value) -> Vec<MediaRef> {
    let Some(list) = node.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|att| {
            let url = att["data_url"].as_str()?.to_string();
            let media_type = match att["file_type"].as_str().unwrap_or("") {
                "image" => MediaType::Image,
                "audio" => MediaType::Audio,
                _ => MediaType::Document,
            };
            Some(MediaRef {
                media_type,
                url: Some(url),
                mime_type: None,
                file_name: att["file_name"].as_str().map(str::to_string),
                provider_id: att["id"].as_i64().map(|id| id.to_string()),
            })
        })
        .collect()
}

fn parse_created_at(value: &Value) -> DateTime<Utc> {
    if let Some(secs) = value.as_i64() {
        if let Some(ts) = DateTime::from_timestamp(secs, 0) {
            return ts;
        }
    }
    if let Some(secs) = value.as_f64() {
        if let Some(ts) = DateTime::from_timestamp(secs as i64, 0) {
            return ts;
        }
    }
    if let Some(s) = value.as_str() {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return ts.with_timezone(&Utc);
        }
    }
    Utc::now()
}

/// Outbound side of the bridge. One platform-wide API token; the target
/// conversation comes from the routing handles echoed off the inbound event.
pub struct ChatwootChannel {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl ChatwootChannel {
    pub fn new(http: reqwest::Client, api_base: &str, api_token: &str) -> Self {
        ChatwootChannel {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        }
    }

    fn conversation_url(&self, routing: BridgeRouting) -> String {
        format!(
            "{}/api/v1/accounts/{}/conversations/{}",
            self.api_base, routing.account_id, routing.conversation_id
        )
    }

    fn routing_for(address: &DeliveryAddress) -> anyhow::Result<BridgeRouting> {
        address
            .routing
            .ok_or_else(|| anyhow::anyhow!("bridge send requires routing metadata"))
    }

    async fn post(&self, url: String, body: Option<Value>) -> anyhow::Result<()> {
        let mut request = self
            .http
            .post(&url)
            .header("api_access_token", &self.api_token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!("chatwoot API error ({}): {}", status, body));
        }
        Ok(())
    }

    async fn create_message(
        &self,
        routing: BridgeRouting,
        content: &str,
        automated: bool,
    ) -> anyhow::Result<()> {
        let url = format!("{}/messages", self.conversation_url(routing));
        // `automated` lets the webhook parser tell our agent sends apart
        // from a human operator's replies.
        let mut body = serde_json::json!({
            "content": content,
            "message_type": "outgoing",
        });
        if automated {
            body["content_attributes"] = serde_json::json!({ "automated": true });
        }
        self.post(url, Some(body)).await
    }

    /// Post a message authored by a human operator, without the `automated`
    /// stamp. The bridge echoes it back through the webhook, where it is
    /// parsed as an operator echo and starts the takeover window.
    pub async fn send_operator_text(&self, routing: BridgeRouting, text: &str) -> anyhow::Result<()> {
        self.create_message(routing, text, false).await
    }
}

#[async_trait]
impl Channel for ChatwootChannel {
    fn name(&self) -> &'static str {
        "chatwoot"
    }

    async fn send_text(&self, address: &DeliveryAddress, text: &str) -> anyhow::Result<()> {
        let routing = Self::routing_for(address)?;
        self.create_message(routing, text, true).await
    }

    async fn send_image(&self, address: &DeliveryAddress, url: &str) -> anyhow::Result<()> {
        // The bridge renders bare URLs as previews; good enough for catalog
        // shots without a multipart upload round-trip.
        let routing = Self::routing_for(address)?;
        self.create_message(routing, url, true).await
    }

    async fn send_typing(&self, address: &DeliveryAddress) -> anyhow::Result<()> {
        let routing = Self::routing_for(address)?;
        let url = format!(
            "{}/toggle_typing_status?typing_status=on",
            self.conversation_url(routing)
        );
        self.post(url, None).await
    }

    async fn mark_read(&self, address: &DeliveryAddress) -> anyhow::Result<()> {
        let routing = Self::routing_for(address)?;
        let url = format!("{}/update_last_seen", self.conversation_url(routing));
        self.post(url, None).await
    }
}
