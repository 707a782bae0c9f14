use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::channels::{Channel, DeliveryAddress};
use crate::errors::RelevoError;
use crate::events::{ChannelKind, EventKind, InboundEvent, MediaRef, MediaType, Provider};
use crate::tenant::{Tenant, normalize_phone};
use async_trait::async_trait;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed distance between the signature timestamp and now.
pub const SIGNATURE_SKEW_SECS: i64 = 300;

/// Verify a `t=<unix_ts>,s=<hex_hmac_sha256>` signature header computed over
/// `"<t>.<raw_body>"`. The timestamp is checked before the digest so replayed
/// payloads are rejected even when the digest itself is valid.
pub fn verify_signature(
    secret: &str,
    header: &str,
    raw_body: &[u8],
    now: i64,
) -> Result<(), RelevoError> {
    if secret.is_empty() {
        return Err(RelevoError::Auth(
            "webhook secret is not configured".to_string(),
        ));
    }
    let mut ts_str = None;
    let mut sig_hex = None;
    for part in header.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("t=") {
            ts_str = Some(v);
        } else if let Some(v) = part.strip_prefix("s=") {
            sig_hex = Some(v);
        }
    }
    let (Some(ts_str), Some(sig_hex)) = (ts_str, sig_hex) else {
        return Err(RelevoError::Auth("malformed signature header".to_string()));
    };
    let ts: i64 = ts_str
        .parse()
        .map_err(|_| RelevoError::Auth("signature timestamp is not a number".to_string()))?;
    if (now - ts).abs() > SIGNATURE_SKEW_SECS {
        return Err(RelevoError::Auth(
            "signature timestamp outside tolerance".to_string(),
        ));
    }
    let provided = hex::decode(sig_hex)
        .map_err(|_| RelevoError::Auth("signature is not valid hex".to_string()))?;
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return Err(RelevoError::Auth("webhook secret is unusable".to_string()));
    };
    mac.update(ts_str.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();
    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(RelevoError::Auth("signature mismatch".to_string()))
    }
}

/// Normalize a direct-channel webhook payload into inbound events. Accepts a
/// single envelope or a list of them; unsupported message types and delivery
/// statuses are skipped.
pub fn parse_webhook(payload: &Value) -> Vec<InboundEvent> {
    let envelopes: Vec<&Value> = match payload.as_array() {
        Some(list) => list.iter().collect(),
        None => vec![payload],
    };
    let mut events = Vec::new();
    for envelope in envelopes {
        let tenant_hint = envelope["tenant_id"].as_str().map(str::to_string);
        let Some(entries) = envelope["entry"].as_array() else {
            debug!("whatsapp webhook: envelope without entry list, skipping");
            continue;
        };
        for entry in entries {
            let Some(changes) = entry["changes"].as_array() else {
                continue;
            };
            for change in changes {
                let value = &change["value"];
                let business = business_number(value);
                let names = contact_names(value);
                if let Some(messages) = value["messages"].as_array() {
                    for msg in messages {
                        if let Some(event) =
                            parse_message(msg, &business, &names, tenant_hint.as_deref())
                        {
                            events.push(event);
                        }
                    }
                }
                if let Some(echoes) = value["message_echoes"].as_array() {
                    for echo in echoes {
                        if let Some(event) = parse_echo(echo, &business, tenant_hint.as_deref()) {
                            events.push(event);
                        }
                    }
                }
                if value.get("statuses").is_some() {
                    debug!("whatsapp webhook: ignoring delivery status update");
                }
            }
        }
    }
    events
}

fn business_number(value: &Value) -> String {
    value["metadata"]["display_phone_number"]
        .as_str()
        .or_else(|| value["metadata"]["phone_number_id"].as_str())
        .map(normalize_phone)
        .unwrap_or_default()
}

fn contact_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    if let Some(contacts) = value["contacts"].as_array() {
        for contact in contacts {
            if let (Some(wa_id), Some(name)) = (
                contact["wa_id"].as_str(),
                contact["profile"]["name"].as_str(),
            ) {
                names.insert(wa_id.to_string(), name.to_string());
            }
        }
    }
    names
}

fn parse_message(
    msg: &Value,
    business: &str,
    names: &HashMap<String, String>,
    tenant_hint: Option<&str>,
) -> Option<InboundEvent> {
    let from = msg["from"].as_str()?.to_string();
    let id = msg["id"].as_str()?.to_string();
    let msg_type = msg["type"].as_str().unwrap_or("");
    let (kind, text, media) = match msg_type {
        "text" => (
            EventKind::Text,
            msg["text"]["body"].as_str().map(str::to_string),
            Vec::new(),
        ),
        "image" => (
            EventKind::Image,
            msg["image"]["caption"].as_str().map(str::to_string),
            vec![media_ref(&msg["image"], MediaType::Image)],
        ),
        "document" => (
            EventKind::Document,
            msg["document"]["caption"].as_str().map(str::to_string),
            vec![media_ref(&msg["document"], MediaType::Document)],
        ),
        "audio" => (
            EventKind::Audio,
            None,
            vec![media_ref(&msg["audio"], MediaType::Audio)],
        ),
        other => {
            debug!(
                "whatsapp webhook: ignoring unsupported message type: {}",
                other
            );
            return None;
        }
    };
    Some(InboundEvent {
        provider: Provider::Whatsapp,
        channel: ChannelKind::Whatsapp,
        event_id: id.clone(),
        provider_message_id: id,
        customer_name: names.get(&from).cloned(),
        from,
        to: business.to_string(),
        text,
        media,
        kind,
        tenant_hint: tenant_hint.map(str::to_string),
        routing: None,
        timestamp: parse_timestamp(&msg["timestamp"]),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    })
}

/// An echo is a message the operator sent from the business's own app, relayed
/// back by the provider. `from` stays the customer so the event keys the same
/// conversation as the customer's own messages.
fn parse_echo(echo: &Value, business: &str, tenant_hint: Option<&str>) -> Option<InboundEvent> {
    let customer = echo["to"].as_str()?.to_string();
    let id = echo["id"].as_str()?.to_string();
    let text = echo["text"]["body"]
        .as_str()
        .or_else(|| echo["image"]["caption"].as_str())
        .map(str::to_string);
    Some(InboundEvent {
        provider: Provider::Whatsapp,
        channel: ChannelKind::Whatsapp,
        event_id: id.clone(),
        provider_message_id: id,
        from: customer,
        to: business.to_string(),
        text,
        media: Vec::new(),
        customer_name: None,
        kind: EventKind::Echo,
        tenant_hint: tenant_hint.map(str::to_string),
        routing: None,
        timestamp: parse_timestamp(&echo["timestamp"]),
        correlation_id: uuid::Uuid::new_v4().to_string(),
    })
}

fn media_ref(node: &Value, media_type: MediaType) -> MediaRef {
    MediaRef {
        media_type,
        url: None,
        mime_type: node["mime_type"].as_str().map(str::to_string),
        file_name: node["filename"].as_str().map(str::to_string),
        provider_id: node["id"].as_str().map(str::to_string),
    }
}

fn parse_timestamp(value: &Value) -> DateTime<Utc> {
    let secs = value
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| value.as_i64());
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
}

/// Outbound side of the direct channel. Built per turn from the resolved
/// tenant's credentials, never from process-wide state.
pub struct WhatsappChannel {
    http: reqwest::Client,
    api_base: String,
    phone_id: String,
    token: String,
}

impl WhatsappChannel {
    pub fn for_tenant(
        http: reqwest::Client,
        api_base: &str,
        tenant: &Tenant,
    ) -> Result<Self, RelevoError> {
        if tenant.wa_phone_id.is_empty() || tenant.wa_token.is_empty() {
            return Err(RelevoError::Config(format!(
                "tenant {} has no WhatsApp send credentials",
                tenant.id
            )));
        }
        Ok(WhatsappChannel {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            phone_id: tenant.wa_phone_id.clone(),
            token: tenant.wa_token.clone(),
        })
    }

    async fn post_message(&self, body: Value) -> anyhow::Result<()> {
        let url = format!("{}/{}/messages", self.api_base, self.phone_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!("whatsapp API error ({}): {}", status, body));
        }
        Ok(())
    }

    /// Exchange a webhook media id for its short-lived download URL.
    pub async fn resolve_media_url(&self, media_id: &str) -> anyhow::Result<String> {
        let url = format!("{}/{}", self.api_base, media_id);
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "whatsapp media lookup error ({}): {}",
                status,
                body
            ));
        }
        let value: Value = response.json().await?;
        value["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("whatsapp media lookup response has no url"))
    }

    pub async fn download_media(&self, media_id: &str) -> anyhow::Result<Vec<u8>> {
        let url = self.resolve_media_url(media_id).await?;
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "whatsapp media download error ({})",
                response.status()
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Channel for WhatsappChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn send_text(&self, address: &DeliveryAddress, text: &str) -> anyhow::Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": address.to,
            "type": "text",
            "text": { "body": text },
        }))
        .await
    }

    async fn send_image(&self, address: &DeliveryAddress, url: &str) -> anyhow::Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": address.to,
            "type": "image",
            "image": { "link": url },
        }))
        .await
    }

    async fn send_typing(&self, address: &DeliveryAddress) -> anyhow::Result<()> {
        if address.inbound_message_id.is_empty() {
            return Ok(());
        }
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": address.inbound_message_id,
            "typing_indicator": { "type": "text" },
        }))
        .await
    }

    async fn mark_read(&self, address: &DeliveryAddress) -> anyhow::Result<()> {
        if address.inbound_message_id.is_empty() {
            return Ok(());
        }
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": address.inbound_message_id,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{ts}.").as_bytes());
        mac.update(body.as_bytes());
        format!("t={},s={}", ts, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let now = 1714401600;
        let body = r#"{"entry":[]}"#;
        let header = sign("topsecret", now - 10, body);
        assert!(verify_signature("topsecret", &header, body.as_bytes(), now).is_ok());
    }

    #[test]
    fn stale_timestamp_rejected_even_with_valid_digest() {
        let now = 1714401600;
        let body = r#"{"entry":[]}"#;
        let header = sign("topsecret", now - 700, body);
        let err = verify_signature("topsecret", &header, body.as_bytes(), now).unwrap_err();
        assert!(matches!(err, RelevoError::Auth(_)));
        let future = sign("topsecret", now + 400, body);
        assert!(verify_signature("topsecret", &future, body.as_bytes(), now).is_err());
    }

    #[test]
    fn tampered_body_rejected() {
        let now = 1714401600;
        let header = sign("topsecret", now, r#"{"entry":[]}"#);
        assert!(verify_signature("topsecret", &header, br#"{"entry":[{}]}"#, now).is_err());
    }

    #[test]
    fn malformed_headers_rejected() {
        let now = 1714401600;
        for header in ["", "garbage", "t=123", "s=00", "t=abc,s=00", "t=123,s=zz"] {
            assert!(
                verify_signature("topsecret", header, b"{}", now).is_err(),
                "accepted: {header:?}"
            );
        }
    }

    fn sample_payload() -> Value {
        serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "102290129340398",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "5215500000001",
                            "phone_number_id": "106540352242922"
                        },
                        "contacts": [{
                            "profile": { "name": "Laura" },
                            "wa_id": "5215512345678"
                        }],
                        "messages": [{
                            "from": "5215512345678",
                            "id": "wamid.HBgLNTIxNTUxMjM0NTY3OBUCABIYFjNFQjBDMUM4M0Y5RkY1",
                            "timestamp": "1714401600",
                            "type": "text",
                            "text": { "body": "Hola, tienen envíos?" }
                        }]
                    }
                }]
            }]
        })
    }

    #[test]
    fn parses_text_message() {
        let events = parse_webhook(&sample_payload());
        assert_eq!(events.len(), 1);
        let evt = &events[0];
        assert_eq!(evt.provider, Provider::Whatsapp);
        assert_eq!(evt.channel, ChannelKind::Whatsapp);
        assert_eq!(evt.from, "5215512345678");
        assert_eq!(evt.to, "5215500000001");
        assert_eq!(evt.text.as_deref(), Some("Hola, tienen envíos?"));
        assert_eq!(evt.customer_name.as_deref(), Some("Laura"));
        assert_eq!(evt.kind, EventKind::Text);
        assert!(evt.is_buffered());
        assert_eq!(
            evt.timestamp,
            DateTime::from_timestamp(1714401600, 0).unwrap()
        );
        assert!(!evt.correlation_id.is_empty());
    }

    #[test]
    fn parses_image_with_caption() {
        let mut payload = sample_payload();
        payload["entry"][0]["changes"][0]["value"]["messages"][0] = serde_json::json!({
            "from": "5215512345678",
            "id": "wamid.IMG1",
            "timestamp": "1714401600",
            "type": "image",
            "image": { "id": "media-778", "mime_type": "image/jpeg", "caption": "este modelo" }
        });
        let events = parse_webhook(&payload);
        assert_eq!(events.len(), 1);
        let evt = &events[0];
        assert_eq!(evt.kind, EventKind::Image);
        assert!(!evt.is_buffered());
        assert_eq!(evt.text.as_deref(), Some("este modelo"));
        assert_eq!(evt.media.len(), 1);
        assert_eq!(evt.media[0].provider_id.as_deref(), Some("media-778"));
        assert_eq!(evt.media[0].mime_type.as_deref(), Some("image/jpeg"));
        assert!(evt.media[0].url.is_none());
    }

    #[test]
    fn parses_audio_message() {
        let mut payload = sample_payload();
        payload["entry"][0]["changes"][0]["value"]["messages"][0] = serde_json::json!({
            "from": "5215512345678",
            "id": "wamid.AUD1",
            "timestamp": "1714401600",
            "type": "audio",
            "audio": { "id": "media-990", "mime_type": "audio/ogg; codecs=opus" }
        });
        let events = parse_webhook(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Audio);
        assert!(events[0].text.is_none());
        assert_eq!(events[0].media[0].provider_id.as_deref(), Some("media-990"));
    }

    #[test]
    fn echo_keeps_customer_as_from() {
        let mut payload = sample_payload();
        let value = &mut payload["entry"][0]["changes"][0]["value"];
        value["messages"] = serde_json::json!([]);
        value["message_echoes"] = serde_json::json!([{
            "from": "5215500000001",
            "to": "5215512345678",
            "id": "wamid.ECHO1",
            "timestamp": "1714401700",
            "type": "text",
            "text": { "body": "Ya te lo mando yo" }
        }]);
        let events = parse_webhook(&payload);
        assert_eq!(events.len(), 1);
        let evt = &events[0];
        assert_eq!(evt.kind, EventKind::Echo);
        assert!(evt.is_echo());
        assert_eq!(evt.from, "5215512345678");
        assert_eq!(evt.to, "5215500000001");
        assert_eq!(evt.text.as_deref(), Some("Ya te lo mando yo"));
        assert_eq!(evt.sender_key(), "whatsapp:5215500000001:5215512345678");
    }

    #[test]
    fn unsupported_types_and_statuses_skipped() {
        let mut payload = sample_payload();
        let value = &mut payload["entry"][0]["changes"][0]["value"];
        value["messages"] = serde_json::json!([{
            "from": "5215512345678",
            "id": "wamid.STICKER",
            "timestamp": "1714401600",
            "type": "sticker",
            "sticker": { "id": "media-1" }
        }]);
        value["statuses"] = serde_json::json!([{ "id": "wamid.X", "status": "delivered" }]);
        assert!(parse_webhook(&payload).is_empty());
    }

    #[test]
    fn list_payload_normalizes_to_events() {
        let payload = serde_json::json!([sample_payload(), sample_payload()]);
        assert_eq!(parse_webhook(&payload).len(), 2);
    }

    #[test]
    fn tenant_hint_propagates() {
        let mut payload = sample_payload();
        payload["tenant_id"] = serde_json::json!("tn_42");
        let events = parse_webhook(&payload);
        assert_eq!(events[0].tenant_hint.as_deref(), Some("tn_42"));
    }

    #[test]
    fn channel_requires_tenant_credentials() {
        let tenant = Tenant {
            id: "tn_1".to_string(),
            name: "Kicks MX".to_string(),
            business_phone: "5215500000001".to_string(),
            active: true,
            system_prompt: String::new(),
            store_description: String::new(),
            catalog_text: String::new(),
            notify_email: String::new(),
            wa_phone_id: String::new(),
            wa_token: String::new(),
            bridge_account_id: None,
        };
        let err = WhatsappChannel::for_tenant(
            crate::channels::http_client(),
            "https://graph.example.com/v18.0",
            &tenant,
        );
        assert!(matches!(err, Err(RelevoError::Config(_))));
    }
}
