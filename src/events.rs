use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which upstream surface delivered the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Direct WhatsApp-style API (signed webhooks, cloud media).
    Whatsapp,
    /// Chatwoot-style inbox bridge fronting Instagram/Facebook/WhatsApp.
    Chatwoot,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Whatsapp => "whatsapp",
            Provider::Chatwoot => "chatwoot",
        }
    }
}

/// Messaging platform the end user is actually on. For direct webhooks this
/// is always WhatsApp; bridge events infer it from the inbox channel label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Whatsapp,
    Instagram,
    Facebook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Instagram => "instagram",
            ChannelKind::Facebook => "facebook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(ChannelKind::Whatsapp),
            "instagram" => Some(ChannelKind::Instagram),
            "facebook" => Some(ChannelKind::Facebook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Image,
    Document,
    Audio,
    /// Operator reply sent from the business's own app. Marks human takeover;
    /// must never re-enter the agent.
    Echo,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Image => "image",
            EventKind::Document => "document",
            EventKind::Audio => "audio",
            EventKind::Echo => "echo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(EventKind::Text),
            "image" => Some(EventKind::Image),
            "document" => Some(EventKind::Document),
            "audio" => Some(EventKind::Audio),
            "echo" => Some(EventKind::Echo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Document,
    Audio,
}

/// Attachment reference carried alongside the normalized text. Direct-channel
/// webhooks only carry a media id; the download URL is resolved later with
/// tenant credentials, so `url` stays empty until then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub provider_id: Option<String>,
}

/// Opaque bridge routing handles. Echoed back verbatim on send so the bridge
/// can address the originating conversation; never interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRouting {
    pub conversation_id: i64,
    pub account_id: i64,
}

/// One provider-agnostic inbound event. Both webhook parsers produce this
/// shape; everything downstream is provider-blind except for reply routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub provider: Provider,
    pub channel: ChannelKind,
    /// Provider-assigned id used for idempotency.
    pub event_id: String,
    pub provider_message_id: String,
    /// Platform-scoped end-user identity (phone digits or social account id).
    /// For echo events this stays the CUSTOMER id, not the operator's.
    pub from: String,
    /// Business-side identity: the tenant's number for direct events, the
    /// bridge account id for bridge events. Keys tenant resolution.
    pub to: String,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub customer_name: Option<String>,
    pub kind: EventKind,
    /// Explicit tenant id when the payload carries one. Highest-priority
    /// resolution source.
    pub tenant_hint: Option<String>,
    pub routing: Option<BridgeRouting>,
    pub timestamp: DateTime<Utc>,
    /// Assigned at ingestion, propagated through every log line and the
    /// agent call for this event's lifecycle.
    pub correlation_id: String,
}

impl InboundEvent {
    /// Debounce/lock key: one buffer per sender per business surface.
    pub fn sender_key(&self) -> String {
        format!("{}:{}:{}", self.provider.as_str(), self.to, self.from)
    }

    pub fn is_echo(&self) -> bool {
        self.kind == EventKind::Echo
    }

    /// Whether this event joins the debounce buffer. Media and echo events
    /// skip buffering and flow immediately.
    pub fn is_buffered(&self) -> bool {
        self.kind == EventKind::Text
    }
}

/// One paced message in the outbound sequence. Exactly one of `text` /
/// `image_url` is set; `is_final` marks the bubble that carries telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundBubble {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub sequence_index: usize,
    pub is_final: bool,
}

impl OutboundBubble {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundBubble {
            text: Some(text.into()),
            image_url: None,
            sequence_index: 0,
            is_final: false,
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        OutboundBubble {
            text: None,
            image_url: Some(url.into()),
            sequence_index: 0,
            is_final: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Ok,
    Duplicate,
    Ignored,
    Error,
}

/// Canonical result of processing one turn. Serialized as-is on the internal
/// API and logged at the end of every pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub send: bool,
    pub messages: Vec<OutboundBubble>,
}

impl DispatchOutcome {
    pub fn ok(messages: Vec<OutboundBubble>) -> Self {
        DispatchOutcome {
            status: DispatchStatus::Ok,
            send: true,
            messages,
        }
    }

    pub fn duplicate() -> Self {
        DispatchOutcome {
            status: DispatchStatus::Duplicate,
            send: false,
            messages: vec![],
        }
    }

    pub fn ignored() -> Self {
        DispatchOutcome {
            status: DispatchStatus::Ignored,
            send: false,
            messages: vec![],
        }
    }

    pub fn error() -> Self {
        DispatchOutcome {
            status: DispatchStatus::Error,
            send: false,
            messages: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(provider: Provider, to: &str, from: &str) -> InboundEvent {
        InboundEvent {
            provider,
            channel: ChannelKind::Whatsapp,
            event_id: "evt_1".to_string(),
            provider_message_id: "wamid.1".to_string(),
            from: from.to_string(),
            to: to.to_string(),
            text: Some("hola".to_string()),
            media: vec![],
            customer_name: None,
            kind: EventKind::Text,
            tenant_hint: None,
            routing: None,
            timestamp: Utc::now(),
            correlation_id: "corr-1".to_string(),
        }
    }

    #[test]
    fn sender_key_scopes_by_provider_and_business() {
        let a = make_event(Provider::Whatsapp, "5215500000001", "5215512345678");
        let b = make_event(Provider::Chatwoot, "5215500000001", "5215512345678");
        assert_eq!(a.sender_key(), "whatsapp:5215500000001:5215512345678");
        assert_ne!(a.sender_key(), b.sender_key());
    }

    #[test]
    fn only_text_events_buffer() {
        let mut evt = make_event(Provider::Whatsapp, "1", "2");
        assert!(evt.is_buffered());
        evt.kind = EventKind::Image;
        assert!(!evt.is_buffered());
        evt.kind = EventKind::Echo;
        assert!(!evt.is_buffered());
        assert!(evt.is_echo());
    }

    #[test]
    fn outcome_statuses_serialize_lowercase() {
        let out = DispatchOutcome::duplicate();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["send"], false);
        assert!(json["messages"].as_array().unwrap().is_empty());
    }

    #[test]
    fn bubble_image_url_uses_wire_name() {
        let mut bubble = OutboundBubble::image("https://cdn.example.com/p.png");
        bubble.is_final = true;
        let json = serde_json::to_value(&bubble).unwrap();
        assert_eq!(json["imageUrl"], "https://cdn.example.com/p.png");
        assert!(json.get("text").is_none());
        assert_eq!(json["is_final"], true);
    }

    #[test]
    fn event_serde_roundtrip() {
        let mut evt = make_event(Provider::Chatwoot, "acct:9", "ig_881");
        evt.channel = ChannelKind::Instagram;
        evt.routing = Some(BridgeRouting {
            conversation_id: 412,
            account_id: 9,
        });
        let json = serde_json::to_string(&evt).unwrap();
        let back: InboundEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel, ChannelKind::Instagram);
        assert_eq!(back.routing, evt.routing);
        assert_eq!(back.sender_key(), "chatwoot:acct:9:ig_881");
    }
}
