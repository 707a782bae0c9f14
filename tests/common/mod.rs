// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relevo::config::Config;
use relevo::conversation::{Message, MessageStore};
use relevo::events::{ChannelKind, EventKind, InboundEvent, Provider};
use relevo::pipeline::Pipeline;
use relevo::store::{MemoryStore, SqliteStore};
use relevo::tenant::Tenant;

type HmacSha256 = Hmac<Sha256>;

pub const TENANT_ID: &str = "tn_kicks";
pub const BUSINESS_PHONE: &str = "5215500000001";
pub const CUSTOMER_PHONE: &str = "5215512345678";
pub const WA_PHONE_ID: &str = "10890";
pub const BRIDGE_ACCOUNT_ID: i64 = 9;

pub fn test_tenant() -> Tenant {
    Tenant {
        id: TENANT_ID.to_string(),
        name: "Kicks MX".to_string(),
        business_phone: BUSINESS_PHONE.to_string(),
        active: true,
        system_prompt: String::new(),
        store_description: "Tienda de zapatillas en CDMX.".to_string(),
        catalog_text: "- Runner Azul $1,299\n- Clásica Blanca $999".to_string(),
        notify_email: String::new(),
        wa_phone_id: WA_PHONE_ID.to_string(),
        wa_token: "wa-token".to_string(),
        bridge_account_id: Some(BRIDGE_ACCOUNT_ID),
    }
}

/// Config tuned for tests: one-second quiet window, millisecond pacing and
/// retry delays, fixed secrets, port 0 so gateway tests bind anywhere.
pub fn fast_config(agent_url: &str, wa_base: &str) -> Config {
    let mut config = Config::default();
    config.agent.url = agent_url.to_string();
    config.agent.initial_delay_ms = 1;
    config.agent.max_delay_ms = 2;
    config.debounce.quiet_secs = 1;
    config.debounce.lock_ttl_secs = 5;
    config.debounce.poll_interval_ms = 20;
    config.delivery.pacing_ms = 1;
    config.providers.whatsapp.api_base = wa_base.to_string();
    config.providers.whatsapp.webhook_secret = "wh-secret".to_string();
    config.providers.chatwoot.webhook_secret = "cw-secret".to_string();
    config.server.internal_token = "internal-secret".to_string();
    config.server.port = 0;
    config
}

pub fn memory_pipeline(config: Config) -> (Arc<Pipeline>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(test_tenant());
    let pipeline = Arc::new(Pipeline::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    (pipeline, store)
}

pub fn sqlite_pipeline(config: Config, db_path: &Path) -> (Arc<Pipeline>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::new(db_path).expect("open sqlite store"));
    store.upsert_tenant(&test_tenant()).expect("seed tenant");
    let pipeline = Arc::new(Pipeline::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    (pipeline, store)
}

// --- Event builders ---

pub fn text_event(id: &str, text: &str) -> InboundEvent {
    InboundEvent {
        provider: Provider::Whatsapp,
        channel: ChannelKind::Whatsapp,
        event_id: id.to_string(),
        provider_message_id: format!("wamid.{id}"),
        from: CUSTOMER_PHONE.to_string(),
        to: BUSINESS_PHONE.to_string(),
        text: Some(text.to_string()),
        media: vec![],
        customer_name: Some("Caro".to_string()),
        kind: EventKind::Text,
        tenant_hint: None,
        routing: None,
        timestamp: Utc::now(),
        correlation_id: format!("corr-{id}"),
    }
}

pub fn echo_event(id: &str, text: &str) -> InboundEvent {
    let mut event = text_event(id, text);
    event.kind = EventKind::Echo;
    event
}

pub fn image_event(id: &str, caption: &str) -> InboundEvent {
    let mut event = text_event(id, caption);
    event.kind = EventKind::Image;
    event.media = vec![relevo::events::MediaRef {
        media_type: relevo::events::MediaType::Image,
        url: None,
        mime_type: Some("image/jpeg".to_string()),
        file_name: None,
        provider_id: Some("media_77".to_string()),
    }];
    event
}

// --- Webhook payload builders ---

/// Direct-provider webhook signature: HMAC-SHA256 over `"<ts>.<raw body>"`.
pub fn sign_webhook(secret: &str, ts: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(format!("{ts}.").as_bytes());
    mac.update(body);
    format!("t={},s={}", ts, hex::encode(mac.finalize().into_bytes()))
}

pub fn whatsapp_envelope(wamid: &str, text: &str) -> Vec<u8> {
    serde_json::json!({
        "entry": [{"changes": [{"value": {
            "metadata": {"display_phone_number": BUSINESS_PHONE},
            "contacts": [{"wa_id": CUSTOMER_PHONE, "profile": {"name": "Caro"}}],
            "messages": [{
                "from": CUSTOMER_PHONE,
                "id": wamid,
                "type": "text",
                "text": {"body": text},
                "timestamp": Utc::now().timestamp().to_string()
            }]
        }}]}]
    })
    .to_string()
    .into_bytes()
}

/// Bridge `message_created` payload for an incoming Instagram message.
pub fn bridge_message_created(message_id: i64, text: &str) -> Vec<u8> {
    serde_json::json!({
        "event": "message_created",
        "id": message_id,
        "content": text,
        "message_type": "incoming",
        "private": false,
        "created_at": Utc::now().timestamp(),
        "account": {"id": BRIDGE_ACCOUNT_ID},
        "inbox": {"name": "Instagram Kicks"},
        "conversation": {
            "id": 31,
            "meta": {"sender": {"id": 512, "identifier": "ig_caro", "name": "Caro"}}
        },
        "sender": {"type": "contact"}
    })
    .to_string()
    .into_bytes()
}

// --- Mock endpoints ---

/// Agent endpoint answering every turn with the same reply text.
pub async fn mount_agent_reply(server: &MockServer, reply: &str) {
    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "reply": reply })),
        )
        .mount(server)
        .await;
}

/// Direct-provider send endpoint for the test tenant's phone id. Accepts
/// text, typing and read posts alike.
pub async fn mount_graph_send(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/{WA_PHONE_ID}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
}

/// Poll the message log until it holds at least `count` entries. Turns run on
/// spawned tasks, so tests observe completion through persistence.
pub async fn wait_for_messages(
    store: &dyn MessageStore,
    conversation_id: &str,
    count: usize,
) -> Vec<Message> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let messages = store
            .recent(conversation_id, 50)
            .await
            .expect("read message log");
        if messages.len() >= count {
            return messages;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} messages, have {}",
            messages.len()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
