mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    bridge_message_created, fast_config, memory_pipeline, mount_graph_send, sign_webhook,
    wait_for_messages, whatsapp_envelope, BRIDGE_ACCOUNT_ID, CUSTOMER_PHONE, TENANT_ID,
    WA_PHONE_ID,
};
use relevo::conversation::{ConversationStatus, ConversationStore, MessageRole, MessageStore};
use relevo::events::ChannelKind;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_health_over_http() {
    let config = fast_config("http://unused.invalid", "http://unused.invalid");
    let (pipeline, _store) = memory_pipeline(config.clone());
    let (_handle, addr) = relevo::gateway::start(Arc::new(config), pipeline)
        .await
        .expect("start gateway");

    let resp = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request");
    assert_eq!(resp.status().as_u16(), 200);
    let json: serde_json::Value = resp.json().await.expect("health body");
    assert_eq!(json["status"], "ok");
    assert!(json["version"].as_str().is_some());
}

#[tokio::test]
async fn test_signed_webhook_flows_to_reply_delivery() {
    let agent = MockServer::start().await;
    let graph = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "reply": "¡Claro! Hay envíos a todo México."
        })))
        .expect(1)
        .mount(&agent)
        .await;
    mount_graph_send(&graph).await;

    let config = fast_config(&format!("{}/agent/reply", agent.uri()), &graph.uri());
    let (pipeline, store) = memory_pipeline(config.clone());
    let (_handle, addr) = relevo::gateway::start(Arc::new(config), pipeline)
        .await
        .expect("start gateway");

    let body = whatsapp_envelope("wamid.H1", "¿hacen envíos?");
    let signature = sign_webhook("wh-secret", chrono::Utc::now().timestamp(), &body);
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/webhooks/whatsapp"))
        .header("X-Relay-Signature", signature)
        .body(body)
        .send()
        .await
        .expect("webhook request");
    assert_eq!(resp.status().as_u16(), 200);
    let json: serde_json::Value = resp.json().await.expect("ack body");
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["events"], 1);

    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
        .await
        .expect("conversation");
    let messages = wait_for_messages(store.as_ref(), &conv.id, 2).await;
    assert_eq!(messages[0].content, "¿hacen envíos?");
    assert_eq!(messages[1].content, "¡Claro! Hay envíos a todo México.");
}

#[tokio::test]
async fn test_tampered_body_is_rejected_before_processing() {
    let agent = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&agent)
        .await;

    let config = fast_config(
        &format!("{}/agent/reply", agent.uri()),
        "http://unused.invalid",
    );
    let (pipeline, store) = memory_pipeline(config.clone());
    let (_handle, addr) = relevo::gateway::start(Arc::new(config), pipeline)
        .await
        .expect("start gateway");

    // Signature computed over the original body, then the body swapped out.
    let original = whatsapp_envelope("wamid.T1", "hola");
    let signature = sign_webhook("wh-secret", chrono::Utc::now().timestamp(), &original);
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/webhooks/whatsapp"))
        .header("X-Relay-Signature", signature)
        .body(whatsapp_envelope("wamid.T1", "hola, soy otro body"))
        .send()
        .await
        .expect("webhook request");
    assert_eq!(resp.status().as_u16(), 401);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
        .await
        .expect("conversation");
    let messages = store.recent(&conv.id, 10).await.expect("read log");
    assert!(messages.is_empty(), "rejected webhook must not persist");
}

#[tokio::test]
async fn test_internal_send_requires_token_and_locks_the_thread() {
    let graph = MockServer::start().await;
    // Manual sends go out without typing or read side effects.
    Mock::given(method("POST"))
        .and(path(format!("/{WA_PHONE_ID}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&graph)
        .await;

    let config = fast_config("http://unused.invalid", &graph.uri());
    let (pipeline, store) = memory_pipeline(config.clone());
    let (_handle, addr) = relevo::gateway::start(Arc::new(config), pipeline)
        .await
        .expect("start gateway");

    let payload = serde_json::json!({
        "to": CUSTOMER_PHONE,
        "text": "Hola, soy Mariana del equipo.",
        "channel_source": "whatsapp",
        "tenant_id": TENANT_ID
    });
    let client = reqwest::Client::new();

    let unauthorized = client
        .post(format!("http://{addr}/internal/send"))
        .json(&payload)
        .send()
        .await
        .expect("send without token");
    assert_eq!(unauthorized.status().as_u16(), 401);

    let resp = client
        .post(format!("http://{addr}/internal/send"))
        .header("X-Internal-Token", "internal-secret")
        .json(&payload)
        .send()
        .await
        .expect("send with token");
    assert_eq!(resp.status().as_u16(), 200);
    let json: serde_json::Value = resp.json().await.expect("send ack");
    assert_eq!(json["status"], "sent");

    // The operator spoke: the thread is theirs for the takeover window.
    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
        .await
        .expect("conversation");
    assert_eq!(conv.status, ConversationStatus::HumanOverride);
    let messages = wait_for_messages(store.as_ref(), &conv.id, 1).await;
    assert_eq!(messages[0].role, MessageRole::HumanSupervisor);
    assert_eq!(messages[0].content, "Hola, soy Mariana del equipo.");
}

#[tokio::test]
async fn test_bridge_webhook_round_trip_replies_into_the_bridge() {
    let agent = MockServer::start().await;
    let bridge = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "reply": "Tenemos la Runner Azul en $1,299."
        })))
        .expect(1)
        .mount(&agent)
        .await;
    // Agent replies carry the automated stamp so the webhook echo filter
    // can tell them apart from operator messages.
    Mock::given(method("POST"))
        .and(path(format!(
            "/api/v1/accounts/{BRIDGE_ACCOUNT_ID}/conversations/31/messages"
        )))
        .and(body_partial_json(serde_json::json!({
            "content": "Tenemos la Runner Azul en $1,299.",
            "message_type": "outgoing",
            "content_attributes": {"automated": true}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&bridge)
        .await;
    // Typing toggle and read receipt.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&bridge)
        .await;

    let mut config = fast_config(&format!("{}/agent/reply", agent.uri()), "http://unused.invalid");
    config.providers.chatwoot.api_base = bridge.uri();
    config.providers.chatwoot.api_token = "cw-api-token".to_string();
    let (pipeline, store) = memory_pipeline(config.clone());
    let (_handle, addr) = relevo::gateway::start(Arc::new(config), pipeline)
        .await
        .expect("start gateway");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/webhooks/chatwoot?secret=cw-secret"))
        .header("content-type", "application/json")
        .body(bridge_message_created(231, "¿cuánto cuesta la azul?"))
        .send()
        .await
        .expect("bridge webhook");
    assert_eq!(resp.status().as_u16(), 200);
    let json: serde_json::Value = resp.json().await.expect("ack body");
    assert_eq!(json["events"], 1);

    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Instagram, "ig_caro")
        .await
        .expect("conversation");
    let messages = wait_for_messages(store.as_ref(), &conv.id, 2).await;
    assert_eq!(messages[0].content, "¿cuánto cuesta la azul?");
    assert_eq!(messages[1].role, MessageRole::Assistant);
}
