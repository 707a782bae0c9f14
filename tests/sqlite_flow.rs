mod common;

use std::time::Duration;

use common::{
    echo_event, fast_config, mount_graph_send, sqlite_pipeline, text_event, wait_for_messages,
    CUSTOMER_PHONE, TENANT_ID, WA_PHONE_ID,
};
use relevo::conversation::{ConversationStatus, ConversationStore, MessageRole, MessageStore};
use relevo::events::ChannelKind;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_completed_turn_survives_a_restart() {
    let tmp = TempDir::new().expect("create temp dir");
    let db_path = tmp.path().join("relevo.db");

    let agent = MockServer::start().await;
    let graph = MockServer::start().await;
    // One call total: the replay after the restart must be recognized.
    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "reply": "Llegan en 2 a 3 días."
        })))
        .expect(1)
        .mount(&agent)
        .await;
    mount_graph_send(&graph).await;

    let config = fast_config(&format!("{}/agent/reply", agent.uri()), &graph.uri());

    let conv_id = {
        let (pipeline, store) = sqlite_pipeline(config.clone(), &db_path);
        pipeline
            .ingest(vec![text_event("d1", "¿cuándo llega mi pedido?")])
            .await;
        let conv = store
            .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
            .await
            .expect("conversation");
        wait_for_messages(store.as_ref(), &conv.id, 2).await;
        conv.id
    };

    // Fresh process over the same database file.
    let (pipeline, store) = sqlite_pipeline(config, &db_path);
    let reloaded = store
        .get(&conv_id)
        .await
        .expect("lookup")
        .expect("conversation survives");
    assert_eq!(reloaded.tenant_id, TENANT_ID);
    let messages = store.recent(&conv_id, 10).await.expect("read log");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "¿cuándo llega mi pedido?");
    assert_eq!(messages[1].content, "Llegan en 2 a 3 días.");

    // The dedup claim is in the same database: a provider replay after the
    // restart is still a duplicate.
    pipeline
        .ingest(vec![text_event("d1", "¿cuándo llega mi pedido?")])
        .await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(store.recent(&conv_id, 10).await.expect("read log").len(), 2);
}

#[tokio::test]
async fn test_takeover_window_survives_a_restart() {
    let tmp = TempDir::new().expect("create temp dir");
    let db_path = tmp.path().join("relevo.db");

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

    {
        let (pipeline, _store) = sqlite_pipeline(config.clone(), &db_path);
        pipeline
            .ingest(vec![echo_event("op1", "Yo sigo con este cliente")])
            .await;
    }

    let (pipeline, store) = sqlite_pipeline(config, &db_path);
    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
        .await
        .expect("conversation");
    assert_eq!(conv.status, ConversationStatus::HumanOverride);
    assert!(conv.human_override_until.is_some());

    pipeline
        .ingest(vec![text_event("c9", "ok, aquí espero")])
        .await;
    let messages = wait_for_messages(store.as_ref(), &conv.id, 2).await;
    assert_eq!(messages[1].role, MessageRole::User);
    assert_eq!(messages[1].content, "ok, aquí espero");

    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_handoff_locks_thread_and_sends_the_reason() {
    let tmp = TempDir::new().expect("create temp dir");
    let db_path = tmp.path().join("relevo.db");

    let agent = MockServer::start().await;
    let graph = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agent/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "handoff": "Cliente pide factura con RFC"
        })))
        .expect(1)
        .mount(&agent)
        .await;
    // Single handoff bubble: typing + send + read.
    Mock::given(method("POST"))
        .and(path(format!("/{WA_PHONE_ID}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(3)
        .mount(&graph)
        .await;

    let config = fast_config(&format!("{}/agent/reply", agent.uri()), &graph.uri());
    let (pipeline, store) = sqlite_pipeline(config, &db_path);

    pipeline
        .ingest(vec![text_event("h1", "necesito factura con RFC")])
        .await;

    let conv = store
        .get_or_create(TENANT_ID, ChannelKind::Whatsapp, CUSTOMER_PHONE)
        .await
        .expect("conversation");
    let messages = wait_for_messages(store.as_ref(), &conv.id, 2).await;
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::HumanSupervisor);
    assert_eq!(messages[1].content, "Cliente pide factura con RFC");

    let locked = store
        .get(&conv.id)
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(locked.status, ConversationStatus::HumanOverride);
    assert!(locked.human_override_until.is_some());

    // The next customer message stays gated.
    pipeline.ingest(vec![text_event("h2", "gracias")]).await;
    let messages = wait_for_messages(store.as_ref(), &conv.id, 3).await;
    assert_eq!(messages[2].role, MessageRole::User);
    tokio::time::sleep(Duration::from_millis(200)).await;
}
