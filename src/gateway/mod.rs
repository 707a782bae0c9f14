//! HTTP edge of the relay.
//!
//! Webhook receivers verify provenance on the raw body, normalize the payload
//! and acknowledge immediately; the pipeline runs on spawned tasks so provider
//! delivery timeouts never see our processing latency. The internal send
//! endpoint is the only route that waits for its work to finish.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::channels::{chatwoot, whatsapp};
use crate::config::Config;
use crate::errors::RelevoError;
use crate::events::InboundEvent;
use crate::pipeline::{ManualSend, Pipeline};

/// Max webhook payload size: 1 MB.
const WEBHOOK_MAX_BODY: usize = 1_048_576;

/// Header carrying the `t=<ts>,s=<hex>` signature on direct webhooks.
const SIGNATURE_HEADER: &str = "X-Relay-Signature";

/// Header authenticating calls from internal tooling.
const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

#[derive(Clone)]
pub struct GatewayState {
    pipeline: Arc<Pipeline>,
    config: Arc<Config>,
}

impl GatewayState {
    pub fn new(pipeline: Arc<Pipeline>, config: Arc<Config>) -> Self {
        GatewayState { pipeline, config }
    }
}

fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/whatsapp", post(whatsapp_webhook_handler))
        .route("/webhooks/chatwoot", post(chatwoot_webhook_handler))
        .route("/internal/send", post(internal_send_handler))
        .with_state(state)
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION
    }))
}

/// POST /webhooks/whatsapp — signed direct-provider webhook.
async fn whatsapp_webhook_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = &state.config.providers.whatsapp;
    if !provider.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    if body.len() > WEBHOOK_MAX_BODY {
        warn!("whatsapp webhook: payload too large ({} bytes)", body.len());
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        warn!("whatsapp webhook: missing signature header");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if let Err(e) = whatsapp::verify_signature(
        &provider.webhook_secret,
        signature,
        &body,
        chrono::Utc::now().timestamp(),
    ) {
        warn!("whatsapp webhook rejected: {e}");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("whatsapp webhook: body is not JSON: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    accept(&state.pipeline, whatsapp::parse_webhook(&payload), "whatsapp")
}

#[derive(Debug, Deserialize)]
struct BridgeQuery {
    secret: Option<String>,
}

/// POST /webhooks/chatwoot?secret=... — bridge webhook.
async fn chatwoot_webhook_handler(
    State(state): State<GatewayState>,
    Query(query): Query<BridgeQuery>,
    body: Bytes,
) -> Response {
    let provider = &state.config.providers.chatwoot;
    if !provider.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    if body.len() > WEBHOOK_MAX_BODY {
        warn!("bridge webhook: payload too large ({} bytes)", body.len());
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    if let Err(e) = chatwoot::verify_secret(&provider.webhook_secret, query.secret.as_deref()) {
        warn!("bridge webhook rejected: {e}");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("bridge webhook: body is not JSON: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    accept(&state.pipeline, chatwoot::parse_webhook(&payload), "bridge")
}

/// Acknowledge now, process later. Provider retry clocks start at delivery,
/// not at our turn completion.
fn accept(pipeline: &Arc<Pipeline>, events: Vec<InboundEvent>, source: &str) -> Response {
    let count = events.len();
    debug!("{} webhook: accepted {} event(s)", source, count);
    if count > 0 {
        let pipeline = Arc::clone(pipeline);
        tokio::spawn(async move {
            pipeline.ingest(events).await;
        });
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "accepted", "events": count})),
    )
        .into_response()
}

/// POST /internal/send — operator message relayed through internal tooling.
async fn internal_send_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !token_matches(&state.config.server.internal_token, token) {
        warn!("internal send: bad or missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let send: ManualSend = match serde_json::from_slice(&body) {
        Ok(send) => send,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("invalid body: {e}")})),
            )
                .into_response();
        }
    };

    match state.pipeline.manual_send(&send).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "sent"})),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// Unset token locks the endpoint rather than opening it.
fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    if expected.is_empty() {
        return false;
    }
    let Some(provided) = provided else {
        return false;
    };
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn error_response(err: RelevoError) -> Response {
    let status = match &err {
        RelevoError::Auth(_) => StatusCode::UNAUTHORIZED,
        RelevoError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        RelevoError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        RelevoError::TenantInactive(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

/// Bind and serve. Returns the join handle and the bound address so callers
/// (and tests binding port 0) know where the server landed.
pub async fn start(
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
) -> Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr)> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_router(GatewayState::new(pipeline, config));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!("gateway listening on {}", local_addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {}", e);
        }
    });

    Ok((handle, local_addr))
}
