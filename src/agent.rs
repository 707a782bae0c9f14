//! Reasoning-engine invocation.
//!
//! The relay never composes replies itself. Each aggregated turn is shipped
//! to a separate agent service over HTTP together with the tenant's rendered
//! prompt, recent history, and per-tenant send credentials; the response is
//! interpreted as either a reply (ordered text/image parts) or a handoff to
//! a human operator.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::conversation::Message;
use crate::errors::RelevoError;
use crate::events::ChannelKind;
use crate::sequencer::ReplyPart;
use crate::tenant::Tenant;

/// Marker the agent embeds in reply text to request escalation to a human.
pub const HANDOFF_SENTINEL: &str = "[HANDOFF]";

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// System prompt used when a tenant has not configured one.
const DEFAULT_PROMPT: &str = "Eres el asistente de ventas de {{store_name}}. \
{{store_description}}\n\nCatálogo disponible:\n{{catalog}}\n\nResponde en \
español con mensajes cortos y claros. Si el cliente pide hablar con una \
persona, o pide algo que no puedes resolver con el catálogo, responde \
únicamente con [HANDOFF] seguido de un resumen breve para el equipo.";

/// Render a tenant's system prompt, substituting the store placeholders
/// `{{store_name}}`, `{{store_description}}` and `{{catalog}}`. Falls back
/// to [`DEFAULT_PROMPT`] when the tenant has no prompt of its own.
pub fn render_prompt(tenant: &Tenant) -> String {
    let template = if tenant.system_prompt.trim().is_empty() {
        DEFAULT_PROMPT
    } else {
        tenant.system_prompt.as_str()
    };
    template
        .replace("{{store_name}}", &tenant.name)
        .replace("{{store_description}}", &tenant.store_description)
        .replace("{{catalog}}", &tenant.catalog_text)
}

/// What the agent asked the relay to do with a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Send these parts to the customer, in order.
    Reply(Vec<ReplyPart>),
    /// Stop replying and alert a human. `message` is delivered to the
    /// customer as the only bubble of the turn; it may be empty, in which
    /// case the caller supplies a stock line.
    Handoff { message: String },
}

/// Everything the engine needs to answer one aggregated turn.
pub struct AgentRequest<'a> {
    pub tenant: &'a Tenant,
    /// Oldest-first recent messages, already capped to the history limit.
    pub history: &'a [Message],
    /// The aggregated customer text for this turn.
    pub message: &'a str,
    pub customer_id: &'a str,
    pub customer_name: Option<&'a str>,
    pub channel: ChannelKind,
    pub correlation_id: &'a str,
}

/// HTTP client for the agent service, with transport-level retry.
pub struct AgentClient {
    http: reqwest::Client,
    config: AgentConfig,
    internal_token: String,
}

impl AgentClient {
    pub fn new(
        http: reqwest::Client,
        config: AgentConfig,
        internal_token: impl Into<String>,
    ) -> Self {
        AgentClient {
            http,
            config,
            internal_token: internal_token.into(),
        }
    }

    /// Invoke the agent once per turn, retrying transport failures with
    /// exponential backoff and jitter.
    ///
    /// Only connect/timeout errors are retried. Any response from the
    /// engine, 2xx or not, means the request arrived; retrying it could
    /// make the engine answer the same turn twice.
    pub async fn invoke(&self, request: &AgentRequest<'_>) -> Result<AgentOutcome, RelevoError> {
        let payload = self.build_payload(request);
        let mut last_error: Option<RelevoError> = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                warn!(
                    "agent retry {}/{} after error: {}",
                    attempt,
                    self.config.max_attempts - 1,
                    last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                );
            }
            debug!("agent call (attempt {})", attempt);

            match self.call(&payload, request.correlation_id).await {
                Ok(body) => return parse_reply(&body),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_error = Some(err);
                    if attempt + 1 < self.config.max_attempts {
                        let base = (self.config.initial_delay_ms as f64
                            * BACKOFF_MULTIPLIER.powi(attempt as i32))
                        .min(self.config.max_delay_ms as f64)
                            as u64;
                        // Jitter up to 25% so parallel drains don't retry in lockstep.
                        let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
                        debug!(
                            "waiting {}ms before retry ({}ms base + {}ms jitter)",
                            base + jitter,
                            base,
                            jitter
                        );
                        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RelevoError::Agent {
            message: "agent call failed with no recorded error".into(),
            retryable: false,
        }))
    }

    async fn call(&self, payload: &Value, correlation_id: &str) -> Result<String, RelevoError> {
        let response = self
            .http
            .post(&self.config.url)
            .header("X-Internal-Token", &self.internal_token)
            .header("X-Correlation-Id", correlation_id)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(payload)
            .send()
            .await
            .map_err(|e| RelevoError::Agent {
                message: format!("agent transport error: {e}"),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RelevoError::Agent {
                message: format!("agent API error ({}): {}", status, body),
                retryable: false,
            });
        }

        response.text().await.map_err(|e| RelevoError::Agent {
            message: format!("agent response read failed: {e}"),
            retryable: true,
        })
    }

    fn build_payload(&self, request: &AgentRequest<'_>) -> Value {
        let history: Vec<Value> = request
            .history
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        json!({
            "tenant_id": request.tenant.id,
            "system_prompt": render_prompt(request.tenant),
            "history": history,
            "message": request.message,
            "customer": {
                "id": request.customer_id,
                "name": request.customer_name,
            },
            "channel": request.channel.as_str(),
            "credentials": {
                "whatsapp_phone_id": request.tenant.wa_phone_id,
                "whatsapp_token": request.tenant.wa_token,
            },
        })
    }
}

/// Interpret an engine response body.
///
/// Accepted shapes, most to least structured:
/// - `{"handoff": "reason"}` / `{"handoff": {"message": ...}}` /
///   `{"handoff": true, "message": ...}`
/// - `{"parts": [{"type": "text", ...}, {"type": "image", "url": ...}, "plain", ...]}`
/// - `{"reply": "..."}`, also under `message` or `text`
/// - free text, optionally carrying `|||` delimiters for the sequencer
///
/// The handoff sentinel is honored wherever it appears in text.
fn parse_reply(body: &str) -> Result<AgentOutcome, RelevoError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(RelevoError::Agent {
            message: "agent returned an empty response".into(),
            retryable: false,
        });
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => parse_structured(&value),
        Err(_) => Ok(outcome_from_text(trimmed)),
    }
}

fn parse_structured(value: &Value) -> Result<AgentOutcome, RelevoError> {
    if let Some(text) = value.as_str() {
        return Ok(outcome_from_text(text));
    }

    // A 2xx with an error body still means the engine saw the request and
    // declined it; retrying would not change the answer.
    if let Some(error) = value.get("error") {
        let detail = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RelevoError::Agent {
            message: format!("agent returned an error: {detail}"),
            retryable: false,
        });
    }

    if let Some(outcome) = parse_handoff(value) {
        return Ok(outcome);
    }

    if let Some(parts) = value.get("parts").and_then(Value::as_array) {
        let collected = collect_parts(parts);
        if collected.is_empty() {
            return Err(RelevoError::Agent {
                message: "agent returned no usable parts".into(),
                retryable: false,
            });
        }
        return Ok(finish_parts(collected));
    }

    for key in ["reply", "message", "text"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            return Ok(outcome_from_text(text));
        }
    }

    Err(RelevoError::Agent {
        message: format!("unrecognized agent reply shape: {value}"),
        retryable: false,
    })
}

fn parse_handoff(value: &Value) -> Option<AgentOutcome> {
    let message = match value.get("handoff")? {
        Value::String(reason) => reason.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Value::Bool(true) => value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        // `handoff: false` or null means no handoff was requested.
        _ => return None,
    };
    Some(AgentOutcome::Handoff {
        message: message.trim().to_string(),
    })
}

fn collect_parts(parts: &[Value]) -> Vec<ReplyPart> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.as_str() {
            push_text(&mut out, text);
            continue;
        }
        let kind = part.get("type").and_then(Value::as_str).unwrap_or("");
        if let Some(url) = part.get("imageUrl").and_then(Value::as_str) {
            push_image(&mut out, url);
        } else if kind == "image" {
            if let Some(url) = part.get("url").and_then(Value::as_str) {
                push_image(&mut out, url);
            }
        } else if let Some(text) = part.get("text").and_then(Value::as_str) {
            push_text(&mut out, text);
        }
    }
    out
}

fn push_text(out: &mut Vec<ReplyPart>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        out.push(ReplyPart::Text(text.to_string()));
    }
}

fn push_image(out: &mut Vec<ReplyPart>, url: &str) {
    let url = url.trim();
    if !url.is_empty() {
        out.push(ReplyPart::Image(url.to_string()));
    }
}

/// A sentinel in any text part turns the whole turn into a handoff.
fn finish_parts(parts: Vec<ReplyPart>) -> AgentOutcome {
    for part in &parts {
        if let ReplyPart::Text(text) = part {
            if text.contains(HANDOFF_SENTINEL) {
                return AgentOutcome::Handoff {
                    message: strip_sentinel(text),
                };
            }
        }
    }
    AgentOutcome::Reply(parts)
}

fn outcome_from_text(text: &str) -> AgentOutcome {
    if text.contains(HANDOFF_SENTINEL) {
        AgentOutcome::Handoff {
            message: strip_sentinel(text),
        }
    } else {
        AgentOutcome::Reply(vec![ReplyPart::Text(text.to_string())])
    }
}

/// Remove the sentinel and collapse the whitespace it leaves behind.
fn strip_sentinel(text: &str) -> String {
    text.replace(HANDOFF_SENTINEL, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
