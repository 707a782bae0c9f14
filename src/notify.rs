//! Operator alerting for human handoffs.
//!
//! When the agent escalates a conversation, the store owner gets an alert so
//! someone actually picks the thread up during the override window. Alerts
//! are fire-and-forget: a failed notification is logged and never blocks the
//! conversation lock.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::NotifierConfig;
use crate::events::ChannelKind;
use crate::tenant::Tenant;

/// One escalation event, ready to format.
pub struct HandoffAlert<'a> {
    pub tenant: &'a Tenant,
    pub customer_id: &'a str,
    pub customer_name: Option<&'a str>,
    pub channel: ChannelKind,
    /// The agent's summary of why it escalated. May be empty.
    pub reason: &'a str,
    pub correlation_id: &'a str,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn handoff_alert(&self, alert: &HandoffAlert<'_>) -> anyhow::Result<()>;
}

/// Pick the configured notifier backend. Falls back to log-only so handoffs
/// stay observable even before email is configured.
pub fn build_notifier(config: &NotifierConfig) -> Box<dyn Notifier> {
    match EmailNotifier::new(config) {
        Some(email) => Box::new(email),
        None => Box::new(LogNotifier),
    }
}

/// Writes the alert to the service log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn handoff_alert(&self, alert: &HandoffAlert<'_>) -> anyhow::Result<()> {
        warn!(
            "handoff alert: tenant={} channel={} customer={} reason={:?}",
            alert.tenant.id,
            alert.channel.as_str(),
            alert.customer_id,
            alert.reason,
        );
        Ok(())
    }
}

/// Sends handoff alerts through a transactional email API.
pub struct EmailNotifier {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from_email: String,
}

impl EmailNotifier {
    /// Build from config. Returns `None` when disabled or not fully
    /// configured; [`build_notifier`] then degrades to log-only.
    pub fn new(config: &NotifierConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.api_url.is_empty() || config.api_key.is_empty() || config.from_email.is_empty() {
            warn!("notifier enabled but missing api_url, api_key or from_email; using log-only alerts");
            return None;
        }
        Some(EmailNotifier {
            http: crate::channels::http_client(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from_email: config.from_email.clone(),
        })
    }

    fn subject(alert: &HandoffAlert<'_>) -> String {
        let who = alert.customer_name.unwrap_or(alert.customer_id);
        format!("Un cliente necesita atención: {}", who)
    }

    fn body(alert: &HandoffAlert<'_>) -> String {
        let mut lines = vec![
            format!("Tienda: {}", alert.tenant.name),
            format!("Canal: {}", alert.channel.as_str()),
            format!("Cliente: {}", alert.customer_id),
        ];
        if let Some(name) = alert.customer_name {
            lines.push(format!("Nombre: {}", name));
        }
        if !alert.reason.is_empty() {
            lines.push(format!("Motivo: {}", alert.reason));
        }
        lines.push(String::new());
        lines.push(
            "El asistente dejó de responder esta conversación; retómala desde tu bandeja."
                .to_string(),
        );
        lines.push(format!("Referencia: {}", alert.correlation_id));
        lines.join("\n")
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn handoff_alert(&self, alert: &HandoffAlert<'_>) -> anyhow::Result<()> {
        let to = alert.tenant.notify_email.trim();
        if to.is_empty() {
            debug!(
                "tenant {} has no notify_email; skipping handoff alert",
                alert.tenant.id
            );
            return Ok(());
        }

        let payload = serde_json::json!({
            "from": self.from_email,
            "to": [to],
            "subject": Self::subject(alert),
            "text": Self::body(alert),
        });

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!("email API error ({}): {}", status, body));
        }
        Ok(())
    }
}
