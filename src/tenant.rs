use crate::errors::RelevoError;
use crate::events::{InboundEvent, Provider};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One business on the platform. Maintained by external admin tooling; the
/// relay only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Digits-only business phone used for direct-provider resolution.
    pub business_phone: String,
    pub active: bool,
    /// Prompt template. `{{store_name}}`, `{{store_description}}` and
    /// `{{catalog}}` are substituted per invocation.
    pub system_prompt: String,
    pub store_description: String,
    /// Store knowledge text injected into the prompt.
    pub catalog_text: String,
    /// Recipient for handoff alerts.
    pub notify_email: String,
    /// Direct-provider send credentials, per tenant.
    pub wa_phone_id: String,
    pub wa_token: String,
    /// Bridge account owned by this tenant, when it has one.
    pub bridge_account_id: Option<i64>,
}

/// Read-only tenant lookup seam.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant_by_id(&self, id: &str) -> Result<Option<Tenant>>;
    async fn tenant_by_phone(&self, digits: &str) -> Result<Option<Tenant>>;
    async fn tenant_by_bridge_account(&self, account_id: i64) -> Result<Option<Tenant>>;
}

/// Strip everything but digits so `+52 1 55 1234-5678` and `5215512345678`
/// resolve identically.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Map an event to its tenant.
///
/// Source order: explicit tenant id on the payload, then the bridge account
/// for bridge events, then the business phone the message was sent to. An
/// explicit id that matches nothing is a hard failure, not a fallthrough.
pub async fn resolve(store: &dyn TenantStore, event: &InboundEvent) -> Result<Tenant, RelevoError> {
    let tenant = if let Some(hint) = &event.tenant_hint {
        store
            .tenant_by_id(hint)
            .await
            .map_err(RelevoError::Internal)?
            .ok_or_else(|| RelevoError::TenantNotFound(hint.clone()))?
    } else if event.provider == Provider::Chatwoot {
        let account_id = event
            .routing
            .map(|r| r.account_id)
            .ok_or_else(|| RelevoError::MalformedPayload("bridge event without account id".into()))?;
        store
            .tenant_by_bridge_account(account_id)
            .await
            .map_err(RelevoError::Internal)?
            .ok_or_else(|| RelevoError::TenantNotFound(format!("bridge account {account_id}")))?
    } else {
        let digits = normalize_phone(&event.to);
        if digits.is_empty() {
            return Err(RelevoError::MalformedPayload(format!(
                "business number {:?} has no digits",
                event.to
            )));
        }
        store
            .tenant_by_phone(&digits)
            .await
            .map_err(RelevoError::Internal)?
            .ok_or_else(|| RelevoError::TenantNotFound(digits))?
    };

    if !tenant.active {
        return Err(RelevoError::TenantInactive(tenant.id));
    }
    Ok(tenant)
}
