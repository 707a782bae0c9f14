use super::KeyValueStore;
use crate::conversation::{
    Conversation, ConversationStatus, ConversationStore, Message, MessageStore,
};
use crate::events::ChannelKind;
use crate::tenant::{Tenant, TenantStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, (String, Option<DateTime<Utc>>)>,
    lists: HashMap<String, Vec<String>>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    tenants: Vec<Tenant>,
}

/// Process-local implementation of every store seam. Used by unit tests and
/// by single-instance dry runs; real deployments use [`super::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tenants.retain(|t| t.id != tenant.id);
        inner.tenants.push(tenant);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn live(entry: &(String, Option<DateTime<Utc>>), now: DateTime<Utc>) -> bool {
    match entry.1 {
        Some(expires) => expires > now,
        None => true,
    }
}

fn expiry(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    ttl.map(|d| now + chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let inner = self.lock();
        Ok(inner
            .kv
            .get(key)
            .filter(|entry| live(entry, now))
            .map(|entry| entry.0.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner
            .kv
            .insert(key.to_string(), (value.to_string(), expiry(ttl, now)));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock();
        if let Some(existing) = inner.kv.get(key)
            && live(existing, now)
        {
            return Ok(false);
        }
        inner
            .kv
            .insert(key.to_string(), (value.to_string(), expiry(ttl, now)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().kv.remove(key);
        Ok(())
    }

    async fn push(&self, key: &str, value: &str, cap: usize) -> Result<bool> {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        if list.len() >= cap {
            return Ok(false);
        }
        list.push(value.to_string());
        Ok(true)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lock().lists.get(key).map_or(0, Vec::len))
    }

    async fn take_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.lock().lists.remove(key).unwrap_or_default())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create(
        &self,
        tenant_id: &str,
        channel: ChannelKind,
        external_user_id: &str,
    ) -> Result<Conversation> {
        let mut inner = self.lock();
        if let Some(existing) = inner.conversations.iter().find(|c| {
            c.tenant_id == tenant_id && c.channel == channel && c.external_user_id == external_user_id
        }) {
            return Ok(existing.clone());
        }
        let fresh = Conversation::new(tenant_id, channel, external_user_id, Utc::now());
        inner.conversations.push(fresh.clone());
        Ok(fresh)
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>, preview: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.last_message_at = at;
            conv.last_message_preview = preview.to_string();
        }
        Ok(())
    }

    async fn apply_override(&self, id: &str, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.status = ConversationStatus::HumanOverride;
            conv.human_override_until = Some(until);
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<()> {
        let mut inner = self.lock();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: &Message) -> Result<()> {
        self.lock().messages.push(message.clone());
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let inner = self.lock();
        let mut matching: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // insertion order doubles as creation order here
        if matching.len() > limit {
            matching.drain(..matching.len() - limit);
        }
        Ok(matching)
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn tenant_by_id(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(self.lock().tenants.iter().find(|t| t.id == id).cloned())
    }

    async fn tenant_by_phone(&self, digits: &str) -> Result<Option<Tenant>> {
        Ok(self
            .lock()
            .tenants
            .iter()
            .find(|t| t.business_phone == digits)
            .cloned())
    }

    async fn tenant_by_bridge_account(&self, account_id: i64) -> Result<Option<Tenant>> {
        Ok(self
            .lock()
            .tenants
            .iter()
            .find(|t| t.bridge_account_id == Some(account_id))
            .cloned())
    }
}
