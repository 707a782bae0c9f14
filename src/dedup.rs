use crate::events::{InboundEvent, Provider};
use crate::store::KeyValueStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Idempotency guard over provider event ids.
///
/// Providers redeliver webhooks on slow acks and network blips; a consumed
/// id stays poisoned for the configured TTL (at least a day). The check runs
/// when an aggregated turn is handed to the agent, not per fragment, so the
/// fragments of one burst never collide with each other.
pub struct Deduplicator {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl_hours: u64) -> Self {
        Deduplicator {
            kv,
            ttl: Duration::from_secs(ttl_hours * 3600),
        }
    }

    /// Claim one event id. False means it was already consumed.
    pub async fn claim(&self, provider: Provider, event_id: &str) -> Result<bool> {
        let key = format!("dedup:{}:{}", provider.as_str(), event_id);
        self.kv.set_if_absent(&key, "1", Some(self.ttl)).await
    }

    /// Keep only events whose ids have not been consumed before, claiming
    /// them in the process. An empty result means the whole turn was a
    /// redelivery.
    pub async fn filter_fresh(&self, events: Vec<InboundEvent>) -> Result<Vec<InboundEvent>> {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if self.claim(event.provider, &event.event_id).await? {
                fresh.push(event);
            } else {
                debug!(
                    correlation_id = %event.correlation_id,
                    event_id = %event.event_id,
                    "dropping redelivered event"
                );
            }
        }
        Ok(fresh)
    }
}
