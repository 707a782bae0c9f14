use crate::config::DebounceConfig;
use crate::events::InboundEvent;
use crate::store::KeyValueStore;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Coalesces rapid message bursts from one sender into a single agent turn.
///
/// People type in fragments ("Hola" / "quiero" / "zapatillas"); invoking the
/// agent per fragment wastes calls and produces overlapping replies. Each
/// text fragment lands in a per-sender buffer in the shared store and re-arms
/// an inactivity deadline; the first fragment also claims a drain lock so
/// exactly one task (across all relay instances) waits out the quiet period
/// and processes the burst.
///
/// All three keys live in the shared store with TTLs. There is no
/// cancellation: a crashed drain simply stops refreshing its lock and the
/// key frees itself.
pub struct Debouncer {
    kv: Arc<dyn KeyValueStore>,
    config: DebounceConfig,
}

/// What `enqueue` did with a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// This call won the drain lock; the caller owns the wait-drain-finish
    /// cycle for the key.
    ClaimedDrain,
    /// A drain elsewhere already owns the key; nothing more to do.
    BufferedOnly,
    /// Flood guard tripped; the fragment was discarded.
    Dropped,
}

fn buffer_key(sender_key: &str) -> String {
    format!("buffer:{sender_key}")
}

fn deadline_key(sender_key: &str) -> String {
    format!("deadline:{sender_key}")
}

fn lock_key(sender_key: &str) -> String {
    format!("drain:{sender_key}")
}

impl Debouncer {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: DebounceConfig) -> Self {
        Debouncer { kv, config }
    }

    fn quiet(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.config.quiet_secs).unwrap_or(i64::MAX))
    }

    fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl_secs)
    }

    /// Buffer a text fragment and re-arm the sender's inactivity deadline.
    pub async fn enqueue(&self, event: &InboundEvent) -> Result<Enqueued> {
        let sender_key = event.sender_key();
        let raw = serde_json::to_string(event)?;
        if !self
            .kv
            .push(&buffer_key(&sender_key), &raw, self.config.max_fragments)
            .await?
        {
            warn!(
                sender_key = %sender_key,
                correlation_id = %event.correlation_id,
                cap = self.config.max_fragments,
                "fragment buffer full, dropping fragment"
            );
            return Ok(Enqueued::Dropped);
        }

        let deadline = Utc::now() + self.quiet();
        self.kv
            .set(
                &deadline_key(&sender_key),
                &deadline.timestamp_millis().to_string(),
                Some(self.key_ttl()),
            )
            .await?;

        let claimed = self
            .kv
            .set_if_absent(
                &lock_key(&sender_key),
                &event.correlation_id,
                Some(self.key_ttl()),
            )
            .await?;
        debug!(
            sender_key = %sender_key,
            correlation_id = %event.correlation_id,
            claimed_drain = claimed,
            "buffered fragment"
        );
        Ok(if claimed {
            Enqueued::ClaimedDrain
        } else {
            Enqueued::BufferedOnly
        })
    }

    /// Poll until the sender has been quiet past the deadline, then
    /// atomically take the buffered fragments (oldest first).
    ///
    /// The wait is bounded by the lock TTL: a sender who never stops typing
    /// gets drained anyway rather than extending the claim past its lease.
    pub async fn wait_and_drain(&self, sender_key: &str) -> Result<Vec<InboundEvent>> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let started = tokio::time::Instant::now();
        let max_wait = Duration::from_secs(self.config.lock_ttl_secs);

        loop {
            match self.read_deadline(sender_key).await? {
                Some(deadline) if deadline > Utc::now() => {
                    if started.elapsed() >= max_wait {
                        warn!(
                            sender_key = %sender_key,
                            "drain lease exhausted while sender still active, draining early"
                        );
                        break;
                    }
                    // stay alive past the original lease while legitimately waiting
                    self.kv
                        .set(&lock_key(sender_key), "draining", Some(self.key_ttl()))
                        .await?;
                    tokio::time::sleep(poll).await;
                }
                // deadline passed, or key expired: the burst is over
                _ => break,
            }
        }

        let raw = self.kv.take_all(&buffer_key(sender_key)).await?;
        let mut events = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<InboundEvent>(&entry) {
                Ok(event) => events.push(event),
                Err(e) => warn!(sender_key = %sender_key, error = %e, "skipping undecodable fragment"),
            }
        }
        Ok(events)
    }

    /// Close out a drain cycle. Fragments that landed while the turn was
    /// being processed start a new cycle under the same claim: the caller
    /// must loop back into [`Self::wait_and_drain`] when this returns false.
    pub async fn finish(&self, sender_key: &str) -> Result<bool> {
        if self.kv.list_len(&buffer_key(sender_key)).await? > 0 {
            // late fragments already re-armed the deadline via enqueue
            self.kv
                .set(&lock_key(sender_key), "draining", Some(self.key_ttl()))
                .await?;
            debug!(sender_key = %sender_key, "late fragments present, starting another cycle");
            return Ok(false);
        }
        self.kv.delete(&deadline_key(sender_key)).await?;
        self.kv.delete(&lock_key(sender_key)).await?;
        Ok(true)
    }

    async fn read_deadline(&self, sender_key: &str) -> Result<Option<DateTime<Utc>>> {
        let raw = self.kv.get(&deadline_key(sender_key)).await?;
        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

/// Join drained fragments into the aggregated user turn, newline-separated
/// in arrival order.
pub fn aggregate_text(events: &[InboundEvent]) -> String {
    events
        .iter()
        .filter_map(|e| e.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelKind, EventKind, Provider};
    use crate::store::MemoryStore;

    fn config(quiet_secs: u64) -> DebounceConfig {
        DebounceConfig {
            quiet_secs,
            lock_ttl_secs: quiet_secs + 4,
            poll_interval_ms: 20,
            max_fragments: 5,
        }
    }

    fn fragment(text: &str, n: u32) -> InboundEvent {
        InboundEvent {
            provider: Provider::Whatsapp,
            channel: ChannelKind::Whatsapp,
            event_id: format!("evt_{n}"),
            provider_message_id: format!("wamid.{n}"),
            from: "5215512345678".into(),
            to: "5215500000001".into(),
            text: Some(text.to_string()),
            media: vec![],
            customer_name: None,
            kind: EventKind::Text,
            tenant_hint: None,
            routing: None,
            timestamp: Utc::now(),
            correlation_id: format!("corr_{n}"),
        }
    }

    #[tokio::test]
    async fn first_fragment_claims_drain() {
        let debouncer = Debouncer::new(Arc::new(MemoryStore::new()), config(1));
        assert_eq!(
            debouncer.enqueue(&fragment("Hola", 1)).await.unwrap(),
            Enqueued::ClaimedDrain
        );
        assert_eq!(
            debouncer.enqueue(&fragment("quiero", 2)).await.unwrap(),
            Enqueued::BufferedOnly
        );
    }

    #[tokio::test]
    async fn drains_burst_in_order_after_quiet() {
        let debouncer = Debouncer::new(Arc::new(MemoryStore::new()), config(1));
        let key = fragment("x", 0).sender_key();

        debouncer.enqueue(&fragment("Hola", 1)).await.unwrap();
        debouncer.enqueue(&fragment("quiero", 2)).await.unwrap();
        debouncer.enqueue(&fragment("zapatillas", 3)).await.unwrap();

        let drained = debouncer.wait_and_drain(&key).await.unwrap();
        assert_eq!(aggregate_text(&drained), "Hola\nquiero\nzapatillas");
        assert!(debouncer.finish(&key).await.unwrap());

        // fully released: a new fragment claims again
        assert_eq!(
            debouncer.enqueue(&fragment("otra", 4)).await.unwrap(),
            Enqueued::ClaimedDrain
        );
    }

    #[tokio::test]
    async fn flood_guard_drops_overflow() {
        let debouncer = Debouncer::new(Arc::new(MemoryStore::new()), config(1));
        for n in 0..5 {
            assert_ne!(
                debouncer.enqueue(&fragment("spam", n)).await.unwrap(),
                Enqueued::Dropped
            );
        }
        assert_eq!(
            debouncer.enqueue(&fragment("spam", 99)).await.unwrap(),
            Enqueued::Dropped
        );
    }

    #[tokio::test]
    async fn late_fragment_starts_new_cycle_under_same_claim() {
        let debouncer = Debouncer::new(Arc::new(MemoryStore::new()), config(1));
        let key = fragment("x", 0).sender_key();

        debouncer.enqueue(&fragment("Hola", 1)).await.unwrap();
        let first = debouncer.wait_and_drain(&key).await.unwrap();
        assert_eq!(first.len(), 1);

        // lands while the first turn is "processing"
        assert_eq!(
            debouncer.enqueue(&fragment("y mi pedido?", 2)).await.unwrap(),
            Enqueued::BufferedOnly
        );

        assert!(!debouncer.finish(&key).await.unwrap());
        let second = debouncer.wait_and_drain(&key).await.unwrap();
        assert_eq!(aggregate_text(&second), "y mi pedido?");
        assert!(debouncer.finish(&key).await.unwrap());
    }

    #[test]
    fn aggregate_skips_empty_fragments() {
        let mut a = fragment("Hola", 1);
        a.text = Some(String::new());
        let b = fragment("quiero", 2);
        let c = fragment("zapatillas", 3);
        assert_eq!(aggregate_text(&[a, b, c]), "quiero\nzapatillas");
    }
}
