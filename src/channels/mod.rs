use async_trait::async_trait;

use crate::events::{BridgeRouting, InboundEvent};

pub mod chatwoot;
pub mod whatsapp;

pub use chatwoot::ChatwootChannel;
pub use whatsapp::WhatsappChannel;

/// Where one turn's replies go. Built from the originating inbound event and
/// passed explicitly to every send call; bridge routing handles are echoed
/// back unchanged.
#[derive(Debug, Clone)]
pub struct DeliveryAddress {
    /// Platform-scoped customer id (phone digits or social account id).
    pub to: String,
    pub routing: Option<BridgeRouting>,
    /// Provider id of the inbound message, used for read receipts.
    pub inbound_message_id: String,
}

impl DeliveryAddress {
    pub fn for_event(event: &InboundEvent) -> Self {
        DeliveryAddress {
            to: event.from.clone(),
            routing: event.routing,
            inbound_message_id: event.provider_message_id.clone(),
        }
    }
}

/// Outbound capability of one provider. Typing and read receipts default to
/// no-ops for providers that lack them.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_text(&self, address: &DeliveryAddress, text: &str) -> anyhow::Result<()>;

    async fn send_image(&self, address: &DeliveryAddress, url: &str) -> anyhow::Result<()>;

    async fn send_typing(&self, _address: &DeliveryAddress) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_read(&self, _address: &DeliveryAddress) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared HTTP client for provider calls. Bounded timeouts so a hung provider
/// API cannot stall a drain task indefinitely.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
