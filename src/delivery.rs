//! Paced outbound delivery.
//!
//! Bubbles go out strictly in order, never in parallel: pacing and
//! conversational coherence both depend on sequence. Before each bubble the
//! customer sees a typing indicator and a short human-pacing delay; after
//! it, the originating inbound message is marked read. Typing and read
//! receipts are fire-and-forget with logged failures. A bubble that fails
//! to send is logged and the rest of the sequence still goes out.

use std::time::Duration;

use tracing::{debug, warn};

use crate::channels::{Channel, DeliveryAddress};
use crate::config::DeliveryConfig;
use crate::events::OutboundBubble;

/// Counts from one delivery sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

pub async fn deliver_bubbles(
    channel: &dyn Channel,
    address: &DeliveryAddress,
    bubbles: &[OutboundBubble],
    config: &DeliveryConfig,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for bubble in bubbles {
        if let Err(e) = channel.send_typing(address).await {
            debug!("typing indicator failed on {}: {}", channel.name(), e);
        }
        if config.pacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.pacing_ms)).await;
        }

        let result = match (&bubble.text, &bubble.image_url) {
            (Some(text), _) => channel.send_text(address, text).await,
            (None, Some(url)) => channel.send_image(address, url).await,
            (None, None) => {
                debug!("skipping empty bubble {}", bubble.sequence_index);
                continue;
            }
        };

        match result {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    "bubble {}/{} failed on {}: {}",
                    bubble.sequence_index + 1,
                    bubbles.len(),
                    channel.name(),
                    e
                );
            }
        }

        if let Err(e) = channel.mark_read(address).await {
            debug!("read receipt failed on {}: {}", channel.name(), e);
        }
    }

    report
}
