//! End-to-end turn processing.
//!
//! One [`Pipeline`] owns every collaborator a turn touches: the shared keyed
//! store (through the deduplicator and debouncer), the tenant directory,
//! conversation and message persistence, the agent client, the notifier and
//! optional transcription. Everything is threaded explicitly; no part of a
//! request lives in process-global state, so two tenants' turns can never
//! bleed into each other.
//!
//! Webhook handlers hand normalized events to [`Pipeline::ingest`] and
//! return immediately; the agent call, pacing delays and debounce waits all
//! happen on spawned tasks. Every finished turn folds into a
//! [`DispatchOutcome`] and is logged with its correlation id.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentOutcome, AgentRequest};
use crate::channels::{Channel, ChatwootChannel, DeliveryAddress, WhatsappChannel};
use crate::config::Config;
use crate::conversation::{
    preview_of, Conversation, ConversationStatus, ConversationStore, Message, MessageRole,
    MessageStore,
};
use crate::debounce::{aggregate_text, Debouncer, Enqueued};
use crate::dedup::Deduplicator;
use crate::delivery::deliver_bubbles;
use crate::errors::RelevoError;
use crate::events::{
    BridgeRouting, ChannelKind, DispatchOutcome, EventKind, InboundEvent, MediaRef,
    OutboundBubble, Provider,
};
use crate::notify::{build_notifier, HandoffAlert, Notifier};
use crate::sequencer::{sequence_parts, ReplyPart};
use crate::store::KeyValueStore;
use crate::tenant::{self, normalize_phone, Tenant, TenantStore};
use crate::transcription::{TranscriptionService, AUDIO_PLACEHOLDER};

/// Sent when the agent fails after retries. The customer never sees a raw
/// error.
const APOLOGY_TEXT: &str =
    "Perdón, tuvimos un problema técnico de nuestro lado. ¿Me lo repites en un momento?";

/// Used when the agent requests a handoff without a message of its own.
const HANDOFF_FALLBACK_TEXT: &str =
    "Te comunico con una persona del equipo; en breve te escriben por aquí.";

const IMAGE_PLACEHOLDER: &str = "[image message]";
const DOCUMENT_PLACEHOLDER: &str = "[document message]";
const OPERATOR_MEDIA_PLACEHOLDER: &str = "[operator message]";

pub struct Pipeline {
    config: Config,
    dedup: Deduplicator,
    debouncer: Debouncer,
    tenants: Arc<dyn TenantStore>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    agent: AgentClient,
    notifier: Box<dyn Notifier>,
    transcription: Option<TranscriptionService>,
    http: reqwest::Client,
}

impl Pipeline {
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        tenants: Arc<dyn TenantStore>,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let http = crate::channels::http_client();
        let agent = AgentClient::new(
            http.clone(),
            config.agent.clone(),
            config.server.internal_token.clone(),
        );
        let notifier = build_notifier(&config.notifier);
        let transcription = TranscriptionService::new(&config.transcription);
        let dedup = Deduplicator::new(Arc::clone(&kv), config.store.dedup_ttl_hours);
        let debouncer = Debouncer::new(kv, config.debounce.clone());
        Pipeline {
            config,
            dedup,
            debouncer,
            tenants,
            conversations,
            messages,
            agent,
            notifier,
            transcription,
            http,
        }
    }

    /// Route one webhook's worth of normalized events. Echoes and media flow
    /// immediately; text fragments join the debounce buffer, spawning a drain
    /// task when this fragment claimed the key.
    pub async fn ingest(self: &Arc<Self>, events: Vec<InboundEvent>) {
        for event in events {
            if let Err(e) = self.ingest_event(event).await {
                warn!("event ingestion failed: {e:#}");
            }
        }
    }

    async fn ingest_event(self: &Arc<Self>, event: InboundEvent) -> anyhow::Result<()> {
        if event.is_echo() {
            self.handle_echo(&event).await;
            return Ok(());
        }
        if event.is_buffered() {
            if self.debouncer.enqueue(&event).await? == Enqueued::ClaimedDrain {
                let pipeline = Arc::clone(self);
                let sender_key = event.sender_key();
                tokio::spawn(async move {
                    pipeline.drain_cycle(&sender_key).await;
                });
            }
            return Ok(());
        }
        self.process_turn(vec![event]).await;
        Ok(())
    }

    /// Own the wait-drain-finish cycle for one sender key, looping while late
    /// fragments keep arriving under the same claim.
    async fn drain_cycle(&self, sender_key: &str) {
        loop {
            let drained = match self.debouncer.wait_and_drain(sender_key).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(sender_key = %sender_key, "drain failed: {e:#}");
                    break;
                }
            };
            if !drained.is_empty() {
                self.process_turn(drained).await;
            }
            match self.debouncer.finish(sender_key).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    warn!(sender_key = %sender_key, "drain release failed: {e:#}");
                    break;
                }
            }
        }
    }

    /// Run one aggregated turn end to end. Never propagates an error: every
    /// failure is logged and folded into the outcome.
    pub async fn process_turn(&self, events: Vec<InboundEvent>) -> DispatchOutcome {
        let correlation_id = events
            .last()
            .map(|e| e.correlation_id.clone())
            .unwrap_or_default();

        let outcome = match self.run_turn(events).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(correlation_id = %correlation_id, "turn failed: {err}");
                DispatchOutcome::error()
            }
        };
        info!(
            correlation_id = %correlation_id,
            status = ?outcome.status,
            send = outcome.send,
            bubbles = outcome.messages.len(),
            "turn complete"
        );
        outcome
    }

    async fn run_turn(&self, events: Vec<InboundEvent>) -> Result<DispatchOutcome, RelevoError> {
        let fresh = self.dedup.filter_fresh(events).await?;
        let Some(primary) = fresh.last().cloned() else {
            return Ok(DispatchOutcome::duplicate());
        };

        let tenant = tenant::resolve(self.tenants.as_ref(), &primary).await?;
        let conversation = self
            .conversations
            .get_or_create(&tenant.id, primary.channel, &primary.from)
            .await?;

        let turn_text = self.turn_text(&tenant, &fresh, &primary).await;

        // Snapshot history before appending so the turn is not in it twice.
        let history = self
            .messages
            .recent(&conversation.id, self.config.agent.history_limit)
            .await?;

        let now = Utc::now();
        let user_message = Message::new(
            conversation.id.as_str(),
            MessageRole::User,
            turn_text.as_str(),
            primary.kind,
            primary.correlation_id.as_str(),
        );
        self.messages.append(&user_message).await?;
        self.conversations
            .touch(&conversation.id, now, &self.preview(&turn_text))
            .await?;

        // Gating is re-read per turn so an admin unlock takes effect at once.
        if conversation.status == ConversationStatus::Closed {
            debug!(
                correlation_id = %primary.correlation_id,
                conversation_id = %conversation.id,
                "conversation closed, suppressing agent"
            );
            return Ok(DispatchOutcome::ignored());
        }
        if conversation.suppresses_agent(now) {
            debug!(
                correlation_id = %primary.correlation_id,
                conversation_id = %conversation.id,
                "human takeover active, suppressing agent"
            );
            return Ok(DispatchOutcome::ignored());
        }

        let channel = self.channel_for(&tenant, primary.provider)?;
        let address = DeliveryAddress::for_event(&primary);

        let request = AgentRequest {
            tenant: &tenant,
            history: &history,
            message: &turn_text,
            customer_id: &primary.from,
            customer_name: primary.customer_name.as_deref(),
            channel: primary.channel,
            correlation_id: &primary.correlation_id,
        };

        match self.agent.invoke(&request).await {
            Ok(AgentOutcome::Reply(parts)) => {
                self.deliver_reply(channel.as_ref(), &address, &conversation, &primary, parts)
                    .await
            }
            Ok(AgentOutcome::Handoff { message }) => {
                self.handle_handoff(
                    channel.as_ref(),
                    &address,
                    &conversation,
                    &tenant,
                    &primary,
                    message,
                )
                .await
            }
            Err(err) => {
                warn!(
                    correlation_id = %primary.correlation_id,
                    "agent invocation failed: {err}"
                );
                self.send_apology(channel.as_ref(), &address, &conversation, &primary)
                    .await;
                Ok(DispatchOutcome::error())
            }
        }
    }

    async fn deliver_reply(
        &self,
        channel: &dyn Channel,
        address: &DeliveryAddress,
        conversation: &Conversation,
        primary: &InboundEvent,
        parts: Vec<ReplyPart>,
    ) -> Result<DispatchOutcome, RelevoError> {
        let bubbles = sequence_parts(&parts, self.config.delivery.bubble_max_chars);
        if bubbles.is_empty() {
            warn!(
                correlation_id = %primary.correlation_id,
                "agent reply sequenced to nothing"
            );
            return Ok(DispatchOutcome::ok(vec![]));
        }

        let report = deliver_bubbles(channel, address, &bubbles, &self.config.delivery).await;
        if report.failed > 0 {
            warn!(
                correlation_id = %primary.correlation_id,
                failed = report.failed,
                sent = report.sent,
                "partial delivery"
            );
        }

        let raw = raw_reply_text(&parts);
        self.record_outbound(conversation, MessageRole::Assistant, &raw, primary)
            .await?;
        Ok(DispatchOutcome::ok(bubbles))
    }

    async fn handle_handoff(
        &self,
        channel: &dyn Channel,
        address: &DeliveryAddress,
        conversation: &Conversation,
        tenant: &Tenant,
        primary: &InboundEvent,
        message: String,
    ) -> Result<DispatchOutcome, RelevoError> {
        let reason = message.trim().to_string();
        let text = if reason.is_empty() {
            HANDOFF_FALLBACK_TEXT.to_string()
        } else {
            reason.clone()
        };

        // The lock comes first: even if everything below fails, the humans
        // own the thread.
        self.conversations
            .apply_override(
                &conversation.id,
                Conversation::override_window_from(Utc::now()),
            )
            .await?;

        let alert = HandoffAlert {
            tenant,
            customer_id: &primary.from,
            customer_name: primary.customer_name.as_deref(),
            channel: primary.channel,
            reason: &reason,
            correlation_id: &primary.correlation_id,
        };
        if let Err(e) = self.notifier.handoff_alert(&alert).await {
            warn!(
                correlation_id = %primary.correlation_id,
                notifier = self.notifier.name(),
                "handoff alert failed, conversation stays locked: {e:#}"
            );
        }

        let mut bubble = OutboundBubble::text(text.clone());
        bubble.is_final = true;
        let bubbles = vec![bubble];
        let report = deliver_bubbles(channel, address, &bubbles, &self.config.delivery).await;
        if report.failed > 0 {
            warn!(
                correlation_id = %primary.correlation_id,
                "handoff bubble failed to deliver"
            );
        }

        self.record_outbound(conversation, MessageRole::HumanSupervisor, &text, primary)
            .await?;
        Ok(DispatchOutcome::ok(bubbles))
    }

    /// Best effort: the customer hears something even when the engine is
    /// down. Failure to apologize is only logged.
    async fn send_apology(
        &self,
        channel: &dyn Channel,
        address: &DeliveryAddress,
        conversation: &Conversation,
        primary: &InboundEvent,
    ) {
        let mut bubble = OutboundBubble::text(APOLOGY_TEXT);
        bubble.is_final = true;
        let report = deliver_bubbles(channel, address, &[bubble], &self.config.delivery).await;
        if report.sent > 0 {
            if let Err(e) = self
                .record_outbound(conversation, MessageRole::Assistant, APOLOGY_TEXT, primary)
                .await
            {
                warn!(
                    correlation_id = %primary.correlation_id,
                    "failed to record apology: {e}"
                );
            }
        }
    }

    /// Operator replied from the provider's own app: start the takeover
    /// window and file the text. The agent is never invoked.
    pub async fn handle_echo(&self, event: &InboundEvent) -> DispatchOutcome {
        let outcome = match self.run_echo(event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    correlation_id = %event.correlation_id,
                    "echo handling failed: {err}"
                );
                DispatchOutcome::error()
            }
        };
        info!(
            correlation_id = %event.correlation_id,
            status = ?outcome.status,
            "echo complete"
        );
        outcome
    }

    async fn run_echo(&self, event: &InboundEvent) -> Result<DispatchOutcome, RelevoError> {
        if !self.dedup.claim(event.provider, &event.event_id).await? {
            return Ok(DispatchOutcome::duplicate());
        }
        let tenant = tenant::resolve(self.tenants.as_ref(), event).await?;
        let conversation = self
            .conversations
            .get_or_create(&tenant.id, event.channel, &event.from)
            .await?;

        let now = Utc::now();
        self.conversations
            .apply_override(&conversation.id, Conversation::override_window_from(now))
            .await?;

        let content = match event.text.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => OPERATOR_MEDIA_PLACEHOLDER.to_string(),
        };
        let message = Message::new(
            conversation.id.as_str(),
            MessageRole::HumanSupervisor,
            content.as_str(),
            event.kind,
            event.correlation_id.as_str(),
        );
        self.messages.append(&message).await?;
        self.conversations
            .touch(&conversation.id, now, &self.preview(&content))
            .await?;

        info!(
            correlation_id = %event.correlation_id,
            tenant = %tenant.id,
            conversation_id = %conversation.id,
            "operator echo started human takeover window"
        );
        Ok(DispatchOutcome::ignored())
    }

    /// Relay an operator-authored message injected through internal tooling.
    ///
    /// Bridge sends go out unstamped so the bridge webhook echoes them back
    /// as operator messages, starting the takeover window through the normal
    /// echo path. Direct-channel sends do not echo, so the same transition is
    /// applied here directly.
    pub async fn manual_send(&self, send: &ManualSend) -> Result<(), RelevoError> {
        match send.channel_source.as_str() {
            "whatsapp" => self.manual_send_whatsapp(send).await,
            "chatwoot" | "instagram" | "facebook" => self.manual_send_bridge(send).await,
            other => Err(RelevoError::MalformedPayload(format!(
                "unknown channel_source {other:?}"
            ))),
        }
    }

    async fn manual_send_whatsapp(&self, send: &ManualSend) -> Result<(), RelevoError> {
        let tenant_id = send.tenant_id.as_deref().ok_or_else(|| {
            RelevoError::MalformedPayload("whatsapp manual send requires tenant_id".into())
        })?;
        let tenant = self
            .tenants
            .tenant_by_id(tenant_id)
            .await?
            .ok_or_else(|| RelevoError::TenantNotFound(tenant_id.to_string()))?;

        let to = normalize_phone(&send.to);
        if to.is_empty() {
            return Err(RelevoError::MalformedPayload(format!(
                "recipient {:?} has no digits",
                send.to
            )));
        }

        let channel = WhatsappChannel::for_tenant(
            self.http.clone(),
            &self.config.providers.whatsapp.api_base,
            &tenant,
        )?;
        let address = DeliveryAddress {
            to: to.clone(),
            routing: None,
            inbound_message_id: String::new(),
        };
        channel.send_text(&address, &send.text).await?;

        let conversation = self
            .conversations
            .get_or_create(&tenant.id, ChannelKind::Whatsapp, &to)
            .await?;
        let now = Utc::now();
        self.conversations
            .apply_override(&conversation.id, Conversation::override_window_from(now))
            .await?;
        let message = Message::new(
            conversation.id.as_str(),
            MessageRole::HumanSupervisor,
            send.text.as_str(),
            EventKind::Echo,
            format!("manual-{}", Uuid::new_v4()),
        );
        self.messages.append(&message).await?;
        self.conversations
            .touch(&conversation.id, now, &self.preview(&send.text))
            .await?;
        info!(
            tenant = %tenant.id,
            conversation_id = %conversation.id,
            "manual send started human takeover window"
        );
        Ok(())
    }

    async fn manual_send_bridge(&self, send: &ManualSend) -> Result<(), RelevoError> {
        let (Some(conversation_id), Some(account_id)) =
            (send.external_chatwoot_id, send.external_account_id)
        else {
            return Err(RelevoError::MalformedPayload(
                "bridge manual send requires external_chatwoot_id and external_account_id".into(),
            ));
        };
        let routing = BridgeRouting {
            conversation_id,
            account_id,
        };
        let channel = ChatwootChannel::new(
            self.http.clone(),
            &self.config.providers.chatwoot.api_base,
            &self.config.providers.chatwoot.api_token,
        );
        channel.send_operator_text(routing, &send.text).await?;
        Ok(())
    }

    async fn turn_text(
        &self,
        tenant: &Tenant,
        fresh: &[InboundEvent],
        primary: &InboundEvent,
    ) -> String {
        match primary.kind {
            EventKind::Text | EventKind::Echo => aggregate_text(fresh),
            EventKind::Image | EventKind::Document => match primary.text.as_deref() {
                Some(caption) if !caption.is_empty() => caption.to_string(),
                _ if primary.kind == EventKind::Image => IMAGE_PLACEHOLDER.to_string(),
                _ => DOCUMENT_PLACEHOLDER.to_string(),
            },
            EventKind::Audio => self.audio_text(tenant, primary).await,
        }
    }

    async fn audio_text(&self, tenant: &Tenant, event: &InboundEvent) -> String {
        let Some(service) = &self.transcription else {
            return AUDIO_PLACEHOLDER.to_string();
        };
        let Some(media) = event.media.first() else {
            return AUDIO_PLACEHOLDER.to_string();
        };
        let mime = media
            .mime_type
            .clone()
            .unwrap_or_else(|| "audio/ogg".to_string());

        let bytes = match self.fetch_audio(tenant, media).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    correlation_id = %event.correlation_id,
                    "voice note download failed: {e:#}"
                );
                return AUDIO_PLACEHOLDER.to_string();
            }
        };
        match service.transcribe(bytes, &mime).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    correlation_id = %event.correlation_id,
                    "transcription failed: {e:#}"
                );
                AUDIO_PLACEHOLDER.to_string()
            }
        }
    }

    async fn fetch_audio(&self, tenant: &Tenant, media: &MediaRef) -> anyhow::Result<Vec<u8>> {
        // Bridge attachments carry a public URL; direct-channel media only a
        // provider id that must be resolved with tenant credentials.
        if let Some(url) = &media.url {
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                anyhow::bail!("audio download error ({})", response.status());
            }
            return Ok(response.bytes().await?.to_vec());
        }
        let media_id = media
            .provider_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("audio media carries neither url nor provider id"))?;
        let channel = WhatsappChannel::for_tenant(
            self.http.clone(),
            &self.config.providers.whatsapp.api_base,
            tenant,
        )?;
        channel.download_media(media_id).await
    }

    fn channel_for(
        &self,
        tenant: &Tenant,
        provider: Provider,
    ) -> Result<Box<dyn Channel>, RelevoError> {
        match provider {
            Provider::Whatsapp => {
                let channel = WhatsappChannel::for_tenant(
                    self.http.clone(),
                    &self.config.providers.whatsapp.api_base,
                    tenant,
                )?;
                Ok(Box::new(channel))
            }
            Provider::Chatwoot => Ok(Box::new(ChatwootChannel::new(
                self.http.clone(),
                &self.config.providers.chatwoot.api_base,
                &self.config.providers.chatwoot.api_token,
            ))),
        }
    }

    async fn record_outbound(
        &self,
        conversation: &Conversation,
        role: MessageRole,
        content: &str,
        primary: &InboundEvent,
    ) -> Result<(), RelevoError> {
        let message = Message::new(
            conversation.id.as_str(),
            role,
            content,
            EventKind::Text,
            primary.correlation_id.as_str(),
        );
        self.messages.append(&message).await?;
        self.conversations
            .touch(&conversation.id, Utc::now(), &self.preview(content))
            .await?;
        Ok(())
    }

    fn preview(&self, text: &str) -> String {
        preview_of(text, self.config.conversation.preview_max_chars)
    }
}

/// Manual message injected by operator tooling through the internal API.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ManualSend {
    pub to: String,
    pub text: String,
    pub channel_source: String,
    pub external_chatwoot_id: Option<i64>,
    pub external_account_id: Option<i64>,
    pub tenant_id: Option<String>,
}

/// Canonical text stored for a multi-part reply: text parts verbatim, image
/// parts as their URLs, newline separated.
fn raw_reply_text(parts: &[ReplyPart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            ReplyPart::Text(text) => text.as_str(),
            ReplyPart::Image(url) => url.as_str(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
