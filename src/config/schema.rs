use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Generates a `Debug` impl that redacts secret fields.
///
/// Field specifiers:
/// - `field_name`         — printed normally via `&self.field_name`
/// - `redact(field_name)` — `String` field: shows `[empty]` or `[REDACTED]`
macro_rules! redact_debug {
    // Internal: emit a single .field() call
    (@field $builder:ident, $self:ident, redact($field:ident)) => {
        $builder.field(
            stringify!($field),
            &if $self.$field.is_empty() {
                "[empty]"
            } else {
                "[REDACTED]"
            },
        );
    };
    (@field $builder:ident, $self:ident, $field:ident) => {
        $builder.field(stringify!($field), &$self.$field);
    };

    // Internal: recursive TT muncher
    (@fields $builder:ident, $self:ident,) => {};
    (@fields $builder:ident, $self:ident, redact($field:ident), $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, redact($field));
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident, $field:ident, $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, $field);
        redact_debug!(@fields $builder, $self, $($rest)*);
    };

    // Entry point
    ($struct_name:ident, $($fields:tt)*) => {
        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut builder = f.debug_struct(stringify!($struct_name));
                redact_debug!(@fields builder, self, $($fields)*);
                builder.finish()
            }
        }
    };
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8811
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for `/internal/*` endpoints and the outbound agent call.
    #[serde(default)]
    pub internal_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            internal_token: String::new(),
        }
    }
}

redact_debug!(ServerConfig, host, port, redact(internal_token),);

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

fn default_dedup_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Defaults to `<relevo home>/relevo.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// How long consumed event ids stay poisoned against replays.
    #[serde(default = "default_dedup_ttl_hours")]
    pub dedup_ttl_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            dedup_ttl_hours: default_dedup_ttl_hours(),
        }
    }
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

fn default_quiet_secs() -> u64 {
    16
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_fragments() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Inactivity window: seconds of sender silence before a buffered burst
    /// is drained into one agent turn.
    #[serde(default = "default_quiet_secs")]
    pub quiet_secs: u64,
    /// Drain-lock lifetime. Must exceed the quiet window so a healthy drain
    /// never loses its claim mid-wait; expiry frees keys from crashed drains.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Flood guard: fragments beyond this per sender are dropped with a warning.
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_secs: default_quiet_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_fragments: default_max_fragments(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

fn default_pacing_ms() -> u64 {
    4000
}

fn default_bubble_max_chars() -> usize {
    400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Inter-bubble delay while the typing indicator is showing.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Text bubbles longer than this are re-split at sentence boundaries.
    #[serde(default = "default_bubble_max_chars")]
    pub bubble_max_chars: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            bubble_max_chars: default_bubble_max_chars(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent engine
// ---------------------------------------------------------------------------

fn default_agent_timeout_secs() -> u64 {
    75
}

fn default_agent_max_attempts() -> u32 {
    3
}

fn default_agent_initial_delay_ms() -> u64 {
    2000
}

fn default_agent_max_delay_ms() -> u64 {
    10_000
}

fn default_history_limit() -> usize {
    100
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Reasoning engine endpoint. Required for `serve`.
    #[serde(default)]
    pub url: String,
    /// Upper bound on a single invocation attempt. Agent turns can run
    /// tools server-side, so this is long.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    /// Total invocation attempts, including the first.
    #[serde(default = "default_agent_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_agent_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_agent_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Most recent conversation messages included in each invocation.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_agent_timeout_secs(),
            max_attempts: default_agent_max_attempts(),
            initial_delay_ms: default_agent_initial_delay_ms(),
            max_delay_ms: default_agent_max_delay_ms(),
            history_limit: default_history_limit(),
        }
    }
}

redact_debug!(
    AgentConfig,
    url,
    timeout_secs,
    max_attempts,
    initial_delay_ms,
    max_delay_ms,
    history_limit,
);

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

fn default_preview_max_chars() -> usize {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Length cap for the stored `last_message_preview`.
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            preview_max_chars: default_preview_max_chars(),
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

fn default_whatsapp_api_base() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WhatsappProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the send/media API. Per-tenant tokens and phone ids come
    /// from the tenant record, not from here.
    #[serde(default = "default_whatsapp_api_base")]
    pub api_base: String,
    /// HMAC-SHA256 key for inbound webhook signatures.
    #[serde(default)]
    pub webhook_secret: String,
}

impl Default for WhatsappProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_whatsapp_api_base(),
            webhook_secret: String::new(),
        }
    }
}

redact_debug!(
    WhatsappProviderConfig,
    enabled,
    api_base,
    redact(webhook_secret),
);

#[derive(Clone, Serialize, Deserialize)]
pub struct ChatwootProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bridge installation base URL, e.g. `https://app.chatwoot.com`.
    #[serde(default)]
    pub api_base: String,
    /// Shared secret carried as the `secret` query parameter on webhooks.
    #[serde(default)]
    pub webhook_secret: String,
    /// Platform-wide bot token for posting replies into bridge conversations.
    #[serde(default)]
    pub api_token: String,
}

impl Default for ChatwootProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: String::new(),
            webhook_secret: String::new(),
            api_token: String::new(),
        }
    }
}

redact_debug!(
    ChatwootProviderConfig,
    enabled,
    api_base,
    redact(webhook_secret),
    redact(api_token),
);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub whatsapp: WhatsappProviderConfig,
    #[serde(default)]
    pub chatwoot: ChatwootProviderConfig,
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

fn default_transcription_api_url() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_transcription_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_transcription_api_url(),
            api_key: String::new(),
            model: default_transcription_model(),
        }
    }
}

redact_debug!(
    TranscriptionConfig,
    enabled,
    api_url,
    redact(api_key),
    model,
);

// ---------------------------------------------------------------------------
// Handoff notifier
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Transactional email API endpoint for handoff alerts.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub from_email: String,
}

redact_debug!(
    NotifierConfig,
    enabled,
    api_url,
    redact(api_key),
    from_email,
);

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl Config {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), crate::errors::RelevoError> {
        self.validate_server()?;
        self.validate_store()?;
        self.validate_debounce()?;
        self.validate_delivery()?;
        self.validate_agent()?;
        self.validate_conversation()?;
        self.validate_providers()?;
        self.validate_notifier()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;

        if self.server.port == 0 {
            return Err(RelevoError::Config("server.port must be > 0".into()));
        }
        if self.server.port < 1024 {
            warn!(
                "server.port {} is a privileged port (< 1024), may require elevated permissions",
                self.server.port
            );
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;

        if self.store.dedup_ttl_hours < 24 {
            return Err(RelevoError::Config(
                "store.dedup_ttl_hours must be >= 24: provider replays arrive up to a day late"
                    .into(),
            ));
        }
        Ok(())
    }

    fn validate_debounce(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;
        let d = &self.debounce;

        if d.quiet_secs == 0 {
            return Err(RelevoError::Config("debounce.quiet_secs must be > 0".into()));
        }
        if !(12..=20).contains(&d.quiet_secs) {
            warn!(
                "debounce.quiet_secs {} is outside the recommended 12-20s range",
                d.quiet_secs
            );
        }
        if d.lock_ttl_secs <= d.quiet_secs {
            return Err(RelevoError::Config(
                "debounce.lock_ttl_secs must exceed debounce.quiet_secs or drains lose their claim mid-wait".into(),
            ));
        }
        if d.poll_interval_ms == 0 {
            return Err(RelevoError::Config(
                "debounce.poll_interval_ms must be > 0".into(),
            ));
        }
        if d.max_fragments == 0 {
            return Err(RelevoError::Config(
                "debounce.max_fragments must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_delivery(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;

        if self.delivery.bubble_max_chars == 0 {
            return Err(RelevoError::Config(
                "delivery.bubble_max_chars must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_agent(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;
        let a = &self.agent;

        if a.timeout_secs == 0 {
            return Err(RelevoError::Config("agent.timeout_secs must be > 0".into()));
        }
        if a.max_attempts == 0 {
            return Err(RelevoError::Config("agent.max_attempts must be > 0".into()));
        }
        if a.max_delay_ms < a.initial_delay_ms {
            return Err(RelevoError::Config(
                "agent.max_delay_ms must be >= agent.initial_delay_ms".into(),
            ));
        }
        if a.history_limit == 0 {
            return Err(RelevoError::Config("agent.history_limit must be > 0".into()));
        }
        Ok(())
    }

    fn validate_conversation(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;

        if self.conversation.preview_max_chars == 0 {
            return Err(RelevoError::Config(
                "conversation.preview_max_chars must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_providers(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;
        let p = &self.providers;

        if p.whatsapp.enabled && p.whatsapp.api_base.is_empty() {
            return Err(RelevoError::Config(
                "providers.whatsapp.api_base must be set when enabled".into(),
            ));
        }
        if p.chatwoot.enabled && p.chatwoot.api_base.is_empty() && !p.chatwoot.api_token.is_empty()
        {
            return Err(RelevoError::Config(
                "providers.chatwoot.api_base must be set when an api_token is configured".into(),
            ));
        }
        if p.whatsapp.enabled && p.whatsapp.webhook_secret.is_empty() {
            warn!("providers.whatsapp.webhook_secret is empty, all signed webhooks will be rejected");
        }
        if p.chatwoot.enabled && p.chatwoot.webhook_secret.is_empty() {
            warn!("providers.chatwoot.webhook_secret is empty, all bridge webhooks will be rejected");
        }
        Ok(())
    }

    fn validate_notifier(&self) -> Result<(), crate::errors::RelevoError> {
        use crate::errors::RelevoError;

        if self.notifier.enabled && self.notifier.api_url.is_empty() {
            return Err(RelevoError::Config(
                "notifier.api_url must be set when enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_quiet_window_rejected() {
        let mut config = Config::default();
        config.debounce.quiet_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("debounce.quiet_secs"));
    }

    #[test]
    fn lock_ttl_must_exceed_quiet_window() {
        let mut config = Config::default();
        config.debounce.quiet_secs = 16;
        config.debounce.lock_ttl_secs = 16;
        assert!(config.validate().is_err());
        config.debounce.lock_ttl_secs = 17;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn short_dedup_ttl_rejected() {
        let mut config = Config::default();
        config.store.dedup_ttl_hours = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn notifier_requires_url_when_enabled() {
        let mut config = Config::default();
        config.notifier.enabled = true;
        assert!(config.validate().is_err());
        config.notifier.api_url = "https://mail.example.com/send".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn secrets_redacted_in_debug() {
        let mut config = Config::default();
        config.server.internal_token = "super-secret".into();
        config.providers.whatsapp.webhook_secret = "hmac-key".into();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("hmac-key"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
            [server]
            port = 9900

            [debounce]
            quiet_secs = 12

            [agent]
            url = "http://agent.internal/run"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9900);
        assert_eq!(config.debounce.quiet_secs, 12);
        assert_eq!(config.agent.url, "http://agent.internal/run");
        // untouched sections keep defaults
        assert_eq!(config.delivery.pacing_ms, 4000);
        assert_eq!(config.store.dedup_ttl_hours, 24);
    }
}
