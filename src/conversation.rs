use crate::events::{ChannelKind, EventKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a human takeover suppresses the agent. Applied on operator echo
/// and on agent-requested handoff; admin tooling clears it out-of-band.
pub const HUMAN_OVERRIDE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    HumanOverride,
    HumanHandling,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::HumanOverride => "human_override",
            ConversationStatus::HumanHandling => "human_handling",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ConversationStatus::Open),
            "human_override" => Some(ConversationStatus::HumanOverride),
            "human_handling" => Some(ConversationStatus::HumanHandling),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    HumanSupervisor,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::HumanSupervisor => "human_supervisor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "human_supervisor" => Some(MessageRole::HumanSupervisor),
            _ => None,
        }
    }
}

/// One thread per `(tenant, channel, end user)` triple, created lazily on
/// first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub channel: ChannelKind,
    pub external_user_id: String,
    pub status: ConversationStatus,
    pub human_override_until: Option<DateTime<Utc>>,
    pub last_message_at: DateTime<Utc>,
    pub last_message_preview: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        tenant_id: impl Into<String>,
        channel: ChannelKind,
        external_user_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Conversation {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            channel,
            external_user_id: external_user_id.into(),
            status: ConversationStatus::Open,
            human_override_until: None,
            last_message_at: now,
            last_message_preview: String::new(),
            created_at: now,
        }
    }

    /// Whether automated replies are currently suppressed. True while a
    /// human override window is live or an operator is actively handling
    /// the thread. User messages are still persisted either way.
    pub fn suppresses_agent(&self, now: DateTime<Utc>) -> bool {
        if self.status == ConversationStatus::HumanHandling {
            return true;
        }
        match self.human_override_until {
            Some(until) => until > now,
            None => false,
        }
    }

    /// End of the takeover window started at `now`.
    pub fn override_window_from(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::hours(HUMAN_OVERRIDE_HOURS)
    }
}

/// Truncate to `max_chars` on a char boundary, appending an ellipsis when
/// anything was cut.
pub fn preview_of(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Append-only conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub message_type: EventKind,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        message_type: EventKind,
        correlation_id: impl Into<String>,
    ) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            message_type,
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Conversation persistence seam. Implementations must make `get_or_create`
/// safe under concurrent callers for the same triple.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create(
        &self,
        tenant_id: &str,
        channel: ChannelKind,
        external_user_id: &str,
    ) -> Result<Conversation>;

    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    /// Update `last_message_at` / `last_message_preview`.
    async fn touch(&self, id: &str, at: DateTime<Utc>, preview: &str) -> Result<()>;

    /// Start (or extend) a human takeover window and flip the status.
    async fn apply_override(&self, id: &str, until: DateTime<Utc>) -> Result<()>;

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<()>;
}

/// Append-only message log seam.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &Message) -> Result<()>;

    /// Last `limit` messages in creation order (oldest first).
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;
}
