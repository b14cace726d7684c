use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of conversation a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
    Global,
    #[default]
    Unknown,
}

/// Per-session runtime knob level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Default,
    Off,
    Low,
    Medium,
    High,
}

/// Explicit outbound gating, independent of channel-level policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    #[default]
    Allow,
    Deny,
}

/// Last known outbound target for a session. Used for system-initiated
/// messages (cron, heartbeat, restart notices) that have no live inbound
/// event to reply to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// One persisted session record. Exactly one entry per canonical key per
/// store file; `session_id` never changes once assigned (a new transcript
/// means a new entry).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Opaque id correlating to the underlying agent transcript.
    #[serde(default)]
    pub session_id: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub chat_type: ChatType,
    /// Human-assigned alias; unique within a store, enforced at patch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub thinking_level: Level,
    #[serde(default)]
    pub verbose_level: Level,
    #[serde(default)]
    pub reasoning_level: Level,
    #[serde(default)]
    pub elevated_level: Level,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<DeliveryContext>,
    #[serde(default)]
    pub send_policy: SendPolicy,
    /// Parent session key, for sub-agent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
}

impl SessionEntry {
    /// Fresh entry for a newly observed session key.
    pub fn new(session_id: impl Into<String>, chat_type: ChatType) -> Self {
        Self {
            session_id: session_id.into(),
            updated_at: Utc::now(),
            chat_type,
            ..Default::default()
        }
    }

    /// Fold a run's token usage into the monotonic counters.
    pub fn record_usage(&mut self, usage: &courier_core::message::TokenUsage) {
        self.total_tokens += usage.total_tokens;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.context_tokens = usage.context_tokens;
        self.updated_at = Utc::now();
    }
}
