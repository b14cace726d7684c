use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inbound event from a channel adapter.
///
/// Adapters are external collaborators; this is the uniform shape they hand
/// to the routing core regardless of platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: Uuid,
    /// Channel name (e.g. "telegram", "slack", "loopback").
    pub channel: String,
    /// Platform account the event arrived on (multi-account setups).
    #[serde(default)]
    pub account_id: Option<String>,
    /// Platform-specific peer id (sender in a DM, chat id in a group).
    pub peer_id: String,
    /// Human-readable sender name, when the platform provides one.
    pub sender_name: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Platform-specific target for routing the reply.
    #[serde(default)]
    pub reply_target: Option<String>,
    /// Whether this event comes from a group chat.
    #[serde(default)]
    pub is_group: bool,
}

impl InboundEvent {
    /// Build a direct-message event with the minimum routing fields set.
    pub fn direct(channel: &str, peer_id: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            account_id: None,
            peer_id: peer_id.to_string(),
            sender_name: None,
            text: text.to_string(),
            timestamp: Utc::now(),
            reply_target: Some(peer_id.to_string()),
            is_group: false,
        }
    }
}

/// An outbound payload handed to a delivery adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub text: String,
    /// Platform-specific target.
    pub to: String,
    /// Account to send from, for multi-account channels.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Message id to thread the reply under, when supported.
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// Remote media URL for `send_media`.
    #[serde(default)]
    pub media_url: Option<String>,
}

/// Receipt returned by a delivery adapter after a successful send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub channel: String,
    pub message_id: Option<String>,
}

/// Token usage reported by the agent runner after a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Size of the context window after the run.
    pub context_tokens: u64,
}
