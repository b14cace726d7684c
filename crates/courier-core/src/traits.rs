use crate::{error::CourierError, message::TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything the runner needs to execute one agent turn.
///
/// The routing core treats a run as an opaque async operation: it supplies
/// the prompt and the session transcript id, and gets back a reply plus a
/// stream of typed events. Model selection, tool execution, and prompt
/// construction live behind this seam.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: String,
    pub session_key: String,
    /// Transcript id correlating to the underlying agent conversation.
    pub session_id: String,
    pub text: String,
    /// Background wake/poll run; replies matching the heartbeat ack token
    /// are suppressed downstream.
    pub is_heartbeat: bool,
    /// Cooperative cancellation; the runner must abort in-flight work when
    /// this token fires.
    pub cancel: CancellationToken,
}

/// The result of a completed agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Typed events streamed during an agent run.
///
/// Sequence numbers are stamped by the run registry when events are
/// forwarded; runners emit events unnumbered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Started,
    /// Partial response content.
    Delta { text: String },
    ToolStart { name: String },
    ToolEnd { name: String },
    Completed,
    Error { message: String },
}

/// Agent execution seam — the brain.
///
/// The production deployment plugs an LLM-backed runner in here; tests and
/// local development use an in-process echo runner.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Human-readable runner name.
    fn name(&self) -> &str;

    /// Execute one run to completion, streaming events along the way.
    ///
    /// Must return promptly with `CourierError::Cancelled` when
    /// `req.cancel` fires.
    async fn run(
        &self,
        req: AgentRequest,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentReply, CourierError>;
}
