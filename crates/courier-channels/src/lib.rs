//! # courier-channels
//!
//! Outbound delivery adapters. An adapter knows how to turn an abstract
//! outbound payload into concrete sends on one messaging surface; the
//! gateway core never talks to a platform API directly.

pub mod chunk;
pub mod loopback;
pub mod registry;

use async_trait::async_trait;
use courier_core::message::{OutboundPayload, SendReceipt};
use courier_core::CourierError;

pub use chunk::chunk_text;
pub use loopback::LoopbackAdapter;
pub use registry::AdapterRegistry;

/// How an adapter hands messages to its platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Sends complete (or fail) before `send_text` returns.
    Direct,
    /// Sends are accepted into an internal queue and delivered later.
    Queued,
}

/// One messaging surface's outbound side.
///
/// Implementations are registered under their channel name and looked up
/// per delivery. `send_text` is called once per chunk; the registry applies
/// chunking before dispatch so adapters only ever see payloads within
/// their declared limit.
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    /// Channel name this adapter serves (`telegram`, `slack`, ...).
    fn name(&self) -> &str;

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Direct
    }

    /// Largest text payload the platform accepts in one message.
    fn text_chunk_limit(&self) -> usize;

    /// Normalize a user-supplied target into the platform's canonical
    /// recipient id. Errors on targets the platform cannot address.
    async fn resolve_target(&self, to: &str) -> Result<String, CourierError>;

    async fn send_text(&self, payload: &OutboundPayload) -> Result<SendReceipt, CourierError>;

    /// Media delivery is optional; surfaces without it reject explicitly.
    async fn send_media(&self, payload: &OutboundPayload) -> Result<SendReceipt, CourierError> {
        let _ = payload;
        Err(CourierError::Channel(format!(
            "channel '{}' does not support media",
            self.name()
        )))
    }
}
