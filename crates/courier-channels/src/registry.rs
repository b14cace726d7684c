//! Named adapter registry and the chunked-delivery front door.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::message::{OutboundPayload, SendReceipt};
use courier_core::CourierError;
use tracing::debug;

use crate::chunk::chunk_text;
use crate::OutboundAdapter;

/// All registered outbound adapters, keyed by channel name.
///
/// Built once at startup; lookups are cheap clone-of-Arc. Per-channel
/// chunk-limit overrides from config take precedence over the adapter's
/// own default.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn OutboundAdapter>>,
    chunk_overrides: HashMap<String, usize>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn OutboundAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn set_chunk_limit(&mut self, channel: impl Into<String>, limit: usize) {
        self.chunk_overrides.insert(channel.into(), limit);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn OutboundAdapter>> {
        self.adapters.get(channel).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    fn chunk_limit_for(&self, adapter: &dyn OutboundAdapter) -> usize {
        self.chunk_overrides
            .get(adapter.name())
            .copied()
            .unwrap_or_else(|| adapter.text_chunk_limit())
    }

    /// Deliver text to a channel, resolving the target and splitting into
    /// platform-sized chunks. Returns one receipt per chunk sent.
    pub async fn deliver_text(
        &self,
        channel: &str,
        payload: &OutboundPayload,
    ) -> Result<Vec<SendReceipt>, CourierError> {
        let adapter = self
            .get(channel)
            .ok_or_else(|| CourierError::NotFound(format!("channel '{channel}'")))?;
        let to = adapter.resolve_target(&payload.to).await?;
        let limit = self.chunk_limit_for(adapter.as_ref());

        let chunks = chunk_text(&payload.text, limit);
        debug!(channel, chunks = chunks.len(), "delivering outbound text");
        let mut receipts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let part = OutboundPayload {
                text: chunk,
                to: to.clone(),
                ..payload.clone()
            };
            receipts.push(adapter.send_text(&part).await?);
        }
        Ok(receipts)
    }

    pub async fn deliver_media(
        &self,
        channel: &str,
        payload: &OutboundPayload,
    ) -> Result<SendReceipt, CourierError> {
        let adapter = self
            .get(channel)
            .ok_or_else(|| CourierError::NotFound(format!("channel '{channel}'")))?;
        let to = adapter.resolve_target(&payload.to).await?;
        let resolved = OutboundPayload {
            to,
            ..payload.clone()
        };
        adapter.send_media(&resolved).await
    }
}
