//! In-process adapter that records sends instead of delivering them.
//!
//! Used by tests and by the CLI's dry-run delivery path.

use std::sync::Mutex;

use async_trait::async_trait;
use courier_core::message::{OutboundPayload, SendReceipt};
use courier_core::CourierError;

use crate::{DeliveryMode, OutboundAdapter};

#[derive(Default)]
pub struct LoopbackAdapter {
    sent: Mutex<Vec<OutboundPayload>>,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<OutboundPayload> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutboundAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "loopback"
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Direct
    }

    fn text_chunk_limit(&self) -> usize {
        4096
    }

    async fn resolve_target(&self, to: &str) -> Result<String, CourierError> {
        if to.trim().is_empty() {
            return Err(CourierError::Channel("empty delivery target".into()));
        }
        Ok(to.trim().to_string())
    }

    async fn send_text(&self, payload: &OutboundPayload) -> Result<SendReceipt, CourierError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| CourierError::Channel("loopback sink poisoned".into()))?;
        sent.push(payload.clone());
        Ok(SendReceipt {
            channel: self.name().to_string(),
            message_id: Some(format!("loopback-{}", sent.len())),
        })
    }
}
