//! Event fan-out to connected RPC clients and pending node invocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::gateway::runs::RunContext;
use crate::rpc::frames::ServerFrame;

/// Fan-out of server-pushed event frames to every authenticated
/// connection. Run-scoped events carry a per-run sequence stamp; the hub
/// refuses to emit a stamp at or below one it has already emitted for
/// that run, so consumers always see strictly increasing `seq`.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
    next_conn_id: Arc<AtomicU64>,
}

#[derive(Default)]
struct HubInner {
    sinks: HashMap<u64, mpsc::Sender<ServerFrame>>,
    last_seq: HashMap<String, u64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's outbound queue. Returns the id to detach with.
    pub fn register(&self, tx: mpsc::Sender<ServerFrame>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut inner) = self.inner.lock() {
            inner.sinks.insert(id, tx);
        }
        id
    }

    pub fn unregister(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sinks.remove(&id);
        }
    }

    /// Push an unscoped event to every connection.
    pub fn broadcast(&self, event: &str, payload: Value) {
        self.send_frame(ServerFrame::Event {
            event: event.to_string(),
            run_id: None,
            seq: None,
            payload,
        });
    }

    /// Push a run-scoped event, stamped with the run's next sequence
    /// number. Regressive stamps (a racing emitter reusing an old number)
    /// are dropped rather than delivered out of order.
    pub fn publish_run(&self, run: &RunContext, event: &str, payload: Value) {
        let seq = run.next_seq();
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let last = inner.last_seq.entry(run.run_id.clone()).or_insert(0);
            if seq <= *last {
                warn!(run_id = %run.run_id, seq, last = *last, "dropping regressive event");
                return;
            }
            *last = seq;
        }
        self.send_frame(ServerFrame::Event {
            event: event.to_string(),
            run_id: Some(run.run_id.clone()),
            seq: Some(seq),
            payload,
        });
    }

    /// Drop per-run ordering state once a run is finished.
    pub fn forget_run(&self, run_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_seq.remove(run_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().map(|i| i.sinks.len()).unwrap_or(0)
    }

    fn send_frame(&self, frame: ServerFrame) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // A full or closed queue means the connection is on its way out;
        // drop it from the hub rather than block the publisher.
        inner.sinks.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = id, "event queue full, dropping connection from hub");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Outstanding `node.invoke` calls awaiting a `node.invoke.result`.
///
/// Results that arrive after the waiter gave up (or for ids never issued)
/// are acknowledged and discarded; the caller cannot distinguish the two
/// and retrying would double-apply.
#[derive(Clone, Default)]
pub struct PendingInvokes {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl PendingInvokes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, invoke_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(invoke_id.to_string(), tx);
        }
        rx
    }

    pub fn forget(&self, invoke_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(invoke_id);
        }
    }

    /// Deliver a result. Returns false when no waiter exists, in which
    /// case the result is dropped.
    pub fn resolve(&self, invoke_id: &str, result: Value) -> bool {
        let waiter = match self.inner.lock() {
            Ok(mut inner) => inner.remove(invoke_id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                debug!(invoke_id, "ignoring result for unknown or expired invoke");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::runs::RunRegistry;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let hub = EventHub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.register(tx1);
        hub.register(tx2);

        hub.broadcast("gateway.started", json!({}));
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ServerFrame::Event { event, .. } => assert_eq!(event, "gateway.started"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unregistered_connection_stops_receiving() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.register(tx);
        hub.unregister(id);
        hub.broadcast("x", json!({}));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn run_events_carry_increasing_seq() {
        let hub = EventHub::new();
        let registry = RunRegistry::new();
        let run = registry
            .begin("r1", "main", "sid", "main", false, None)
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        hub.register(tx);

        hub.publish_run(&run, "agent.delta", json!({"text": "a"}));
        hub.publish_run(&run, "agent.delta", json!({"text": "b"}));

        let mut last = 0;
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ServerFrame::Event { seq: Some(seq), run_id, .. } => {
                    assert_eq!(run_id.as_deref(), Some("r1"));
                    assert!(seq > last, "seq must be strictly increasing");
                    last = seq;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn pending_invoke_resolves_waiter() {
        let pending = PendingInvokes::new();
        let rx = pending.register("inv-1");
        assert!(pending.resolve("inv-1", json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn late_or_unknown_invoke_result_is_dropped() {
        let pending = PendingInvokes::new();
        assert!(!pending.resolve("never-issued", json!({})));

        let rx = pending.register("inv-2");
        drop(rx);
        // Waiter gone; resolve reports failure but does not panic.
        assert!(!pending.resolve("inv-2", json!({})));
    }
}
