//! Active agent run registry.
//!
//! Tracks every in-flight run so RPC clients can cancel, wait on, and
//! attribute streamed events to runs. Finished runs park in a bounded
//! history so a `wait` that arrives after completion still resolves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::message::TokenUsage;
use courier_core::CourierError;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Completed runs kept for late `wait`/`status` lookups.
const COMPLETED_HISTORY: usize = 256;

/// Shared state of one in-flight run.
pub struct RunContext {
    pub run_id: String,
    pub session_key: String,
    /// Transcript id at the time the run started.
    pub session_id: String,
    pub lane: String,
    pub is_heartbeat: bool,
    /// Client-chosen id echoed back in events, when the run came over RPC.
    pub client_run_id: Option<String>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    seq: AtomicU64,
}

impl RunContext {
    /// Next per-run event sequence number. Strictly increasing from 1.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Terminal record of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub session_key: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub finished_at: DateTime<Utc>,
}

struct Inner {
    active: HashMap<String, Arc<RunContext>>,
    completed: HashMap<String, RunOutcome>,
    completed_order: VecDeque<String>,
}

/// Registry of active and recently finished runs. Clone-cheap, injected.
#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<Mutex<Inner>>,
    // Bumped on every completion; `wait` re-checks the map on each change.
    completion_tx: watch::Sender<u64>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        let (completion_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                active: HashMap::new(),
                completed: HashMap::new(),
                completed_order: VecDeque::new(),
            })),
            completion_tx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &self,
        run_id: &str,
        session_key: &str,
        session_id: &str,
        lane: &str,
        is_heartbeat: bool,
        client_run_id: Option<String>,
    ) -> Result<Arc<RunContext>, CourierError> {
        let mut inner = self.lock()?;
        if inner.active.contains_key(run_id) {
            return Err(CourierError::Conflict(format!(
                "run '{run_id}' is already active"
            )));
        }
        let ctx = Arc::new(RunContext {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            session_id: session_id.to_string(),
            lane: lane.to_string(),
            is_heartbeat,
            client_run_id,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
            seq: AtomicU64::new(0),
        });
        inner.active.insert(run_id.to_string(), ctx.clone());
        Ok(ctx)
    }

    pub fn find(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.lock().ok()?.active.get(run_id).cloned()
    }

    /// All active runs on a session key, oldest first.
    pub fn find_by_session_key(&self, session_key: &str) -> Vec<Arc<RunContext>> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut runs: Vec<Arc<RunContext>> = inner
            .active
            .values()
            .filter(|r| r.session_key == session_key)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Fire a run's cancellation token. Returns whether the run was active.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.find(run_id) {
            Some(ctx) => {
                debug!(run_id, "cancelling run");
                ctx.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run on a session. Returns how many were hit.
    pub fn cancel_session(&self, session_key: &str) -> usize {
        let runs = self.find_by_session_key(session_key);
        for run in &runs {
            run.cancel.cancel();
        }
        runs.len()
    }

    /// Retire a run into the completed history and wake waiters.
    pub fn finish(&self, outcome: RunOutcome) -> Result<(), CourierError> {
        let mut inner = self.lock()?;
        inner.active.remove(&outcome.run_id);
        inner
            .completed_order
            .push_back(outcome.run_id.clone());
        inner.completed.insert(outcome.run_id.clone(), outcome);
        while inner.completed_order.len() > COMPLETED_HISTORY {
            if let Some(evicted) = inner.completed_order.pop_front() {
                inner.completed.remove(&evicted);
            }
        }
        drop(inner);
        self.completion_tx.send_modify(|n| *n += 1);
        Ok(())
    }

    pub fn outcome(&self, run_id: &str) -> Option<RunOutcome> {
        self.lock().ok()?.completed.get(run_id).cloned()
    }

    /// Block until `run_id` finishes, up to `timeout`.
    ///
    /// Resolves immediately for already-finished runs; `NotFound` for runs
    /// the registry has never seen.
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> Result<RunOutcome, CourierError> {
        let mut rx = self.completion_tx.subscribe();
        {
            let inner = self.lock()?;
            if let Some(outcome) = inner.completed.get(run_id) {
                return Ok(outcome.clone());
            }
            if !inner.active.contains_key(run_id) {
                return Err(CourierError::NotFound(format!("run '{run_id}'")));
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CourierError::Timeout(format!(
                    "run '{run_id}' did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    if let Some(outcome) = self.outcome(run_id) {
                        return Ok(outcome);
                    }
                }
                Ok(Err(_)) => {
                    return Err(CourierError::Cancelled("run registry shut down".into()))
                }
                Err(_) => {
                    return Err(CourierError::Timeout(format!(
                        "run '{run_id}' did not finish within {}s",
                        timeout.as_secs()
                    )))
                }
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().map(|i| i.active.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, CourierError> {
        self.inner
            .lock()
            .map_err(|_| CourierError::Agent("run registry poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish_ok(registry: &RunRegistry, run_id: &str, session_key: &str) {
        registry
            .finish(RunOutcome {
                run_id: run_id.to_string(),
                session_key: session_key.to_string(),
                status: RunStatus::Completed,
                reply_text: Some("done".into()),
                error: None,
                usage: TokenUsage::default(),
                finished_at: Utc::now(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn begin_find_finish_wait() {
        let registry = RunRegistry::new();
        let ctx = registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        assert_eq!(ctx.next_seq(), 1);
        assert_eq!(ctx.next_seq(), 2);
        assert!(registry.find("r1").is_some());

        let reg = registry.clone();
        let waiter = tokio::spawn(async move { reg.wait("r1", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        finish_ok(&registry, "r1", "main");
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(registry.find("r1").is_none(), "finished run left active");
    }

    #[tokio::test]
    async fn wait_resolves_for_already_finished_run() {
        let registry = RunRegistry::new();
        registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        finish_ok(&registry, "r1", "main");
        let outcome = registry.wait("r1", Duration::from_millis(1)).await.unwrap();
        assert_eq!(outcome.run_id, "r1");
    }

    #[tokio::test]
    async fn wait_times_out_on_stuck_run() {
        let registry = RunRegistry::new();
        registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        let err = registry
            .wait("r1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout(_)));
    }

    #[tokio::test]
    async fn wait_on_unknown_run_is_not_found() {
        let registry = RunRegistry::new();
        assert!(matches!(
            registry.wait("ghost", Duration::from_millis(1)).await,
            Err(CourierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_fires_token() {
        let registry = RunRegistry::new();
        let ctx = registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        assert!(!ctx.cancel.is_cancelled());
        assert!(registry.cancel("r1"));
        assert!(ctx.cancel.is_cancelled());
        assert!(!registry.cancel("ghost"));
    }

    #[tokio::test]
    async fn cancel_session_hits_every_run_on_key() {
        let registry = RunRegistry::new();
        let a = registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        let b = registry
            .begin("r2", "main", "sid-1", "subagent", false, None)
            .unwrap();
        registry
            .begin("r3", "telegram:group:1", "sid-2", "main", false, None)
            .unwrap();

        assert_eq!(registry.cancel_session("main"), 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!registry.find("r3").unwrap().cancel.is_cancelled());
    }

    #[tokio::test]
    async fn duplicate_active_run_id_conflicts() {
        let registry = RunRegistry::new();
        registry
            .begin("r1", "main", "sid-1", "main", false, None)
            .unwrap();
        assert!(matches!(
            registry.begin("r1", "main", "sid-1", "main", false, None),
            Err(CourierError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn completed_history_is_bounded() {
        let registry = RunRegistry::new();
        for i in 0..(COMPLETED_HISTORY + 10) {
            let id = format!("r{i}");
            registry
                .begin(&id, "main", "sid", "main", false, None)
                .unwrap();
            finish_ok(&registry, &id, "main");
        }
        assert!(registry.outcome("r0").is_none(), "oldest should be evicted");
        assert!(registry
            .outcome(&format!("r{}", COMPLETED_HISTORY + 9))
            .is_some());
    }
}
