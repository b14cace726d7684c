//! Command lane scheduler.
//!
//! Every agent run is admitted through a named lane with a concurrency cap.
//! Admission is FIFO per lane; a released slot goes to the oldest waiter.
//! Slots are held by a guard whose Drop releases them, so a panicking or
//! cancelled run can never leak capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use courier_core::CourierError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Lane {
    max_concurrent: usize,
    in_flight: usize,
    // The admitted slot travels through the channel itself: if the waiter
    // is gone by then, the undelivered guard drops and the slot comes
    // back, so abandoned waiters can never leak capacity.
    waiters: VecDeque<oneshot::Sender<LaneSlot>>,
}

#[derive(Default)]
struct Lanes {
    lanes: HashMap<String, Lane>,
}

/// Shared lane state. Cheap to clone, injected wherever runs are admitted.
#[derive(Clone, Default)]
pub struct LaneScheduler {
    inner: Arc<Mutex<Lanes>>,
}

/// Snapshot of one lane, for `status` responses.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStatus {
    pub name: String,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub queued: usize,
}

impl LaneScheduler {
    /// Build a scheduler with the given lane caps. Caps of 0 are invalid
    /// and rejected by config validation before this is reached.
    pub fn new(caps: &[(&str, usize)]) -> Self {
        let mut lanes = HashMap::new();
        for (name, cap) in caps {
            lanes.insert(
                name.to_string(),
                Lane {
                    max_concurrent: *cap,
                    in_flight: 0,
                    waiters: VecDeque::new(),
                },
            );
        }
        Self {
            inner: Arc::new(Mutex::new(Lanes { lanes })),
        }
    }

    /// Acquire a slot in `lane`, waiting FIFO behind earlier requests when
    /// the lane is full. The returned guard releases the slot on drop.
    pub async fn acquire(&self, lane: &str) -> Result<LaneSlot, CourierError> {
        let rx = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| CourierError::Agent("lane state poisoned".into()))?;
            let state = inner
                .lanes
                .get_mut(lane)
                .ok_or_else(|| CourierError::NotFound(format!("lane '{lane}'")))?;
            if state.in_flight < state.max_concurrent {
                state.in_flight += 1;
                return Ok(self.slot(lane));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        debug!(lane, "lane full, queueing");
        // If this future is dropped before polling, the guard still in the
        // channel drops with it and releases the slot. Sender dropped
        // means the scheduler itself went away.
        rx.await
            .map_err(|_| CourierError::Cancelled(format!("lane '{lane}' shut down")))
    }

    fn slot(&self, lane: &str) -> LaneSlot {
        LaneSlot {
            scheduler: self.clone(),
            lane: lane.to_string(),
            released: false,
        }
    }

    /// Adjust a lane's cap at runtime. Raising it admits queued waiters
    /// immediately; lowering it lets in-flight runs finish and bites on
    /// the next admission.
    pub fn set_max_concurrent(&self, lane: &str, cap: usize) -> Result<(), CourierError> {
        if cap == 0 {
            return Err(CourierError::InvalidRequest(format!(
                "lane '{lane}' max_concurrent must be at least 1"
            )));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CourierError::Agent("lane state poisoned".into()))?;
        let state = inner
            .lanes
            .get_mut(lane)
            .ok_or_else(|| CourierError::NotFound(format!("lane '{lane}'")))?;
        state.max_concurrent = cap;
        self.admit_waiters(lane, state);
        Ok(())
    }

    pub fn status(&self) -> Vec<LaneStatus> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<LaneStatus> = inner
            .lanes
            .iter()
            .map(|(name, lane)| LaneStatus {
                name: name.clone(),
                max_concurrent: lane.max_concurrent,
                in_flight: lane.in_flight,
                queued: lane.waiters.len(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn release(&self, lane: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(state) = inner.lanes.get_mut(lane) else {
            warn!(lane, "released slot on unknown lane");
            return;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        self.admit_waiters(lane, state);
    }

    /// Hand slots to queued waiters while capacity allows, reclaiming
    /// slots whose receivers were dropped (cancelled before admission).
    /// Caller holds the lane lock, so a refused send is reclaimed inline
    /// rather than through the guard's drop path.
    fn admit_waiters(&self, lane: &str, state: &mut Lane) {
        while state.in_flight < state.max_concurrent {
            let Some(tx) = state.waiters.pop_front() else {
                break;
            };
            state.in_flight += 1;
            if let Err(mut unsent) = tx.send(self.slot(lane)) {
                unsent.released = true;
                state.in_flight -= 1;
            }
        }
    }
}

/// An admitted lane slot. Dropping it releases the slot and admits the
/// next waiter.
pub struct LaneSlot {
    scheduler: LaneScheduler,
    lane: String,
    released: bool,
}

impl LaneSlot {
    pub fn lane(&self) -> &str {
        &self.lane
    }
}

impl Drop for LaneSlot {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.scheduler.release(&self.lane);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_scheduler() -> LaneScheduler {
        LaneScheduler::new(&[("main", 2), ("cron", 1)])
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_cap() {
        let sched = test_scheduler();
        let a = sched.acquire("main").await.unwrap();
        let _b = sched.acquire("main").await.unwrap();

        // Third acquire must block until a slot is released.
        let sched2 = sched.clone();
        let third = tokio::spawn(async move { sched2.acquire("main").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished(), "third acquire admitted over cap");

        drop(a);
        let slot = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(slot.lane(), "main");
    }

    #[tokio::test]
    async fn admission_is_fifo() {
        let sched = test_scheduler();
        let gate = sched.acquire("cron").await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let sched = sched.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _slot = sched.acquire("cron").await.unwrap();
                order_tx.send(i).unwrap();
            });
            // Enqueue deterministically.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(gate);
        for expected in 0..3 {
            let got = tokio::time::timeout(Duration::from_secs(1), order_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected, "waiters admitted out of order");
        }
    }

    #[tokio::test]
    async fn cron_lane_never_overlaps() {
        let sched = test_scheduler();
        let first = sched.acquire("cron").await.unwrap();
        let sched2 = sched.clone();
        let second = tokio::spawn(async move { sched2.acquire("cron").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(first);
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn raising_cap_admits_queued_waiters() {
        let sched = test_scheduler();
        let _held = sched.acquire("cron").await.unwrap();
        let sched2 = sched.clone();
        let queued = tokio::spawn(async move { sched2.acquire("cron").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        sched.set_max_concurrent("cron", 2).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn dropped_slot_releases_even_without_use() {
        let sched = test_scheduler();
        for _ in 0..10 {
            let slot = sched.acquire("cron").await.unwrap();
            drop(slot);
        }
        let status = sched.status();
        let cron = status.iter().find(|l| l.name == "cron").unwrap();
        assert_eq!(cron.in_flight, 0);
        assert_eq!(cron.queued, 0);
    }

    #[tokio::test]
    async fn unknown_lane_is_not_found() {
        let sched = test_scheduler();
        assert!(matches!(
            sched.acquire("bogus").await,
            Err(CourierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn zero_cap_update_rejected() {
        let sched = test_scheduler();
        assert!(matches!(
            sched.set_max_concurrent("main", 0).unwrap_err(),
            CourierError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn aborted_waiter_never_leaks_capacity() {
        let sched = test_scheduler();
        let held = sched.acquire("cron").await.unwrap();

        // Waiter that would hold its slot forever once admitted.
        let sched2 = sched.clone();
        let waiter = tokio::spawn(async move {
            let _slot = sched2.acquire("cron").await.unwrap();
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Release the lane, then kill the waiter. Whether the abort lands
        // before or after it polls the handed-off slot, the slot must come
        // back to the lane.
        drop(held);
        waiter.abort();
        let _ = waiter.await;

        let reacquired = tokio::time::timeout(Duration::from_secs(1), sched.acquire("cron"))
            .await
            .expect("slot leaked to an aborted waiter");
        assert!(reacquired.is_ok());
        let status = sched.status();
        let cron = status.iter().find(|l| l.name == "cron").unwrap();
        assert_eq!(cron.in_flight, 1);
        assert_eq!(cron.queued, 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let sched = test_scheduler();
        let held = sched.acquire("cron").await.unwrap();

        // First waiter gives up before admission.
        let sched2 = sched.clone();
        let abandoned = tokio::spawn(async move { sched2.acquire("cron").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        // Second waiter must still get the slot.
        let sched3 = sched.clone();
        let second = tokio::spawn(async move { sched3.acquire("cron").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        assert!(tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }
}
