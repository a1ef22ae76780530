//! Background work-unit tracking — spawn, replace, and cancel long-running
//! polling units keyed by task id.
//!
//! Each unit owns a [`CancellationToken`]; cancellation is cooperative and
//! observed at the unit's next await point. A semaphore bounds how many
//! units poll concurrently; submissions beyond the cap either queue for a
//! permit or are rejected, depending on the configured policy.

use crate::config::OverflowPolicy;
use crate::error::{ResearchError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cancellation state shared between the executor and one unit.
#[derive(Clone)]
pub struct UnitSignal {
    token: CancellationToken,
    save_partial: Arc<AtomicBool>,
}

impl UnitSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            save_partial: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The token a unit selects against at every await point.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the cancelling caller asked for partial preservation.
    pub fn save_partial_requested(&self) -> bool {
        self.save_partial.load(Ordering::SeqCst)
    }
}

struct Unit {
    signal: UnitSignal,
    handle: JoinHandle<()>,
}

/// Tracks in-process background units, at most one per task id.
pub struct BackgroundExecutor {
    units: Arc<Mutex<HashMap<Uuid, Unit>>>,
    permits: Arc<Semaphore>,
    max_units: usize,
    overflow_policy: OverflowPolicy,
}

impl BackgroundExecutor {
    pub fn new(max_units: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            units: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_units)),
            max_units,
            overflow_policy,
        }
    }

    /// Start a unit for `task_id`, replacing and cancelling any prior unit
    /// under the same key. The factory receives the unit's signal and the
    /// concurrency permit is acquired inside the spawned future, so with the
    /// `queue` policy an over-cap unit waits its turn without blocking the
    /// caller.
    ///
    /// With the `reject` policy, returns `CapacityExceeded` when no permit is
    /// immediately available.
    pub fn start<F, Fut>(&self, task_id: Uuid, make_unit: F) -> Result<()>
    where
        F: FnOnce(UnitSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.overflow_policy == OverflowPolicy::Reject
            && self.permits.available_permits() == 0
            && !self.is_running(&task_id)
        {
            return Err(ResearchError::CapacityExceeded {
                max: self.max_units,
            });
        }

        let signal = UnitSignal::new();
        let future = make_unit(signal.clone());
        let permits = Arc::clone(&self.permits);
        let units = Arc::clone(&self.units);
        let unit_signal = signal.clone();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = unit_signal.token().cancelled() => {
                    debug!(task_id = %task_id, "unit cancelled while queued");
                    return;
                }
            };
            future.await;
            // Self-removal: only evict our own entry, not a replacement's.
            let mut map = units.lock().unwrap();
            if let Some(unit) = map.get(&task_id) {
                if Arc::ptr_eq(&unit.signal.save_partial, &unit_signal.save_partial) {
                    map.remove(&task_id);
                    debug!(task_id = %task_id, "background unit finished");
                }
            }
        });

        let previous = {
            let mut map = self.units.lock().unwrap();
            map.insert(task_id, Unit { signal, handle })
        };
        if let Some(prev) = previous {
            info!(task_id = %task_id, "replacing existing background unit");
            prev.signal.token.cancel();
            prev.handle.abort();
        }
        Ok(())
    }

    /// Request cooperative cancellation of the unit for `task_id`.
    /// Returns true if a running unit was signalled.
    pub fn cancel(&self, task_id: &Uuid, save_partial: bool) -> bool {
        let map = self.units.lock().unwrap();
        match map.get(task_id) {
            Some(unit) if !unit.handle.is_finished() => {
                unit.signal
                    .save_partial
                    .store(save_partial, Ordering::SeqCst);
                unit.signal.token.cancel();
                info!(task_id = %task_id, save_partial, "cancellation requested");
                true
            }
            _ => {
                debug!(task_id = %task_id, "no running unit to cancel");
                false
            }
        }
    }

    /// Whether a new unit could begin polling immediately.
    pub fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// The configured concurrency cap.
    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// The configured overflow policy.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Whether a unit for `task_id` is currently tracked and unfinished.
    pub fn is_running(&self, task_id: &Uuid) -> bool {
        let map = self.units.lock().unwrap();
        map.get(task_id)
            .map(|unit| !unit.handle.is_finished())
            .unwrap_or(false)
    }

    /// Ids of all tracked, unfinished units.
    pub fn running_ids(&self) -> Vec<Uuid> {
        let map = self.units.lock().unwrap();
        map.iter()
            .filter(|(_, unit)| !unit.handle.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Cancel every running unit and wait (bounded) for them to wind down.
    /// Returns the number of units that were signalled.
    pub async fn cancel_all(&self, timeout: Duration) -> usize {
        let handles: Vec<(Uuid, JoinHandle<()>)> = {
            let mut map = self.units.lock().unwrap();
            map.drain()
                .filter(|(_, unit)| !unit.handle.is_finished())
                .map(|(id, unit)| {
                    unit.signal.token.cancel();
                    (id, unit.handle)
                })
                .collect()
        };
        let count = handles.len();
        for (task_id, handle) in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(task_id = %task_id, "unit did not stop within shutdown timeout");
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn executor(max: usize, policy: OverflowPolicy) -> BackgroundExecutor {
        BackgroundExecutor::new(max, policy)
    }

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_and_self_removal() {
        let exec = executor(3, OverflowPolicy::Queue);
        let id = Uuid::new_v4();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);

        exec.start(id, move |_signal| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(exec.is_running(&id));
        assert_eq!(exec.running_ids(), vec![id]);

        wait_until(|| done.load(Ordering::SeqCst)).await;
        wait_until(|| !exec.is_running(&id)).await;
        assert!(exec.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_signals_token_and_flag() {
        let exec = executor(3, OverflowPolicy::Queue);
        let id = Uuid::new_v4();
        let observed_partial = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&observed_partial);

        exec.start(id, move |signal| async move {
            signal.token().cancelled().await;
            observed.store(signal.save_partial_requested(), Ordering::SeqCst);
        })
        .unwrap();

        assert!(exec.cancel(&id, true));
        wait_until(|| observed_partial.load(Ordering::SeqCst)).await;
        wait_until(|| !exec.is_running(&id)).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_returns_false() {
        let exec = executor(3, OverflowPolicy::Queue);
        assert!(!exec.cancel(&Uuid::new_v4(), false));
    }

    #[tokio::test]
    async fn test_replace_and_cancel_same_key() {
        let exec = executor(3, OverflowPolicy::Queue);
        let id = Uuid::new_v4();
        let first_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&first_cancelled);

        exec.start(id, move |signal| async move {
            signal.token().cancelled().await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let second_ran = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&second_ran);
        exec.start(id, move |_signal| async move {
            flag2.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .unwrap();

        wait_until(|| second_ran.load(Ordering::SeqCst)).await;
        // Exactly one unit remains tracked under the key.
        assert!(exec.is_running(&id));
        assert_eq!(exec.running_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_policy_defers_over_cap_units() {
        let exec = executor(1, OverflowPolicy::Queue);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            exec.start(Uuid::new_v4(), move |_signal| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_until(|| exec.running_ids().is_empty()).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_over_cap() {
        let exec = executor(1, OverflowPolicy::Reject);
        let first = Uuid::new_v4();
        exec.start(first, |signal| async move {
            signal.token().cancelled().await;
        })
        .unwrap();
        // Give the first unit time to take the permit.
        wait_until(|| exec.permits.available_permits() == 0).await;

        let err = exec
            .start(Uuid::new_v4(), |_signal| async {})
            .unwrap_err();
        assert!(matches!(err, ResearchError::CapacityExceeded { max: 1 }));

        // Replacing the permit-holder under the same key is still allowed.
        exec.start(first, |_signal| async {}).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let exec = executor(3, OverflowPolicy::Queue);
        for _ in 0..3 {
            exec.start(Uuid::new_v4(), |signal| async move {
                signal.token().cancelled().await;
            })
            .unwrap();
        }
        let cancelled = exec.cancel_all(Duration::from_secs(1)).await;
        assert_eq!(cancelled, 3);
        assert!(exec.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_queued_unit_cancellable_before_permit() {
        let exec = executor(1, OverflowPolicy::Queue);
        let holder = Uuid::new_v4();
        exec.start(holder, |signal| async move {
            signal.token().cancelled().await;
        })
        .unwrap();
        wait_until(|| exec.permits.available_permits() == 0).await;

        let queued = Uuid::new_v4();
        let body_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&body_ran);
        exec.start(queued, move |_signal| async move {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        // Cancel while still waiting for a permit: the body must never run.
        assert!(exec.cancel(&queued, false));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!body_ran.load(Ordering::SeqCst));

        exec.cancel(&holder, false);
        wait_until(|| exec.running_ids().is_empty()).await;
    }
}
