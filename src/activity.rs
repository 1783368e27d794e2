//! Traffic activity tracking and the quiescence barrier.
//!
//! # Responsibilities
//! - Count in-flight requests per instance
//! - Timestamp every activity event (request started, request completed)
//! - Let control callers wait until an instance has gone quiet
//!
//! # Design Decisions
//! - State lives in a `watch` channel: waiters sleep on `changed()` or on a
//!   timer, never poll, and never hold a lock across an await
//! - The engine reports activity through an RAII guard, so a request that
//!   panics or is cancelled still counts as completed
//! - Deleting the instance flips `removed`, which wakes every waiter

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, Copy)]
struct ActivityState {
    in_flight: u64,
    last_event: Instant,
    removed: bool,
}

/// Per-instance activity monitor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    state: Arc<watch::Sender<ActivityState>>,
}

impl ActivityMonitor {
    /// Create a monitor. The quiet clock starts now.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ActivityState {
            in_flight: 0,
            last_event: Instant::now(),
            removed: false,
        });
        Self { state: Arc::new(tx) }
    }

    /// Record a request start. The returned guard records completion on drop.
    pub fn begin(&self) -> ActivityGuard {
        self.state.send_modify(|s| {
            s.in_flight += 1;
            s.last_event = Instant::now();
        });
        ActivityGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Requests currently between start and completion.
    pub fn in_flight(&self) -> u64 {
        self.state.borrow().in_flight
    }

    /// Resolve all outstanding and future waits with `InstanceRemoved`.
    pub fn mark_removed(&self) {
        self.state.send_modify(|s| s.removed = true);
    }

    /// Wait until no activity event has happened for `quiet` and nothing is
    /// in flight, or fail once `timeout` has elapsed.
    pub async fn wait_for_quiescence(&self, quiet: Duration, timeout: Duration) -> FleetResult<()> {
        if quiet > timeout {
            return Err(FleetError::TimedOut);
        }

        let deadline = Instant::now() + timeout;
        let mut rx = self.state.subscribe();

        loop {
            let state = *rx.borrow_and_update();
            if state.removed {
                return Err(FleetError::InstanceRemoved);
            }

            let now = Instant::now();
            let quiet_until = state.last_event + quiet;
            if state.in_flight == 0 && quiet_until <= now {
                return Ok(());
            }
            if now >= deadline {
                return Err(FleetError::TimedOut);
            }

            // With requests in flight only a state change can help; otherwise
            // wake when the quiet period would be complete.
            let wake_at = if state.in_flight == 0 {
                quiet_until.min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(FleetError::InstanceRemoved);
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks one request's lifetime.
/// Records a completion event when dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    state: Arc<watch::Sender<ActivityState>>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.last_event = Instant::now();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn test_idle_instance_goes_quiet() {
        let monitor = ActivityMonitor::new();
        let started = Instant::now();
        monitor.wait_for_quiescence(ms(50), ms(1000)).await.unwrap();
        assert!(started.elapsed() < ms(500));
    }

    #[tokio::test]
    async fn test_quiet_longer_than_timeout_fails_immediately() {
        let monitor = ActivityMonitor::new();
        let started = Instant::now();
        let result = monitor.wait_for_quiescence(ms(2000), ms(1000)).await;
        assert!(matches!(result, Err(FleetError::TimedOut)));
        assert!(started.elapsed() < ms(100));
    }

    #[tokio::test]
    async fn test_event_resets_quiet_clock() {
        let monitor = ActivityMonitor::new();
        let started = Instant::now();
        let pinger = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ms(40)).await;
            drop(pinger.begin());
        });

        monitor.wait_for_quiescence(ms(50), ms(1000)).await.unwrap();
        assert!(started.elapsed() >= ms(85), "waited only {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_reset_past_deadline_times_out() {
        let monitor = ActivityMonitor::new();
        let pinger = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ms(20)).await;
            drop(pinger.begin());
        });

        let result = monitor.wait_for_quiescence(ms(50), ms(60)).await;
        assert!(matches!(result, Err(FleetError::TimedOut)));
    }

    #[tokio::test]
    async fn test_deadline_is_not_reset_by_events() {
        let monitor = ActivityMonitor::new();
        let pinger = monitor.clone();
        let noise = tokio::spawn(async move {
            for _ in 0..20 {
                drop(pinger.begin());
                tokio::time::sleep(ms(20)).await;
            }
        });

        let started = Instant::now();
        let result = monitor.wait_for_quiescence(ms(50), ms(150)).await;
        assert!(matches!(result, Err(FleetError::TimedOut)));
        assert!(started.elapsed() < ms(300));
        noise.abort();
    }

    #[tokio::test]
    async fn test_in_flight_request_blocks_quiescence() {
        let monitor = ActivityMonitor::new();
        let guard = monitor.begin();
        assert_eq!(monitor.in_flight(), 1);

        let result = monitor.wait_for_quiescence(ms(10), ms(100)).await;
        assert!(matches!(result, Err(FleetError::TimedOut)));

        drop(guard);
        assert_eq!(monitor.in_flight(), 0);
        monitor.wait_for_quiescence(ms(10), ms(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_wakes_waiter() {
        let monitor = ActivityMonitor::new();
        let _busy = monitor.begin();

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_for_quiescence(ms(50), ms(5000)).await })
        };
        tokio::time::sleep(ms(20)).await;
        monitor.mark_removed();

        let result = tokio::time::timeout(ms(1000), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(FleetError::InstanceRemoved)));
    }
}
