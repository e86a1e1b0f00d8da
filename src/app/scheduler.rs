//! Adaptive polling scheduler.
//!
//! Re-invokes a refresh callback per operation id at intervals that start
//! aggressive right after submission and decay to a steady cadence, bounding
//! load on the gateway. Polling for an id stops the moment its refresh
//! reports a terminal state, or when the subscription is cancelled.
//! Independent of any presentation lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{AppError, OperationId};

/// Outcome of a single refresh invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep polling
    Continue,
    /// The record reached a terminal state; stop polling
    Terminal,
}

/// Maps elapsed-time-since-submission to the delay before the next poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Interval used while the operation is fresh
    pub fast_interval: Duration,
    /// How long after submission the fast interval applies
    pub fast_window: Duration,
    /// Steady cadence once the fast window has passed
    pub steady_interval: Duration,
}

impl PollSchedule {
    #[must_use]
    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        if elapsed < self.fast_window {
            self.fast_interval
        } else {
            self.steady_interval
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(2),
            fast_window: Duration::from_secs(300),
            steady_interval: Duration::from_secs(30),
        }
    }
}

/// Handle returned by [`PollScheduler::watch`]; pass to `cancel` to stop
/// the subscription early
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: OperationId,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.id
    }
}

struct Subscription {
    generation: u64,
    cancel: watch::Sender<bool>,
}

/// Shared polling scheduler. Owns all `PollSubscription`s; at most one
/// in-flight refresh per id at any time.
pub struct PollScheduler {
    subscriptions: Arc<DashMap<OperationId, Subscription>>,
    next_generation: AtomicU64,
}

impl PollScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start polling `id`, invoking `refresh` at intervals defined by
    /// `schedule`. A new poll is scheduled only after the previous one
    /// settles, so a slow refresh never overlaps with the next. Watching an
    /// id that is already watched replaces the existing subscription.
    pub fn watch<F, Fut>(
        &self,
        id: OperationId,
        schedule: PollSchedule,
        refresh: F,
    ) -> SubscriptionHandle
    where
        F: Fn(OperationId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PollOutcome, AppError>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        if let Some(previous) = self.subscriptions.insert(
            id.clone(),
            Subscription {
                generation,
                cancel: cancel_tx,
            },
        ) {
            debug!(id = %id, "Replacing existing poll subscription");
            let _ = previous.cancel.send(true);
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let task_id = id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                let delay = schedule.delay_after(started.elapsed());
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            debug!(id = %task_id, "Poll subscription cancelled");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {
                        match refresh(task_id.clone()).await {
                            Ok(PollOutcome::Terminal) => {
                                debug!(id = %task_id, "Polling stopped: terminal state reached");
                                subscriptions
                                    .remove_if(&task_id, |_, sub| sub.generation == generation);
                                break;
                            }
                            Ok(PollOutcome::Continue) => {}
                            Err(e) => {
                                // a single failed poll just schedules the next one
                                warn!(id = %task_id, error = %e, "Poll failed");
                            }
                        }
                    }
                }
            }
        });

        SubscriptionHandle { id }
    }

    /// Stop polling for a subscription. Idempotent: cancelling twice, or
    /// cancelling an already-terminal subscription, is a no-op.
    pub fn cancel(&self, handle: &SubscriptionHandle) {
        self.cancel_id(&handle.id);
    }

    /// Stop polling for an id. Idempotent.
    pub fn cancel_id(&self, id: &OperationId) {
        if let Some((_, subscription)) = self.subscriptions.remove(id) {
            let _ = subscription.cancel.send(true);
        }
    }

    #[must_use]
    pub fn is_watching(&self, id: &OperationId) -> bool {
        self.subscriptions.contains_key(id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_id(tag: &str) -> OperationId {
        OperationId::for_transfer(tag, "ledger-b", Utc::now())
    }

    fn quick_schedule() -> PollSchedule {
        PollSchedule {
            fast_interval: Duration::from_millis(10),
            fast_window: Duration::from_secs(60),
            steady_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delay_after_decays() {
        let schedule = PollSchedule {
            fast_interval: Duration::from_secs(2),
            fast_window: Duration::from_secs(300),
            steady_interval: Duration::from_secs(30),
        };

        assert_eq!(
            schedule.delay_after(Duration::ZERO),
            Duration::from_secs(2)
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(299)),
            Duration::from_secs(2)
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(300)),
            Duration::from_secs(30)
        );
        assert_eq!(
            schedule.delay_after(Duration::from_secs(10_000)),
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_polls_until_terminal() {
        let scheduler = PollScheduler::new();
        let id = test_id("terminal");
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let counter = Arc::clone(&calls);
        scheduler.watch(id.clone(), quick_schedule(), move |_| {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    let _ = done_tx.send(()).await;
                    Ok(PollOutcome::Terminal)
                } else {
                    Ok(PollOutcome::Continue)
                }
            }
        });

        done_rx.recv().await.unwrap();
        // allow the task to deregister itself
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_schedules_next_poll() {
        let scheduler = PollScheduler::new();
        let id = test_id("errors");
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let counter = Arc::clone(&calls);
        scheduler.watch(id.clone(), quick_schedule(), move |id| {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                match n {
                    1 => Err(AppError::Gateway(
                        crate::domain::GatewayError::Connection(format!(
                            "poll {id} unreachable"
                        )),
                    )),
                    2 => Ok(PollOutcome::Continue),
                    _ => {
                        let _ = done_tx.send(()).await;
                        Ok(PollOutcome::Terminal)
                    }
                }
            }
        });

        done_rx.recv().await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_invocations_never_overlap() {
        let scheduler = PollScheduler::new();
        let id = test_id("overlap");
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let gauge = Arc::clone(&in_flight);
        let high_water = Arc::clone(&max_in_flight);
        let counter = Arc::clone(&calls);
        // refresh takes much longer than the poll interval
        scheduler.watch(id.clone(), quick_schedule(), move |_| {
            let gauge = Arc::clone(&gauge);
            let high_water = Arc::clone(&high_water);
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            async move {
                let current = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);

                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 4 {
                    let _ = done_tx.send(()).await;
                    Ok(PollOutcome::Terminal)
                } else {
                    Ok(PollOutcome::Continue)
                }
            }
        });

        done_rx.recv().await.unwrap();
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let scheduler = PollScheduler::new();
        let id = test_id("cancel");

        let handle = scheduler.watch(id.clone(), quick_schedule(), move |_| async move {
            Ok(PollOutcome::Continue)
        });
        assert!(scheduler.is_watching(&id));

        scheduler.cancel(&handle);
        assert!(!scheduler.is_watching(&id));

        // second cancel is a no-op, not an error
        scheduler.cancel(&handle);
        scheduler.cancel_id(&id);
        assert!(!scheduler.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatch_replaces_subscription() {
        let scheduler = PollScheduler::new();
        let id = test_id("replace");

        scheduler.watch(id.clone(), quick_schedule(), move |_| async move {
            Ok(PollOutcome::Continue)
        });
        scheduler.watch(id.clone(), quick_schedule(), move |_| async move {
            Ok(PollOutcome::Continue)
        });

        assert_eq!(scheduler.active_count(), 1);
        scheduler.cancel_id(&id);
        assert_eq!(scheduler.active_count(), 0);
    }
}
