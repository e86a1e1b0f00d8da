//! Delayed-release tracker.
//!
//! Tracks redemption requests gated by a server-enforced delay window:
//! readiness is re-evaluated continuously against the local clock, but the
//! queue's own verdict is authoritative before fulfillment, guarding against
//! client clock skew.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SubsecRound, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, DelayedRequest, InvariantViolation, LedgerGateway, OperationId, OperationStore,
    Readiness, RequestStatus, StatusEvent, StoreError, SubmitRedemption, ValidationError,
};

use super::config::TrackerConfig;
use super::scheduler::{PollOutcome, PollScheduler};

struct CachedWindow {
    window: Duration,
    fetched_at: Instant,
}

/// Tracker managing the delayed-request state machine
pub struct RedemptionTracker {
    store: Arc<dyn OperationStore>,
    gateway: Arc<dyn LedgerGateway>,
    scheduler: Arc<PollScheduler>,
    config: TrackerConfig,
    events: broadcast::Sender<StatusEvent>,
    /// Delay windows rarely change; cached per queue with a long TTL
    delay_windows: DashMap<String, CachedWindow>,
    /// Ids with a fulfillment attempt in progress, claimed for the whole
    /// check-write-commit sequence. The gateway write is not idempotent, so
    /// it must never be issued twice concurrently.
    in_flight: DashMap<OperationId, ()>,
}

impl RedemptionTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        gateway: Arc<dyn LedgerGateway>,
        scheduler: Arc<PollScheduler>,
        config: TrackerConfig,
        events: broadcast::Sender<StatusEvent>,
    ) -> Self {
        Self {
            store,
            gateway,
            scheduler,
            config,
            events,
            delay_windows: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// The delay window for a queue, served from cache when fresh
    pub async fn delay_window(&self, queue_id: &str) -> Result<Duration, AppError> {
        if let Some(cached) = self.delay_windows.get(queue_id) {
            if cached.fetched_at.elapsed() < self.config.delay_window_ttl {
                return Ok(cached.window);
            }
        }
        let window = self.gateway.read_delay_window(queue_id).await?;
        self.delay_windows.insert(
            queue_id.to_string(),
            CachedWindow {
                window,
                fetched_at: Instant::now(),
            },
        );
        Ok(window)
    }

    /// Submit a new delayed redemption request.
    ///
    /// At most one active, unfulfilled request per (owner, queue): a second
    /// submission while one is outstanding is rejected, not queued. The
    /// local check is a fast path; the gateway write remains the source of
    /// truth and may still reject.
    #[instrument(skip(self, request), fields(owner = %request.owner, queue = %request.queue_id, amount = %request.amount))]
    pub async fn submit_request(
        &self,
        request: &SubmitRedemption,
    ) -> Result<DelayedRequest, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        if let Some(existing) = self
            .store
            .active_request_for(&request.owner, &request.queue_id)
            .await?
        {
            warn!(id = %existing.id, "Redemption rejected: request already outstanding");
            return Err(InvariantViolation::AlreadyPending {
                owner: request.owner.clone(),
                queue_id: request.queue_id.clone(),
            }
            .into());
        }

        let window = self.delay_window(&request.queue_id).await?;
        let ack = self
            .gateway
            .submit_request(
                &request.owner,
                &request.queue_id,
                &request.asset,
                request.amount,
            )
            .await?;

        // sqlite keeps microsecond precision
        let requested_at = Utc::now().trunc_subsecs(6);
        let record = DelayedRequest::new(request, ack.target_amount, window, requested_at);
        self.store.put_request(&record).await?;
        self.emit(StatusEvent::Request {
            id: record.id.clone(),
            status: record.status,
        });
        self.watch(&record.id);

        info!(id = %record.id, ready_at = %record.ready_at(), "Delayed request accepted");
        Ok(record)
    }

    /// Readiness of a stored request against the current clock
    pub async fn evaluate(&self, id: &OperationId) -> Result<Readiness, AppError> {
        let request = self
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        Ok(request.evaluate())
    }

    /// Fulfill a ready request.
    ///
    /// The local clock-based verdict is advisory; the queue's own readiness
    /// check is authoritative. Exactly one gateway fulfillment write is
    /// issued per request: the per-id claim is held across every check, the
    /// gateway write, and the store commit, so a concurrent caller backs
    /// off with `FulfillmentInFlight` instead of issuing a second write.
    #[instrument(skip(self))]
    pub async fn fulfill(&self, id: &OperationId) -> Result<DelayedRequest, AppError> {
        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(
                    InvariantViolation::FulfillmentInFlight { id: id.to_string() }.into(),
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let result = self.fulfill_under_claim(id).await;
        self.in_flight.remove(id);
        let fulfilled = result?;

        self.scheduler.cancel_id(id);
        self.emit(StatusEvent::Request {
            id: fulfilled.id.clone(),
            status: fulfilled.status,
        });
        Ok(fulfilled)
    }

    async fn fulfill_under_claim(&self, id: &OperationId) -> Result<DelayedRequest, AppError> {
        let request = self
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;

        match request.status {
            RequestStatus::Fulfilled => {
                return Err(InvariantViolation::AlreadyFulfilled { id: id.to_string() }.into());
            }
            RequestStatus::Cancelled => {
                return Err(InvariantViolation::IllegalTransition {
                    id: id.to_string(),
                    from: RequestStatus::Cancelled.to_string(),
                    to: RequestStatus::Fulfilled.to_string(),
                }
                .into());
            }
            RequestStatus::Locked | RequestStatus::Ready => {}
        }

        let verdict = request.evaluate();
        if !verdict.is_ready {
            return Err(InvariantViolation::NotReady {
                id: id.to_string(),
                remaining_secs: verdict.remaining.as_secs(),
            }
            .into());
        }

        match self
            .gateway
            .read_pending_request(&request.owner, &request.queue_id)
            .await?
        {
            None => {
                // the queue already settled or dropped it
                return Err(InvariantViolation::AlreadyFulfilled { id: id.to_string() }.into());
            }
            Some(view) if !view.is_ready => {
                warn!(id = %id, "Local clock says ready but queue disagrees");
                let window = self.delay_window(&request.queue_id).await?;
                let server_ready_at = view.requested_at
                    + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
                let remaining = (server_ready_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                return Err(InvariantViolation::NotReady {
                    id: id.to_string(),
                    remaining_secs: remaining.as_secs().max(1),
                }
                .into());
            }
            Some(_) => {}
        }

        // a gateway failure leaves the record unchanged
        let receipt = self.gateway.submit_fulfillment(id).await?;
        let now = Utc::now().trunc_subsecs(6);
        let fulfilled = self
            .store
            .update_request(id, Box::new(move |r| r.clone().fulfill(now)))
            .await?;
        info!(id = %id, receipt = %receipt, "Delayed request fulfilled");
        Ok(fulfilled)
    }

    /// Fetch a request by id
    pub async fn get(&self, id: &OperationId) -> Result<Option<DelayedRequest>, AppError> {
        self.store.get_request(id).await
    }

    /// Run one refresh probe for a request; normally invoked by the
    /// scheduler
    pub async fn refresh(&self, id: &OperationId) -> Result<PollOutcome, AppError> {
        refresh_request(
            Arc::clone(&self.store),
            Arc::clone(&self.gateway),
            self.events.clone(),
            id.clone(),
        )
        .await
    }

    /// Register (or re-register) readiness polling for a request
    pub(crate) fn watch(&self, id: &OperationId) {
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        let events = self.events.clone();
        self.scheduler
            .watch(id.clone(), self.config.redemption_poll, move |id| {
                let store = Arc::clone(&store);
                let gateway = Arc::clone(&gateway);
                let events = events.clone();
                async move { refresh_request(store, gateway, events, id).await }
            });
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }
}

/// One polling probe of a delayed request.
///
/// `locked -> ready` is a pure time-based transition; the gateway read only
/// confirms the queue has not independently dropped the request.
pub(crate) async fn refresh_request(
    store: Arc<dyn OperationStore>,
    gateway: Arc<dyn LedgerGateway>,
    events: broadcast::Sender<StatusEvent>,
    id: OperationId,
) -> Result<PollOutcome, AppError> {
    let Some(request) = store.get_request(&id).await? else {
        warn!(id = %id, "Polled request missing from store");
        return Ok(PollOutcome::Terminal);
    };
    if request.is_terminal() {
        return Ok(PollOutcome::Terminal);
    }

    let view = gateway
        .read_pending_request(&request.owner, &request.queue_id)
        .await?;
    if view.is_none() {
        warn!(id = %id, "Request no longer present on queue");
        let now = Utc::now().trunc_subsecs(6);
        let updated = store
            .update_request(
                &id,
                Box::new(move |r| r.clone().cancel("request no longer present on queue", now)),
            )
            .await?;
        let _ = events.send(StatusEvent::Request {
            id: id.clone(),
            status: updated.status,
        });
        return Ok(PollOutcome::Terminal);
    }

    if request.status == RequestStatus::Locked && request.evaluate().is_ready {
        let now = Utc::now().trunc_subsecs(6);
        let updated = store
            .update_request(&id, Box::new(move |r| r.clone().mark_ready(now)))
            .await?;
        info!(id = %id, "Delayed request is ready for fulfillment");
        let _ = events.send(StatusEvent::Request {
            id: id.clone(),
            status: updated.status,
        });
    }

    Ok(PollOutcome::Continue)
}
