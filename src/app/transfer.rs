//! Transfer lifecycle engine.
//!
//! Drives a single cross-ledger transfer from submission through
//! confirmation on both ledgers. The engine computes pure transitions and
//! applies them through the operation store; polling is delegated to the
//! shared scheduler.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, ConfirmationStatus, FeeQuote, GatewayError, InvariantViolation, LedgerGateway,
    OperationId, OperationStore, StatusEvent, StoreError, SubmitTransfer, Transfer,
    TransferStatus, ValidationError,
};

use super::config::TrackerConfig;
use super::scheduler::{PollOutcome, PollScheduler};

/// Engine managing the transfer state machine
pub struct TransferEngine {
    store: Arc<dyn OperationStore>,
    gateway: Arc<dyn LedgerGateway>,
    scheduler: Arc<PollScheduler>,
    config: TrackerConfig,
    events: broadcast::Sender<StatusEvent>,
}

impl TransferEngine {
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
        }
    }

    /// Obtain an advisory fee quote for a route and amount. Side-effect
    /// free; the quote must be re-requested if any input changes.
    #[instrument(skip(self))]
    pub async fn quote(
        &self,
        source_ledger: &str,
        destination_ledger: &str,
        amount: u64,
        recipient: &str,
    ) -> Result<FeeQuote, AppError> {
        if amount == 0 {
            return Err(GatewayError::QuoteUnavailable("amount is zero".to_string()).into());
        }
        if source_ledger == destination_ledger {
            return Err(GatewayError::QuoteUnavailable(format!(
                "{} -> {} is not a route",
                source_ledger, destination_ledger
            ))
            .into());
        }
        self.gateway
            .quote_transfer_fee(source_ledger, destination_ledger, amount, recipient)
            .await
    }

    /// Validate, persist, and submit a new transfer. None of the pre-checks
    /// mutate the store; once persisted the record is registered with the
    /// scheduler before the gateway submission is issued.
    #[instrument(skip(self, request), fields(source = %request.source_ledger, destination = %request.destination_ledger, amount = %request.amount))]
    pub async fn submit(&self, request: &SubmitTransfer) -> Result<Transfer, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        if request.source_ledger == request.destination_ledger {
            return Err(ValidationError::SameLedger(request.source_ledger.clone()).into());
        }

        if !request.fee.covers(
            &request.source_ledger,
            &request.destination_ledger,
            request.amount,
        ) {
            return Err(ValidationError::StaleQuote {
                source_ledger: request.fee.source_ledger.clone(),
                destination: request.fee.destination_ledger.clone(),
                amount: request.fee.amount,
            }
            .into());
        }

        // Route support is re-checked against the gateway: a quote that no
        // longer resolves means the pair was disabled since quoting.
        self.gateway
            .quote_transfer_fee(
                &request.source_ledger,
                &request.destination_ledger,
                request.amount,
                &request.recipient,
            )
            .await
            .map_err(|e| match e {
                AppError::Gateway(GatewayError::QuoteUnavailable(_)) => {
                    AppError::Gateway(GatewayError::UnsupportedRoute {
                        source_ledger: request.source_ledger.clone(),
                        destination: request.destination_ledger.clone(),
                    })
                }
                other => other,
            })?;

        let balance = self
            .gateway
            .read_balance(&request.source_ledger, &request.sender, &request.asset)
            .await?;
        if balance < request.amount {
            warn!(available = balance, required = request.amount, "Insufficient balance");
            return Err(GatewayError::InsufficientBalance {
                available: balance,
                required: request.amount,
            }
            .into());
        }

        // sqlite keeps microsecond precision
        let submitted_at = Utc::now().trunc_subsecs(6);
        let transfer = Transfer::new(request, submitted_at);
        self.store.put_transfer(&transfer).await?;
        self.emit(StatusEvent::Transfer {
            id: transfer.id.clone(),
            status: transfer.status,
        });
        self.watch(&transfer.id);

        info!(id = %transfer.id, "Transfer persisted, issuing source-ledger submission");

        match self.gateway.submit_transfer(&transfer).await {
            Ok(receipt) => {
                let now = Utc::now().trunc_subsecs(6);
                let updated = self
                    .store
                    .update_transfer(
                        &transfer.id,
                        Box::new(move |t| t.clone().attach_source_receipt(receipt, now)),
                    )
                    .await?;
                info!(id = %updated.id, "Transfer accepted by source ledger");
                Ok(updated)
            }
            Err(e) => {
                warn!(id = %transfer.id, error = %e, "Submission rejected by gateway");
                let reason = e.to_string();
                let now = Utc::now().trunc_subsecs(6);
                let failed = self
                    .store
                    .update_transfer(
                        &transfer.id,
                        Box::new(move |t| t.clone().fail(reason, now)),
                    )
                    .await?;
                self.scheduler.cancel_id(&failed.id);
                self.emit(StatusEvent::Transfer {
                    id: failed.id.clone(),
                    status: failed.status,
                });
                Err(e)
            }
        }
    }

    /// Explicitly retry a failed transfer with its original parameters and a
    /// fresh fee quote. Only legal from `failed`.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: &OperationId) -> Result<Transfer, AppError> {
        let transfer = self
            .store
            .get_transfer(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;

        if transfer.status != TransferStatus::Failed {
            return Err(InvariantViolation::NotRetryable {
                id: id.to_string(),
                status: transfer.status.to_string(),
            }
            .into());
        }

        // the fee from the failed attempt is not reused silently
        let fresh = self
            .gateway
            .quote_transfer_fee(
                &transfer.source_ledger,
                &transfer.destination_ledger,
                transfer.amount,
                &transfer.recipient,
            )
            .await?;
        let fee = fresh.fee;

        let now = Utc::now().trunc_subsecs(6);
        let pending = self
            .store
            .update_transfer(id, Box::new(move |t| t.clone().begin_retry(fee, now)))
            .await?;
        info!(id = %id, retry_count = pending.retry_count, "Retrying transfer");
        self.emit(StatusEvent::Transfer {
            id: pending.id.clone(),
            status: pending.status,
        });
        self.watch(&pending.id);

        match self.gateway.submit_transfer(&pending).await {
            Ok(receipt) => {
                let now = Utc::now().trunc_subsecs(6);
                let updated = self
                    .store
                    .update_transfer(
                        id,
                        Box::new(move |t| t.clone().attach_source_receipt(receipt, now)),
                    )
                    .await?;
                info!(id = %id, "Retry accepted by source ledger");
                Ok(updated)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Retry rejected by gateway");
                let reason = e.to_string();
                let now = Utc::now().trunc_subsecs(6);
                let failed = self
                    .store
                    .update_transfer(id, Box::new(move |t| t.clone().fail(reason, now)))
                    .await?;
                self.scheduler.cancel_id(&failed.id);
                self.emit(StatusEvent::Transfer {
                    id: failed.id.clone(),
                    status: failed.status,
                });
                Err(e)
            }
        }
    }

    /// Fetch a transfer by id
    pub async fn get(&self, id: &OperationId) -> Result<Option<Transfer>, AppError> {
        self.store.get_transfer(id).await
    }

    /// Run one refresh probe for a transfer; normally invoked by the
    /// scheduler
    pub async fn refresh(&self, id: &OperationId) -> Result<PollOutcome, AppError> {
        refresh_transfer(
            Arc::clone(&self.store),
            Arc::clone(&self.gateway),
            self.config.clone(),
            self.events.clone(),
            id.clone(),
        )
        .await
    }

    /// Register (or re-register) confirmation polling for a transfer
    pub(crate) fn watch(&self, id: &OperationId) {
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        let config = self.config.clone();
        let events = self.events.clone();
        self.scheduler
            .watch(id.clone(), self.config.transfer_poll, move |id| {
                let store = Arc::clone(&store);
                let gateway = Arc::clone(&gateway);
                let config = config.clone();
                let events = events.clone();
                async move { refresh_transfer(store, gateway, config, events, id).await }
            });
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }
}

/// One polling probe of a transfer's status against the gateway.
///
/// Destination confirmation is checked first and treated as authoritative:
/// under concurrent ledgers it can become observable before the source-side
/// confirmation is locally recorded.
pub(crate) async fn refresh_transfer(
    store: Arc<dyn OperationStore>,
    gateway: Arc<dyn LedgerGateway>,
    config: TrackerConfig,
    events: broadcast::Sender<StatusEvent>,
    id: OperationId,
) -> Result<PollOutcome, AppError> {
    let Some(transfer) = store.get_transfer(&id).await? else {
        warn!(id = %id, "Polled transfer missing from store");
        return Ok(PollOutcome::Terminal);
    };
    if transfer.is_terminal() {
        return Ok(PollOutcome::Terminal);
    }

    if let Some(receipt) = gateway.read_destination_receipt(&transfer).await? {
        let now = Utc::now().trunc_subsecs(6);
        let updated = store
            .update_transfer(
                &id,
                Box::new(move |t| t.clone().confirm_destination(receipt, now)),
            )
            .await?;
        info!(id = %id, "Transfer confirmed on destination ledger");
        let _ = events.send(StatusEvent::Transfer {
            id: id.clone(),
            status: updated.status,
        });
        return Ok(PollOutcome::Terminal);
    }

    if transfer.status == TransferStatus::Pending {
        if let Some(receipt) = &transfer.source_receipt {
            match gateway
                .read_operation_status(&transfer.source_ledger, receipt)
                .await?
            {
                ConfirmationStatus::Confirmed => {
                    let now = Utc::now().trunc_subsecs(6);
                    let updated = store
                        .update_transfer(&id, Box::new(move |t| t.clone().confirm_source(now)))
                        .await?;
                    info!(id = %id, "Transfer confirmed on source ledger");
                    let _ = events.send(StatusEvent::Transfer {
                        id: id.clone(),
                        status: updated.status,
                    });
                    return Ok(PollOutcome::Continue);
                }
                ConfirmationStatus::Rejected => {
                    warn!(id = %id, "Transfer rejected by source ledger");
                    let now = Utc::now().trunc_subsecs(6);
                    let updated = store
                        .update_transfer(
                            &id,
                            Box::new(move |t| {
                                t.clone().fail("rejected by source ledger", now)
                            }),
                        )
                        .await?;
                    let _ = events.send(StatusEvent::Transfer {
                        id: id.clone(),
                        status: updated.status,
                    });
                    return Ok(PollOutcome::Terminal);
                }
                ConfirmationStatus::Pending => {}
            }
        }
    }

    // No destination confirmation yet: enforce the per-route timeout.
    let limit = config.destination_timeout_for(&transfer.source_ledger, &transfer.destination_ledger);
    let elapsed = Utc::now() - transfer.submitted_at;
    if elapsed.to_std().unwrap_or_default() >= limit {
        let reason = GatewayError::ConfirmationTimeout {
            elapsed_secs: elapsed.num_seconds(),
            limit_secs: limit.as_secs(),
        }
        .to_string();
        warn!(id = %id, elapsed_secs = elapsed.num_seconds(), "Transfer timed out awaiting destination confirmation");
        let now = Utc::now().trunc_subsecs(6);
        let updated = store
            .update_transfer(&id, Box::new(move |t| t.clone().fail(reason, now)))
            .await?;
        let _ = events.send(StatusEvent::Transfer {
            id: id.clone(),
            status: updated.status,
        });
        return Ok(PollOutcome::Terminal);
    }

    Ok(PollOutcome::Continue)
}
