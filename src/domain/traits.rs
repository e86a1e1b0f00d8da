//! Domain traits defining contracts for external systems.

use std::time::Duration;

use async_trait::async_trait;

use super::error::{AppError, GatewayError};
use super::types::{
    ConfirmationStatus, DelayedRequest, FeeQuote, OperationId, OperationRecord, PendingRequestView,
    Receipt, RequestAck, Transfer,
};

/// Pure state transition applied to a Transfer under the store's per-id lock
pub type TransferMutation = Box<dyn FnOnce(&Transfer) -> Result<Transfer, AppError> + Send>;

/// Pure state transition applied to a DelayedRequest under the store's per-id lock
pub type RequestMutation = Box<dyn FnOnce(&DelayedRequest) -> Result<DelayedRequest, AppError> + Send>;

/// Durable operation record store.
///
/// The store is the single source of truth: engines compute intended
/// transitions and submit them through `update_*`, which serializes writers
/// per id and rejects a mutation whose status precondition no longer holds
/// (`InvariantViolation::StaleTransition`). Records are never deleted, so the
/// store doubles as the audit history.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new transfer record
    async fn put_transfer(&self, transfer: &Transfer) -> Result<(), AppError>;

    /// Insert a new delayed request record
    async fn put_request(&self, request: &DelayedRequest) -> Result<(), AppError>;

    /// Fetch a transfer by id
    async fn get_transfer(&self, id: &OperationId) -> Result<Option<Transfer>, AppError>;

    /// Fetch a delayed request by id
    async fn get_request(&self, id: &OperationId) -> Result<Option<DelayedRequest>, AppError>;

    /// Apply a pure transition to a transfer, atomically per id
    async fn update_transfer(
        &self,
        id: &OperationId,
        mutation: TransferMutation,
    ) -> Result<Transfer, AppError>;

    /// Apply a pure transition to a delayed request, atomically per id
    async fn update_request(
        &self,
        id: &OperationId,
        mutation: RequestMutation,
    ) -> Result<DelayedRequest, AppError>;

    /// All records whose status is non-terminal; seeds polling on restart
    async fn list_active(&self) -> Result<Vec<OperationRecord>, AppError>;

    /// The active (locked or ready) request for `(owner, queue_id)`, if any
    async fn active_request_for(
        &self,
        owner: &str,
        queue_id: &str,
    ) -> Result<Option<DelayedRequest>, AppError>;

    /// Transfer history, newest first
    async fn list_transfers(&self, limit: i64) -> Result<Vec<Transfer>, AppError>;

    /// Delayed request history, newest first
    async fn list_requests(&self, limit: i64) -> Result<Vec<DelayedRequest>, AppError>;
}

/// Ledger gateway capability surface consumed by the tracker core.
///
/// Reads and writes against the underlying ledgers; implementation-agnostic.
/// All calls are long-latency and must not be assumed cheap.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Check gateway connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Balance of `account` for `asset` on `ledger`, smallest units
    async fn read_balance(
        &self,
        ledger: &str,
        account: &str,
        asset: &str,
    ) -> Result<u64, AppError>;

    /// Spending allowance, for assets requiring pre-authorization
    async fn read_allowance(
        &self,
        ledger: &str,
        owner: &str,
        spender: &str,
        asset: &str,
    ) -> Result<u64, AppError> {
        let _ = (ledger, owner, spender, asset);
        Err(AppError::Gateway(GatewayError::NotSupported(
            "read_allowance not implemented".to_string(),
        )))
    }

    /// Quote the fee for moving `amount` from `source_ledger` to
    /// `destination_ledger`
    async fn quote_transfer_fee(
        &self,
        source_ledger: &str,
        destination_ledger: &str,
        amount: u64,
        recipient: &str,
    ) -> Result<FeeQuote, AppError>;

    /// Issue the signed source-ledger submission for a transfer
    async fn submit_transfer(&self, transfer: &Transfer) -> Result<Receipt, AppError>;

    /// Confirmation state of a previously obtained receipt
    async fn read_operation_status(
        &self,
        ledger: &str,
        receipt: &Receipt,
    ) -> Result<ConfirmationStatus, AppError>;

    /// The destination ledger's credit for this transfer, once observable
    async fn read_destination_receipt(
        &self,
        transfer: &Transfer,
    ) -> Result<Option<Receipt>, AppError>;

    /// The server-declared delay window for a redemption queue
    async fn read_delay_window(&self, queue_id: &str) -> Result<Duration, AppError>;

    /// The queue's view of the outstanding request for `(owner, queue_id)`
    async fn read_pending_request(
        &self,
        owner: &str,
        queue_id: &str,
    ) -> Result<Option<PendingRequestView>, AppError>;

    /// Enqueue a new delayed redemption; the queue is the source of truth
    /// and may reject
    async fn submit_request(
        &self,
        owner: &str,
        queue_id: &str,
        asset: &str,
        amount: u64,
    ) -> Result<RequestAck, AppError>;

    /// Fire the fulfillment write for a ready request. Not idempotent on the
    /// gateway side; callers must not issue it twice concurrently.
    async fn submit_fulfillment(&self, id: &OperationId) -> Result<Receipt, AppError>;
}
