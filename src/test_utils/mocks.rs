//! Mock implementations for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{
    AppError, ConfirmationStatus, DelayedRequest, Fee, FeeQuote, GatewayError, LedgerGateway,
    OperationId, OperationRecord, OperationStore, PendingRequestView, Receipt, RequestAck,
    RequestMutation, StoreError, Transfer, TransferMutation,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// In-memory operation store for testing
pub struct MemoryStore {
    transfers: Mutex<HashMap<String, Transfer>>,
    requests: Mutex<HashMap<String, DelayedRequest>>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Number of stored transfer records (for testing)
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    /// Number of stored delayed request records (for testing)
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Store(StoreError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Store(StoreError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn put_transfer(&self, transfer: &Transfer) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.transfers
            .lock()
            .unwrap()
            .insert(transfer.id.to_string(), transfer.clone());
        Ok(())
    }

    async fn put_request(&self, request: &DelayedRequest) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.requests
            .lock()
            .unwrap()
            .insert(request.id.to_string(), request.clone());
        Ok(())
    }

    async fn get_transfer(&self, id: &OperationId) -> Result<Option<Transfer>, AppError> {
        self.check_should_fail()?;
        Ok(self.transfers.lock().unwrap().get(id.as_str()).cloned())
    }

    async fn get_request(&self, id: &OperationId) -> Result<Option<DelayedRequest>, AppError> {
        self.check_should_fail()?;
        Ok(self.requests.lock().unwrap().get(id.as_str()).cloned())
    }

    async fn update_transfer(
        &self,
        id: &OperationId,
        mutation: TransferMutation,
    ) -> Result<Transfer, AppError> {
        self.check_should_fail()?;
        let mut transfers = self.transfers.lock().unwrap();
        let current = transfers
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        let next = mutation(&current)?;
        transfers.insert(id.to_string(), next.clone());
        Ok(next)
    }

    async fn update_request(
        &self,
        id: &OperationId,
        mutation: RequestMutation,
    ) -> Result<DelayedRequest, AppError> {
        self.check_should_fail()?;
        let mut requests = self.requests.lock().unwrap();
        let current = requests
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        let next = mutation(&current)?;
        requests.insert(id.to_string(), next.clone());
        Ok(next)
    }

    async fn list_active(&self) -> Result<Vec<OperationRecord>, AppError> {
        self.check_should_fail()?;
        let mut records: Vec<OperationRecord> = self
            .transfers
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .map(OperationRecord::Transfer)
            .collect();
        records.extend(
            self.requests
                .lock()
                .unwrap()
                .values()
                .filter(|r| !r.is_terminal())
                .cloned()
                .map(OperationRecord::DelayedRequest),
        );
        Ok(records)
    }

    async fn active_request_for(
        &self,
        owner: &str,
        queue_id: &str,
    ) -> Result<Option<DelayedRequest>, AppError> {
        self.check_should_fail()?;
        Ok(self
            .requests
            .lock()
            .unwrap()
            .values()
            .find(|r| r.owner == owner && r.queue_id == queue_id && !r.is_terminal())
            .cloned())
    }

    async fn list_transfers(&self, limit: i64) -> Result<Vec<Transfer>, AppError> {
        self.check_should_fail()?;
        let mut items: Vec<Transfer> = self.transfers.lock().unwrap().values().cloned().collect();
        items.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn list_requests(&self, limit: i64) -> Result<Vec<DelayedRequest>, AppError> {
        self.check_should_fail()?;
        let mut items: Vec<DelayedRequest> =
            self.requests.lock().unwrap().values().cloned().collect();
        items.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }
}

/// Mock ledger gateway with scripted confirmation behavior.
///
/// Accounts default to an unlimited balance; use `set_balance` to constrain.
/// Source receipts confirm after `confirm_source_after` status reads and the
/// destination credit becomes observable after `confirm_destination_after`
/// destination reads, counted per gateway instance.
pub struct MockGateway {
    config: MockConfig,
    is_healthy: AtomicBool,

    balances: Mutex<HashMap<(String, String, String), u64>>,
    fee: Mutex<Fee>,
    unsupported_routes: Mutex<HashSet<(String, String)>>,

    reject_next_submit: AtomicBool,
    source_rejected: AtomicBool,
    confirm_source_after: AtomicU32,
    confirm_destination_after: AtomicU32,
    source_status_reads: AtomicU32,
    destination_reads: AtomicU32,
    quote_calls: AtomicU32,
    balance_calls: AtomicU32,
    submitted: Mutex<Vec<OperationId>>,

    delay_window: Mutex<Duration>,
    delay_window_reads: AtomicU32,
    pending_views: Mutex<HashMap<(String, String), PendingRequestView>>,
    target_amount: Mutex<Option<u64>>,
    reject_next_request: AtomicBool,
    reject_next_fulfillment: AtomicBool,
    fulfillments: Mutex<Vec<OperationId>>,
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            is_healthy: AtomicBool::new(true),
            balances: Mutex::new(HashMap::new()),
            fee: Mutex::new(Fee {
                native_amount: 5_000,
                token_amount: None,
            }),
            unsupported_routes: Mutex::new(HashSet::new()),
            reject_next_submit: AtomicBool::new(false),
            source_rejected: AtomicBool::new(false),
            confirm_source_after: AtomicU32::new(1),
            confirm_destination_after: AtomicU32::new(2),
            source_status_reads: AtomicU32::new(0),
            destination_reads: AtomicU32::new(0),
            quote_calls: AtomicU32::new(0),
            balance_calls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
            delay_window: Mutex::new(Duration::from_secs(600)),
            delay_window_reads: AtomicU32::new(0),
            pending_views: Mutex::new(HashMap::new()),
            target_amount: Mutex::new(None),
            reject_next_request: AtomicBool::new(false),
            reject_next_fulfillment: AtomicBool::new(false),
            fulfillments: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_balance(&self, ledger: &str, account: &str, asset: &str, amount: u64) {
        self.balances.lock().unwrap().insert(
            (ledger.to_string(), account.to_string(), asset.to_string()),
            amount,
        );
    }

    pub fn set_fee(&self, fee: Fee) {
        *self.fee.lock().unwrap() = fee;
    }

    pub fn set_route_unsupported(&self, source_ledger: &str, destination_ledger: &str) {
        self.unsupported_routes.lock().unwrap().insert((
            source_ledger.to_string(),
            destination_ledger.to_string(),
        ));
    }

    /// Reject the next `submit_transfer` call
    pub fn reject_next_submission(&self) {
        self.reject_next_submit.store(true, Ordering::Relaxed);
    }

    /// Make source-status reads report `rejected`
    pub fn reject_source_inclusion(&self) {
        self.source_rejected.store(true, Ordering::Relaxed);
    }

    /// Number of status reads before the source receipt confirms
    pub fn confirm_source_after(&self, reads: u32) {
        self.confirm_source_after.store(reads, Ordering::Relaxed);
    }

    /// Number of destination reads before the credit becomes observable
    pub fn confirm_destination_after(&self, reads: u32) {
        self.confirm_destination_after.store(reads, Ordering::Relaxed);
    }

    /// Never surface a destination credit
    pub fn never_confirm_destination(&self) {
        self.confirm_destination_after
            .store(u32::MAX, Ordering::Relaxed);
    }

    pub fn set_delay_window(&self, window: Duration) {
        *self.delay_window.lock().unwrap() = window;
    }

    /// Set the queue's readiness verdict for `(owner, queue_id)`, creating
    /// the server-side view if none exists yet
    pub fn set_server_ready(&self, owner: &str, queue_id: &str, ready: bool) {
        let mut views = self.pending_views.lock().unwrap();
        let view = views
            .entry((owner.to_string(), queue_id.to_string()))
            .or_insert_with(|| PendingRequestView {
                requested_at: Utc::now(),
                is_ready: false,
            });
        view.is_ready = ready;
    }

    /// Drop the queue's view of `(owner, queue_id)`, simulating an external
    /// settlement or cancellation
    pub fn drop_pending_request(&self, owner: &str, queue_id: &str) {
        self.pending_views
            .lock()
            .unwrap()
            .remove(&(owner.to_string(), queue_id.to_string()));
    }

    pub fn set_target_amount(&self, amount: u64) {
        *self.target_amount.lock().unwrap() = Some(amount);
    }

    /// Reject the next `submit_request` call
    pub fn reject_next_request(&self) {
        self.reject_next_request.store(true, Ordering::Relaxed);
    }

    /// Reject the next `submit_fulfillment` call
    pub fn reject_next_fulfillment(&self) {
        self.reject_next_fulfillment.store(true, Ordering::Relaxed);
    }

    pub fn submitted_transfers(&self) -> Vec<OperationId> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn fulfillments(&self) -> Vec<OperationId> {
        self.fulfillments.lock().unwrap().clone()
    }

    pub fn quote_calls(&self) -> u32 {
        self.quote_calls.load(Ordering::Relaxed)
    }

    pub fn balance_calls(&self) -> u32 {
        self.balance_calls.load(Ordering::Relaxed)
    }

    pub fn source_status_reads(&self) -> u32 {
        self.source_status_reads.load(Ordering::Relaxed)
    }

    pub fn destination_reads(&self) -> u32 {
        self.destination_reads.load(Ordering::Relaxed)
    }

    pub fn delay_window_reads(&self) -> u32 {
        self.delay_window_reads.load(Ordering::Relaxed)
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Gateway(GatewayError::Connection(msg)));
        }
        Ok(())
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerGateway for MockGateway {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Gateway(GatewayError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn read_balance(
        &self,
        ledger: &str,
        account: &str,
        asset: &str,
    ) -> Result<u64, AppError> {
        self.balance_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        let balances = self.balances.lock().unwrap();
        Ok(balances
            .get(&(ledger.to_string(), account.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(u64::MAX))
    }

    async fn quote_transfer_fee(
        &self,
        source_ledger: &str,
        destination_ledger: &str,
        amount: u64,
        _recipient: &str,
    ) -> Result<FeeQuote, AppError> {
        self.quote_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        let unsupported = self.unsupported_routes.lock().unwrap();
        if unsupported.contains(&(source_ledger.to_string(), destination_ledger.to_string())) {
            return Err(AppError::Gateway(GatewayError::QuoteUnavailable(format!(
                "{} -> {} is disabled",
                source_ledger, destination_ledger
            ))));
        }
        Ok(FeeQuote {
            fee: self.fee.lock().unwrap().clone(),
            source_ledger: source_ledger.to_string(),
            destination_ledger: destination_ledger.to_string(),
            amount,
        })
    }

    async fn submit_transfer(&self, transfer: &Transfer) -> Result<Receipt, AppError> {
        self.check_should_fail()?;
        if self.reject_next_submit.swap(false, Ordering::Relaxed) {
            return Err(AppError::Gateway(GatewayError::Rejected(
                "submission rejected".to_string(),
            )));
        }
        self.submitted.lock().unwrap().push(transfer.id.clone());
        Ok(Receipt::from(format!("src-{}", transfer.id)))
    }

    async fn read_operation_status(
        &self,
        _ledger: &str,
        _receipt: &Receipt,
    ) -> Result<ConfirmationStatus, AppError> {
        let reads = self.source_status_reads.fetch_add(1, Ordering::Relaxed) + 1;
        self.check_should_fail()?;
        if self.source_rejected.load(Ordering::Relaxed) {
            return Ok(ConfirmationStatus::Rejected);
        }
        if reads >= self.confirm_source_after.load(Ordering::Relaxed) {
            Ok(ConfirmationStatus::Confirmed)
        } else {
            Ok(ConfirmationStatus::Pending)
        }
    }

    async fn read_destination_receipt(
        &self,
        transfer: &Transfer,
    ) -> Result<Option<Receipt>, AppError> {
        let reads = self.destination_reads.fetch_add(1, Ordering::Relaxed) + 1;
        self.check_should_fail()?;
        let threshold = self.confirm_destination_after.load(Ordering::Relaxed);
        if threshold != u32::MAX && reads >= threshold {
            Ok(Some(Receipt::from(format!("dst-{}", transfer.id))))
        } else {
            Ok(None)
        }
    }

    async fn read_delay_window(&self, _queue_id: &str) -> Result<Duration, AppError> {
        self.delay_window_reads.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        Ok(*self.delay_window.lock().unwrap())
    }

    async fn read_pending_request(
        &self,
        owner: &str,
        queue_id: &str,
    ) -> Result<Option<PendingRequestView>, AppError> {
        self.check_should_fail()?;
        Ok(self
            .pending_views
            .lock()
            .unwrap()
            .get(&(owner.to_string(), queue_id.to_string()))
            .cloned())
    }

    async fn submit_request(
        &self,
        owner: &str,
        queue_id: &str,
        _asset: &str,
        amount: u64,
    ) -> Result<RequestAck, AppError> {
        self.check_should_fail()?;
        if self.reject_next_request.swap(false, Ordering::Relaxed) {
            return Err(AppError::Gateway(GatewayError::Rejected(
                "request rejected by queue".to_string(),
            )));
        }
        self.pending_views.lock().unwrap().insert(
            (owner.to_string(), queue_id.to_string()),
            PendingRequestView {
                requested_at: Utc::now(),
                is_ready: false,
            },
        );
        let target_amount = self.target_amount.lock().unwrap().unwrap_or(amount);
        Ok(RequestAck { target_amount })
    }

    async fn submit_fulfillment(&self, id: &OperationId) -> Result<Receipt, AppError> {
        self.check_should_fail()?;
        if self.reject_next_fulfillment.swap(false, Ordering::Relaxed) {
            return Err(AppError::Gateway(GatewayError::Rejected(
                "fulfillment rejected".to_string(),
            )));
        }
        self.fulfillments.lock().unwrap().push(id.clone());
        Ok(Receipt::from(format!("fulfill-{}", id)))
    }
}
