//! Domain types with validation support.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use validator::Validate;

use super::error::{AppError, InvariantViolation};

/// Opaque identifier for one logical operation.
///
/// Derived deterministically from the operation's route and submission
/// timestamp so the same logical operation re-derives the same id after a
/// process restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Derive the id for a cross-ledger transfer
    #[must_use]
    pub fn for_transfer(
        source_ledger: &str,
        destination_ledger: &str,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self::derive(source_ledger, destination_ledger, submitted_at)
    }

    /// Derive the id for a delayed redemption request
    #[must_use]
    pub fn for_request(source_ledger: &str, queue_id: &str, requested_at: DateTime<Utc>) -> Self {
        Self::derive(source_ledger, queue_id, requested_at)
    }

    fn derive(source: &str, lane: &str, at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(lane.as_bytes());
        hasher.update([0u8]);
        hasher.update(at.timestamp_micros().to_be_bytes());
        Self(bs58::encode(hasher.finalize()).into_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque proof of an operation's inclusion on a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(String);

impl Receipt {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Receipt {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Receipt {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Confirmation state of a receipt as reported by a ledger
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Status of a cross-ledger transfer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Accepted for submission, awaiting inclusion on the source ledger
    #[default]
    Pending,
    /// Source ledger confirmed; funds are irreversibly committed there
    ConfirmedSource,
    /// Destination ledger reflects the credited amount (terminal success)
    ConfirmedDestination,
    /// Rejected by a ledger, or no destination confirmation within the timeout
    Failed,
}

impl TransferStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ConfirmedSource => "confirmed_source",
            Self::ConfirmedDestination => "confirmed_destination",
            Self::Failed => "failed",
        }
    }

    /// Terminal states stop polling; `failed` remains explicitly retryable
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfirmedDestination | Self::Failed)
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed_source" => Ok(Self::ConfirmedSource),
            "confirmed_destination" => Ok(Self::ConfirmedDestination),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a delayed redemption request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting out the server-enforced delay window
    #[default]
    Locked,
    /// Delay window elapsed; eligible for fulfillment
    Ready,
    /// Fulfillment confirmed by the gateway (terminal)
    Fulfilled,
    /// Dropped by the queue before fulfillment (terminal)
    Cancelled,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Ready => "ready",
            Self::Fulfilled => "fulfilled",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fulfilled | Self::Cancelled)
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locked" => Ok(Self::Locked),
            "ready" => Ok(Self::Ready),
            "fulfilled" => Ok(Self::Fulfilled),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cost to execute a transfer, in smallest denomination units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fee {
    /// Native-currency component
    pub native_amount: u64,
    /// Optional secondary-token component
    pub token_amount: Option<u64>,
}

/// Advisory fee quote, bound to the (source, destination, amount) triple it
/// was issued for. A quote whose triple no longer matches the submission is
/// stale and must not be reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeQuote {
    pub fee: Fee,
    pub source_ledger: String,
    pub destination_ledger: String,
    pub amount: u64,
}

impl FeeQuote {
    /// Whether this quote still covers the given submission parameters
    #[must_use]
    pub fn covers(&self, source_ledger: &str, destination_ledger: &str, amount: u64) -> bool {
        self.source_ledger == source_ledger
            && self.destination_ledger == destination_ledger
            && self.amount == amount
    }
}

/// One cross-ledger value movement, tracked end-to-end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub id: OperationId,
    pub source_ledger: String,
    pub destination_ledger: String,
    pub asset: String,
    /// Smallest denomination units
    pub amount: u64,
    pub sender: String,
    pub recipient: String,
    pub fee: Fee,
    pub status: TransferStatus,
    pub source_receipt: Option<Receipt>,
    pub destination_receipt: Option<Receipt>,
    pub last_error: Option<String>,
    /// Incremented only on the `failed -> pending` retry transition
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    #[must_use]
    pub fn new(request: &SubmitTransfer, submitted_at: DateTime<Utc>) -> Self {
        let id = OperationId::for_transfer(
            &request.source_ledger,
            &request.destination_ledger,
            submitted_at,
        );
        Self {
            id,
            source_ledger: request.source_ledger.clone(),
            destination_ledger: request.destination_ledger.clone(),
            asset: request.asset.clone(),
            amount: request.amount,
            sender: request.sender.clone(),
            recipient: request.recipient.clone(),
            fee: request.fee.fee.clone(),
            status: TransferStatus::Pending,
            source_receipt: None,
            destination_receipt: None,
            last_error: None,
            retry_count: 0,
            submitted_at,
            updated_at: submitted_at,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn illegal(&self, to: TransferStatus) -> AppError {
        InvariantViolation::IllegalTransition {
            id: self.id.to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
        .into()
    }

    /// Record the source-ledger receipt handed back on submission acceptance
    pub fn attach_source_receipt(
        mut self,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        if self.status != TransferStatus::Pending {
            return Err(self.illegal(TransferStatus::Pending));
        }
        self.source_receipt = Some(receipt);
        self.updated_at = now;
        Ok(self)
    }

    /// `pending -> confirmed_source`
    pub fn confirm_source(mut self, now: DateTime<Utc>) -> Result<Self, AppError> {
        if self.status != TransferStatus::Pending {
            return Err(self.illegal(TransferStatus::ConfirmedSource));
        }
        self.status = TransferStatus::ConfirmedSource;
        self.updated_at = now;
        Ok(self)
    }

    /// `pending | confirmed_source -> confirmed_destination`.
    ///
    /// A destination confirmation observed before the source confirmation is
    /// locally recorded is authoritative and fast-forwards through
    /// `confirmed_source`. A duplicate confirmation carrying the same receipt
    /// is an idempotent no-op.
    pub fn confirm_destination(
        mut self,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        match self.status {
            TransferStatus::Pending | TransferStatus::ConfirmedSource => {
                self.status = TransferStatus::ConfirmedDestination;
                self.destination_receipt = Some(receipt);
                self.last_error = None;
                self.updated_at = now;
                Ok(self)
            }
            TransferStatus::ConfirmedDestination
                if self.destination_receipt.as_ref() == Some(&receipt) =>
            {
                Ok(self)
            }
            _ => Err(self.illegal(TransferStatus::ConfirmedDestination)),
        }
    }

    /// Any non-terminal state `-> failed`, recording the reason
    pub fn fail(mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self, AppError> {
        if self.is_terminal() {
            return Err(self.illegal(TransferStatus::Failed));
        }
        self.status = TransferStatus::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = now;
        Ok(self)
    }

    /// `failed -> pending`, clearing the previous attempt's receipts and
    /// error. The submission timestamp restarts so the destination timeout
    /// is measured from this attempt, not the original submission; the id
    /// is stored and never re-derived, so it is unaffected.
    pub fn begin_retry(mut self, fee: Fee, now: DateTime<Utc>) -> Result<Self, AppError> {
        if self.status != TransferStatus::Failed {
            return Err(InvariantViolation::NotRetryable {
                id: self.id.to_string(),
                status: self.status.to_string(),
            }
            .into());
        }
        self.status = TransferStatus::Pending;
        self.fee = fee;
        self.source_receipt = None;
        self.destination_receipt = None;
        self.last_error = None;
        self.retry_count += 1;
        self.submitted_at = now;
        self.updated_at = now;
        Ok(self)
    }
}

/// Request to submit a new cross-ledger transfer
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitTransfer {
    #[validate(length(min = 1, message = "Source ledger is required"))]
    pub source_ledger: String,
    #[validate(length(min = 1, message = "Destination ledger is required"))]
    pub destination_ledger: String,
    #[validate(length(min = 1, message = "Asset is required"))]
    pub asset: String,
    /// Smallest denomination units
    #[validate(range(min = 1, message = "Amount must be greater than zero"))]
    pub amount: u64,
    #[validate(length(min = 1, message = "Sender is required"))]
    pub sender: String,
    #[validate(length(min = 3, max = 128, message = "Recipient must be 3-128 characters"))]
    pub recipient: String,
    /// Advisory quote previously obtained for this route and amount
    pub fee: FeeQuote,
}

/// Local readiness verdict for a delayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub is_ready: bool,
    pub remaining: Duration,
}

/// A redemption request gated by a server-enforced delay window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayedRequest {
    pub id: OperationId,
    pub owner: String,
    pub source_ledger: String,
    pub queue_id: String,
    pub requested_asset: String,
    pub source_amount: u64,
    pub target_amount: u64,
    /// Snapshot of the queue's delay window at submission time
    pub delay_window_secs: u64,
    pub status: RequestStatus,
    pub last_error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DelayedRequest {
    #[must_use]
    pub fn new(
        request: &SubmitRedemption,
        target_amount: u64,
        delay_window: Duration,
        requested_at: DateTime<Utc>,
    ) -> Self {
        let id = OperationId::for_request(&request.source_ledger, &request.queue_id, requested_at);
        Self {
            id,
            owner: request.owner.clone(),
            source_ledger: request.source_ledger.clone(),
            queue_id: request.queue_id.clone(),
            requested_asset: request.asset.clone(),
            source_amount: request.amount,
            target_amount,
            delay_window_secs: delay_window.as_secs(),
            status: RequestStatus::Locked,
            last_error: None,
            requested_at,
            updated_at: requested_at,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The instant the delay window elapses
    #[must_use]
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.requested_at + chrono::Duration::seconds(self.delay_window_secs as i64)
    }

    /// Pure readiness evaluation against an explicit clock. Side-effect free
    /// and callable at any frequency.
    #[must_use]
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Readiness {
        let ready_at = self.ready_at();
        if now >= ready_at {
            Readiness {
                is_ready: true,
                remaining: Duration::ZERO,
            }
        } else {
            Readiness {
                is_ready: false,
                remaining: (ready_at - now).to_std().unwrap_or(Duration::ZERO),
            }
        }
    }

    /// Readiness against the current clock
    #[must_use]
    pub fn evaluate(&self) -> Readiness {
        self.evaluate_at(Utc::now())
    }

    fn illegal(&self, to: RequestStatus) -> AppError {
        InvariantViolation::IllegalTransition {
            id: self.id.to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
        .into()
    }

    /// `locked -> ready`, driven purely by time passing
    pub fn mark_ready(mut self, now: DateTime<Utc>) -> Result<Self, AppError> {
        if self.status != RequestStatus::Locked {
            return Err(self.illegal(RequestStatus::Ready));
        }
        self.status = RequestStatus::Ready;
        self.updated_at = now;
        Ok(self)
    }

    /// `locked | ready -> fulfilled`, after the gateway confirmed the write
    pub fn fulfill(mut self, now: DateTime<Utc>) -> Result<Self, AppError> {
        match self.status {
            RequestStatus::Locked | RequestStatus::Ready => {
                self.status = RequestStatus::Fulfilled;
                self.updated_at = now;
                Ok(self)
            }
            RequestStatus::Fulfilled => Err(InvariantViolation::AlreadyFulfilled {
                id: self.id.to_string(),
            }
            .into()),
            RequestStatus::Cancelled => Err(self.illegal(RequestStatus::Fulfilled)),
        }
    }

    /// `locked | ready -> cancelled`, when the queue independently dropped it
    pub fn cancel(
        mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        if self.is_terminal() {
            return Err(self.illegal(RequestStatus::Cancelled));
        }
        self.status = RequestStatus::Cancelled;
        self.last_error = Some(reason.into());
        self.updated_at = now;
        Ok(self)
    }
}

/// Request to submit a new delayed redemption
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitRedemption {
    #[validate(length(min = 1, message = "Owner is required"))]
    pub owner: String,
    #[validate(length(min = 1, message = "Source ledger is required"))]
    pub source_ledger: String,
    #[validate(length(min = 1, message = "Queue is required"))]
    pub queue_id: String,
    #[validate(length(min = 1, message = "Asset is required"))]
    pub asset: String,
    /// Smallest denomination units
    #[validate(range(min = 1, message = "Amount must be greater than zero"))]
    pub amount: u64,
}

/// Either kind of tracked operation, as returned by history/active listings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRecord {
    Transfer(Transfer),
    DelayedRequest(DelayedRequest),
}

impl OperationRecord {
    #[must_use]
    pub fn id(&self) -> &OperationId {
        match self {
            Self::Transfer(t) => &t.id,
            Self::DelayedRequest(r) => &r.id,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Transfer(t) => t.is_terminal(),
            Self::DelayedRequest(r) => r.is_terminal(),
        }
    }
}

/// The gateway's view of a pending delayed request. `is_ready` is the
/// queue's own readiness verdict and overrides the local clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRequestView {
    pub requested_at: DateTime<Utc>,
    pub is_ready: bool,
}

/// Acknowledgement returned by the gateway for an accepted redemption request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestAck {
    /// Amount the queue will release on fulfillment
    pub target_amount: u64,
}

/// Status-change notification broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Transfer {
        id: OperationId,
        status: TransferStatus,
    },
    Request {
        id: OperationId,
        status: RequestStatus,
    },
}
