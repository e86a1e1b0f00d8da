//! Error taxonomy for the tracker core.
//!
//! Validation and invariant errors are synchronous and returned to the
//! caller without mutating stored state. Gateway errors during polling are
//! caught and logged by the scheduler; only unambiguous terminal failures
//! (explicit rejection, timeout) move a record to `failed`.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Bad input, caught before any gateway call. Never persisted.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Source and destination ledger are both {0}")]
    SameLedger(String),

    #[error("Invalid field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Fee quote is stale: issued for {source_ledger} -> {destination} amount {amount}")]
    StaleQuote {
        source_ledger: String,
        destination: String,
        amount: u64,
    },

    #[error("{0}")]
    Multiple(String),
}

/// A gateway read or write failed, or the ledger rejected the operation
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway connection failed: {0}")]
    Connection(String),

    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("No fee quote available: {0}")]
    QuoteUnavailable(String),

    #[error("Route {source_ledger} -> {destination} is not supported")]
    UnsupportedRoute { source_ledger: String, destination: String },

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("No destination confirmation after {elapsed_secs}s (limit {limit_secs}s)")]
    ConfirmationTimeout { elapsed_secs: i64, limit_secs: u64 },

    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// The operation record store failed
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// A usage error against the state machines. Never silently swallowed.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("An active request already exists for {owner} on queue {queue_id}")]
    AlreadyPending { owner: String, queue_id: String },

    #[error("Stale transition for {id}: expected status {expected}, found {found}")]
    StaleTransition {
        id: String,
        expected: String,
        found: String,
    },

    #[error("Transfer {id} is not retryable from status {status}")]
    NotRetryable { id: String, status: String },

    #[error("Request {id} is not ready: {remaining_secs}s remaining")]
    NotReady { id: String, remaining_secs: u64 },

    #[error("Request {id} is already fulfilled")]
    AlreadyFulfilled { id: String },

    #[error("A fulfillment for {id} is already in flight")]
    FulfillmentInFlight { id: String },

    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },
}

/// Malformed environment configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_errors_convert_to_app_error() {
        let err: AppError = GatewayError::Connection("refused".to_string()).into();
        assert!(matches!(err, AppError::Gateway(_)));

        let err: AppError = StoreError::NotFound("op-1".to_string()).into();
        assert!(matches!(err, AppError::Store(_)));

        let err: AppError = InvariantViolation::AlreadyFulfilled {
            id: "op-1".to_string(),
        }
        .into();
        assert!(matches!(err, AppError::Invariant(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = AppError::Gateway(GatewayError::InsufficientBalance {
            available: 10,
            required: 1_000,
        });
        assert_eq!(
            err.to_string(),
            "Gateway error: Insufficient balance: 10 available, 1000 required"
        );

        let err = GatewayError::ConfirmationTimeout {
            elapsed_secs: 901,
            limit_secs: 900,
        };
        assert!(err.to_string().contains("No destination confirmation"));

        let err = InvariantViolation::NotRetryable {
            id: "op-1".to_string(),
            status: "pending".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transfer op-1 is not retryable from status pending"
        );
    }
}
