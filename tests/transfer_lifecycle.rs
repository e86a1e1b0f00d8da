//! Integration tests for the transfer lifecycle engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use bridge_tracker::app::{PollOutcome, PollSchedule, TrackerConfig, TrackerState};
use bridge_tracker::domain::{
    AppError, GatewayError, InvariantViolation, OperationStore, StatusEvent, SubmitTransfer,
    Transfer, TransferStatus, ValidationError,
};
use bridge_tracker::test_utils::{MemoryStore, MockGateway};

/// Poll intervals long enough that background pollers never fire while a
/// test drives `refresh` by hand
fn manual_poll_config() -> TrackerConfig {
    let hour = PollSchedule {
        fast_interval: Duration::from_secs(3_600),
        fast_window: Duration::from_secs(3_600),
        steady_interval: Duration::from_secs(3_600),
    };
    TrackerConfig {
        transfer_poll: hour,
        redemption_poll: hour,
        ..TrackerConfig::default()
    }
}

fn test_state(
    gateway: &Arc<MockGateway>,
    store: &Arc<MemoryStore>,
    config: TrackerConfig,
) -> TrackerState {
    TrackerState::new(Arc::clone(store) as _, Arc::clone(gateway) as _, config)
}

fn submit_payload(amount: u64) -> SubmitTransfer {
    SubmitTransfer {
        source_ledger: "ledger-a".to_string(),
        destination_ledger: "ledger-b".to_string(),
        asset: "WTOK".to_string(),
        amount,
        sender: "acct-sender".to_string(),
        recipient: "acct-recipient".to_string(),
        fee: bridge_tracker::domain::FeeQuote {
            fee: bridge_tracker::domain::Fee {
                native_amount: 5_000,
                token_amount: None,
            },
            source_ledger: "ledger-a".to_string(),
            destination_ledger: "ledger-b".to_string(),
            amount,
        },
    }
}

#[tokio::test]
async fn test_transfer_confirms_source_then_destination() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(1);
    gateway.confirm_destination_after(3);
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    // 1 unit of an 8-decimal asset
    let transfer = state
        .transfers
        .submit(&submit_payload(100_000_000))
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Pending);
    assert!(transfer.source_receipt.is_some());
    assert_eq!(gateway.submitted_transfers(), vec![transfer.id.clone()]);

    // poll 1: source confirms
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Continue
    );
    let current = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransferStatus::ConfirmedSource);

    // poll 2: destination not yet observable
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Continue
    );

    // poll 3: destination confirms
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );

    let finished = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(finished.status, TransferStatus::ConfirmedDestination);
    assert!(finished.source_receipt.is_some());
    assert!(finished.destination_receipt.is_some());
    assert_eq!(finished.retry_count, 0);

    // exactly one record for this id
    assert_eq!(store.transfer_count(), 1);
}

#[tokio::test]
async fn test_same_ledger_rejected_without_gateway_call() {
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let mut payload = submit_payload(1_000);
    payload.destination_ledger = "ledger-a".to_string();
    payload.fee.destination_ledger = "ledger-a".to_string();

    let err = state.transfers.submit(&payload).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::SameLedger(_))
    ));

    // no record created, no gateway call made
    assert_eq!(store.transfer_count(), 0);
    assert_eq!(gateway.quote_calls(), 0);
    assert_eq!(gateway.balance_calls(), 0);
    assert!(gateway.submitted_transfers().is_empty());
}

#[tokio::test]
async fn test_zero_amount_rejected() {
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let err = state
        .transfers
        .submit(&submit_payload(0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(store.transfer_count(), 0);
}

#[tokio::test]
async fn test_stale_quote_rejected() {
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    // quote was issued for a different amount
    let mut payload = submit_payload(1_000);
    payload.fee.amount = 500;

    let err = state.transfers.submit(&payload).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::StaleQuote { .. })
    ));
    assert_eq!(store.transfer_count(), 0);
    assert!(gateway.submitted_transfers().is_empty());
}

#[tokio::test]
async fn test_unsupported_route_rejected_before_persisting() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_route_unsupported("ledger-a", "ledger-b");
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let err = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Gateway(GatewayError::UnsupportedRoute { .. })
    ));
    assert_eq!(store.transfer_count(), 0);
}

#[tokio::test]
async fn test_insufficient_balance_rejected_before_persisting() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_balance("ledger-a", "acct-sender", "WTOK", 10);
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let err = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Gateway(GatewayError::InsufficientBalance {
            available: 10,
            required: 1_000
        })
    ));
    assert_eq!(store.transfer_count(), 0);
    assert!(gateway.submitted_transfers().is_empty());
}

#[tokio::test]
async fn test_gateway_rejection_marks_transfer_failed() {
    let gateway = Arc::new(MockGateway::new());
    gateway.reject_next_submission();
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let err = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Gateway(GatewayError::Rejected(_))));

    // the record is kept, marked failed, with the reason recorded
    assert_eq!(store.transfer_count(), 1);
    let failed = store.list_transfers(10).await.unwrap().remove(0);
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.last_error.is_some());
}

#[tokio::test]
async fn test_retry_on_non_failed_transfer_is_rejected() {
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();

    let err = state.transfers.retry(&transfer.id).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Invariant(InvariantViolation::NotRetryable { .. })
    ));

    let unchanged = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(unchanged.retry_count, 0);
    assert_eq!(unchanged.status, TransferStatus::Pending);
}

#[tokio::test]
async fn test_retry_after_failure_resubmits_and_confirms() {
    let gateway = Arc::new(MockGateway::new());
    gateway.reject_next_submission();
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let err = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Gateway(_)));
    let failed = store.list_transfers(10).await.unwrap().remove(0);

    let retried = state.transfers.retry(&failed.id).await.unwrap();
    assert_eq!(retried.status, TransferStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.source_receipt.is_some());
    assert!(retried.last_error.is_none());

    // confirm both sides through polling
    assert_eq!(
        state.transfers.refresh(&failed.id).await.unwrap(),
        PollOutcome::Continue
    );
    assert_eq!(
        state.transfers.refresh(&failed.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let finished = state.transfers.get(&failed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, TransferStatus::ConfirmedDestination);
    assert_eq!(finished.retry_count, 1);
}

#[tokio::test]
async fn test_source_rejection_fails_transfer() {
    let gateway = Arc::new(MockGateway::new());
    gateway.reject_source_inclusion();
    gateway.never_confirm_destination();
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();

    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let failed = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.last_error.unwrap().contains("rejected"));
}

#[tokio::test]
async fn test_destination_timeout_fails_transfer() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(100);
    gateway.never_confirm_destination();
    let store = Arc::new(MemoryStore::new());
    let config =
        manual_poll_config().with_route_timeout("ledger-a", "ledger-b", Duration::ZERO);
    let state = test_state(&gateway, &store, config);

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();

    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let failed = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(
        failed
            .last_error
            .unwrap()
            .contains("No destination confirmation")
    );

    // a timed-out transfer is explicitly retryable
    let retried = state.transfers.retry(&transfer.id).await.unwrap();
    assert_eq!(retried.status, TransferStatus::Pending);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn test_retry_after_timeout_restarts_confirmation_clock() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(100);
    gateway.never_confirm_destination();
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    // a pending transfer whose submission already exceeds the 900s default
    let submitted_at = Utc::now() - chrono::Duration::seconds(3_600);
    let transfer = Transfer::new(&submit_payload(1_000), submitted_at);
    store.put_transfer(&transfer).await.unwrap();

    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let failed = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);

    let retried = state.transfers.retry(&transfer.id).await.unwrap();
    assert!(retried.submitted_at > submitted_at);

    // the timeout is measured from the retry, not the original submission,
    // so the next poll keeps waiting instead of re-failing immediately
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Continue
    );
    let current = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransferStatus::Pending);
}

#[tokio::test]
async fn test_destination_confirmation_fast_forwards_source() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(100);
    gateway.confirm_destination_after(1);
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();

    // destination observed while the source confirmation is still pending
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let finished = state.transfers.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(finished.status, TransferStatus::ConfirmedDestination);
    assert!(finished.destination_receipt.is_some());
    // the source status was never consulted
    assert_eq!(gateway.source_status_reads(), 0);
}

#[tokio::test]
async fn test_refresh_on_terminal_transfer_is_a_noop() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(1);
    gateway.confirm_destination_after(1);
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    let reads = gateway.destination_reads();

    // further polls return terminal without touching the gateway
    assert_eq!(
        state.transfers.refresh(&transfer.id).await.unwrap(),
        PollOutcome::Terminal
    );
    assert_eq!(gateway.destination_reads(), reads);
}

#[tokio::test]
async fn test_quote_is_advisory_and_validates_inputs() {
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());

    let quote = state
        .transfers
        .quote("ledger-a", "ledger-b", 1_000, "acct-recipient")
        .await
        .unwrap();
    assert!(quote.covers("ledger-a", "ledger-b", 1_000));

    let err = state
        .transfers
        .quote("ledger-a", "ledger-b", 0, "acct-recipient")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Gateway(GatewayError::QuoteUnavailable(_))
    ));

    let err = state
        .transfers
        .quote("ledger-a", "ledger-a", 1_000, "acct-recipient")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Gateway(GatewayError::QuoteUnavailable(_))
    ));

    // quoting is side-effect free
    assert_eq!(store.transfer_count(), 0);
    assert!(gateway.submitted_transfers().is_empty());
}

#[tokio::test]
async fn test_status_events_are_broadcast() {
    let gateway = Arc::new(MockGateway::new());
    gateway.confirm_source_after(1);
    gateway.confirm_destination_after(2);
    let store = Arc::new(MemoryStore::new());
    let state = test_state(&gateway, &store, manual_poll_config());
    let mut events = state.subscribe();

    let transfer = state
        .transfers
        .submit(&submit_payload(1_000))
        .await
        .unwrap();
    state.transfers.refresh(&transfer.id).await.unwrap();
    state.transfers.refresh(&transfer.id).await.unwrap();

    let expected = [
        TransferStatus::Pending,
        TransferStatus::ConfirmedSource,
        TransferStatus::ConfirmedDestination,
    ];
    for status in expected {
        match events.recv().await.unwrap() {
            StatusEvent::Transfer { id, status: got } => {
                assert_eq!(id, transfer.id);
                assert_eq!(got, status);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
