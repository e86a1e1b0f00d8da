use bridge_tracker::domain::{Fee, FeeQuote, OperationId, SubmitRedemption, SubmitTransfer};
use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use validator::Validate;

fn bench_validation(c: &mut Criterion) {
    let request = SubmitTransfer {
        source_ledger: "ledger-a".to_string(),
        destination_ledger: "ledger-b".to_string(),
        asset: "WTOK".to_string(),
        amount: 100_000_000,
        sender: "acct-sender".to_string(),
        recipient: "acct-recipient".to_string(),
        fee: FeeQuote {
            fee: Fee {
                native_amount: 5_000,
                token_amount: None,
            },
            source_ledger: "ledger-a".to_string(),
            destination_ledger: "ledger-b".to_string(),
            amount: 100_000_000,
        },
    };

    c.bench_function("validate_submit_transfer", |b| {
        b.iter(|| {
            let _ = black_box(&request).validate();
        })
    });
}

fn bench_id_derivation(c: &mut Criterion) {
    let at = Utc::now();
    c.bench_function("derive_operation_id", |b| {
        b.iter(|| OperationId::for_transfer(black_box("ledger-a"), black_box("ledger-b"), at))
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let request = SubmitRedemption {
        owner: "acct-owner".to_string(),
        source_ledger: "ledger-a".to_string(),
        queue_id: "unstake-queue".to_string(),
        asset: "STOK".to_string(),
        amount: 42_000_000,
    };
    let record = bridge_tracker::domain::DelayedRequest::new(
        &request,
        40_000_000,
        Duration::from_secs(36_000),
        Utc::now(),
    );
    let now = Utc::now();

    c.bench_function("evaluate_readiness", |b| {
        b.iter(|| black_box(&record).evaluate_at(now))
    });
}

criterion_group!(benches, bench_validation, bench_id_derivation, bench_evaluate);
criterion_main!(benches);
