//! Seat ledger benchmarks
//!
//! Measures the compare-and-set path with and without contention:
//! - Uncontended reserve/release round trip
//! - N tasks reserving one seat each from the same event
//! - Full booking create/cancel cycle
//!
//! Run with: `cargo bench --bench ledger_contention`

#![allow(missing_docs)]
#![allow(clippy::expect_used)]

use boxoffice::memory::InMemoryInventoryStore;
use boxoffice::{BoxOffice, Config, SeatLedger, Stores, TracingNotifier};
use boxoffice_core::environment::SystemClock;
use boxoffice_core::types::{EventId, IdempotencyKey, UserId};
use boxoffice_runtime::{InMemoryEventBus, RetryPolicy};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn patient_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(10_000)
        .initial_delay(Duration::from_micros(50))
        .max_delay(Duration::from_millis(1))
        .build()
}

fn new_event(runtime: &tokio::runtime::Runtime, ledger: &SeatLedger, capacity: u32) -> EventId {
    let event_id = EventId::new();
    runtime
        .block_on(ledger.register(
            event_id,
            capacity,
            chrono::Utc::now() + chrono::Duration::days(1),
        ))
        .expect("Failed to register event");
    event_id
}

fn benchmark_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let ledger = SeatLedger::new(Arc::new(InMemoryInventoryStore::new()), patient_policy());
    let event_id = new_event(&runtime, &ledger, 1_000);

    group.bench_function("reserve_release", |b| {
        b.to_async(&runtime).iter(|| async {
            ledger
                .reserve(event_id, black_box(1))
                .await
                .expect("reserve failed");
            ledger
                .release(event_id, black_box(1))
                .await
                .expect("release failed");
        });
    });

    group.finish();
}

fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for tasks in [4u32, 16, 64] {
        group.throughput(Throughput::Elements(u64::from(tasks)));
        group.bench_with_input(BenchmarkId::new("reserve_with_retry", tasks), &tasks, |b, &tasks| {
            let ledger = SeatLedger::new(Arc::new(InMemoryInventoryStore::new()), patient_policy());
            let event_id = new_event(&runtime, &ledger, tasks);

            b.to_async(&runtime).iter(|| {
                let ledger = ledger.clone();
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let ledger = ledger.clone();
                            tokio::spawn(async move { ledger.reserve_with_retry(event_id, 1).await })
                        })
                        .collect();
                    for handle in handles {
                        handle
                            .await
                            .expect("task panicked")
                            .expect("reserve failed");
                    }
                    ledger
                        .release_with_retry(event_id, tasks)
                        .await
                        .expect("release failed");
                }
            });
        });
    }

    group.finish();
}

fn benchmark_booking_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("booking");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let app = BoxOffice::new(
        Config::default(),
        Stores::in_memory(),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(SystemClock),
        Arc::new(TracingNotifier),
    );
    let event_id = new_event(&runtime, app.ledger(), 1);
    let sequence = AtomicU64::new(0);

    group.bench_function("create_cancel", |b| {
        b.to_async(&runtime).iter(|| async {
            let n = sequence.fetch_add(1, Ordering::Relaxed);
            let booking = app
                .bookings()
                .create_booking(UserId::new(), event_id, 1, IdempotencyKey::new(format!("bench-{n}")))
                .await
                .expect("booking failed")
                .booking;
            app.bookings()
                .cancel_booking(booking.booking_id)
                .await
                .expect("cancel failed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_uncontended,
    benchmark_contention,
    benchmark_booking_cycle,
);
criterion_main!(benches);
