use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use loyalty_outbox::{
    Dispatcher, EventHandler, HandlerError, HandlerRegistry, InMemoryOutboxStore, NewOutboxEvent,
    Outbox, OutboxStore,
};
use serde_json::{Value as JsonValue, json};

struct Noop;

#[async_trait::async_trait]
impl EventHandler for Noop {
    async fn handle(&self, _payload: &JsonValue) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn event(i: usize) -> NewOutboxEvent {
    Outbox::<()>::prepare(
        "notification",
        None,
        "EMAIL_SEND",
        &json!({"to": format!("member{i}@example.com"), "template": "WELCOME_V1"}),
    )
    .unwrap()
}

async fn seeded_store(backlog: usize) -> Arc<InMemoryOutboxStore> {
    let store = InMemoryOutboxStore::arc();
    for i in 0..backlog {
        store.insert(event(i)).await.unwrap();
    }
    store
}

/// Claim one batch out of backlogs of growing size.
fn bench_claim_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_batch");

    for backlog in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(25));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || rt.block_on(seeded_store(backlog)),
                |store| {
                    let claimed = rt.block_on(store.claim_batch(25)).unwrap();
                    black_box(claimed);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Full tick: claim, no-op handler, ack.
fn bench_dispatch_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatch_tick");

    for batch in [1usize, 25, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let store = rt.block_on(seeded_store(batch));
                    let mut registry = HandlerRegistry::new();
                    registry.register("EMAIL_SEND", Noop);
                    Dispatcher::new(store, registry).with_config(
                        loyalty_outbox::DispatcherConfig::default().with_batch_size(batch),
                    )
                },
                |dispatcher| {
                    let report = rt.block_on(dispatcher.tick()).unwrap();
                    black_box(report);
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_batch, bench_dispatch_tick);
criterion_main!(benches);
