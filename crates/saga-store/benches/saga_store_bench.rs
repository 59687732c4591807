use common::{OrderId, SagaId};
use criterion::{Criterion, criterion_group, criterion_main};
use saga_store::{InMemorySagaStore, SagaStatus, SagaStep, SagaStore};

fn payload() -> serde_json::Value {
    serde_json::json!({
        "customer_id": "00000000-0000-0000-0000-000000000001",
        "amount_cents": 4999,
        "items": [{"item_id": "00000000-0000-0000-0000-000000000002", "quantity": 2}]
    })
}

fn bench_create(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/create", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                store
                    .create(
                        SagaId::new(),
                        OrderId::new(),
                        SagaStep::ReserveInventory,
                        payload(),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_compare_and_update_full_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/compare_and_update_full_saga", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let state = store
                    .create(
                        SagaId::new(),
                        OrderId::new(),
                        SagaStep::ReserveInventory,
                        payload(),
                    )
                    .await
                    .unwrap();

                let path = [
                    (SagaStatus::InProgress, Some(SagaStep::ProcessPayment)),
                    (SagaStatus::InProgress, Some(SagaStep::SendNotification)),
                    (SagaStatus::Completed, None),
                ];

                let mut current = state;
                for (status, step) in path {
                    let next = current.transition(status, step);
                    current = store
                        .compare_and_update(
                            current.saga_id,
                            current.status,
                            current.current_step,
                            next,
                        )
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_conflicting_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();
    let state = rt.block_on(async {
        let created = store
            .create(
                SagaId::new(),
                OrderId::new(),
                SagaStep::ReserveInventory,
                payload(),
            )
            .await
            .unwrap();
        let next = created.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment));
        store
            .compare_and_update(
                created.saga_id,
                SagaStatus::Started,
                Some(SagaStep::ReserveInventory),
                next,
            )
            .await
            .unwrap();
        created
    });

    c.bench_function("saga_store/conflicting_update", |b| {
        b.iter(|| {
            rt.block_on(async {
                let next = state.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment));
                let result = store
                    .compare_and_update(
                        state.saga_id,
                        SagaStatus::Started,
                        Some(SagaStep::ReserveInventory),
                        next,
                    )
                    .await;
                assert!(result.is_err());
            });
        });
    });
}

fn bench_find_stalled(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();
    rt.block_on(async {
        for _ in 0..1000 {
            store
                .create(
                    SagaId::new(),
                    OrderId::new(),
                    SagaStep::ReserveInventory,
                    payload(),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("saga_store/find_stalled_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let cutoff = chrono::Utc::now();
                let stalled = store.find_stalled(cutoff, 100).await.unwrap();
                assert_eq!(stalled.len(), 100);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create,
    bench_compare_and_update_full_saga,
    bench_conflicting_update,
    bench_find_stalled
);
criterion_main!(benches);
