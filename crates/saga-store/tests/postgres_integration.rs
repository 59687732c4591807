//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and are serialised.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use saga_store::{
    OrderId, PostgresSagaStore, SagaId, SagaState, SagaStatus, SagaStep, SagaStore,
    SagaStoreError,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_states_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and an empty table
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_states")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

async fn create_started(store: &PostgresSagaStore) -> SagaState {
    store
        .create(
            SagaId::new(),
            OrderId::new(),
            SagaStep::ReserveInventory,
            serde_json::json!({"customer_id": "c-1", "amount_cents": 4999}),
        )
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn create_and_load_round_trip() {
    let store = get_test_store().await;
    let created = create_started(&store).await;

    let loaded = store.load(created.saga_id).await.unwrap();
    assert_eq!(loaded, created);
    assert_eq!(loaded.status, SagaStatus::Started);
    assert_eq!(loaded.current_step, Some(SagaStep::ReserveInventory));
    assert_eq!(loaded.payload["amount_cents"], 4999);
}

#[tokio::test]
#[serial]
async fn create_existing_saga_fails() {
    let store = get_test_store().await;
    let created = create_started(&store).await;

    let result = store
        .create(
            created.saga_id,
            OrderId::new(),
            SagaStep::ReserveInventory,
            serde_json::Value::Null,
        )
        .await;

    assert!(matches!(result, Err(SagaStoreError::AlreadyExists(id)) if id == created.saga_id));
}

#[tokio::test]
#[serial]
async fn load_missing_saga() {
    let store = get_test_store().await;
    let result = store.load(SagaId::new()).await;
    assert!(matches!(result, Err(SagaStoreError::NotFound(_))));
}

#[tokio::test]
#[serial]
async fn compare_and_update_advances_once() {
    let store = get_test_store().await;
    let created = create_started(&store).await;

    let next = created
        .transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment))
        .with_payload(serde_json::json!({"customer_id": "c-1", "reserved": true}));

    let stored = store
        .compare_and_update(
            created.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            next.clone(),
        )
        .await
        .unwrap();
    assert_eq!(stored.status, SagaStatus::InProgress);
    assert_eq!(stored.current_step, Some(SagaStep::ProcessPayment));
    assert_eq!(stored.payload["reserved"], true);
    assert_eq!(stored.started_at, created.started_at);

    let again = store
        .compare_and_update(
            created.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            next,
        )
        .await;
    match again {
        Err(SagaStoreError::Conflict {
            actual_status,
            actual_step,
            ..
        }) => {
            assert_eq!(actual_status, SagaStatus::InProgress);
            assert_eq!(actual_step, Some(SagaStep::ProcessPayment));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn compare_and_update_matches_null_step() {
    let store = get_test_store().await;
    let created = create_started(&store).await;

    // Drive to a terminal state; the stored step becomes NULL.
    let completed = created.transition(SagaStatus::Completed, None);
    store
        .compare_and_update(
            created.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            completed,
        )
        .await
        .unwrap();

    let loaded = store.load(created.saga_id).await.unwrap();
    assert_eq!(loaded.status, SagaStatus::Completed);
    assert_eq!(loaded.current_step, None);
}

#[tokio::test]
#[serial]
async fn compare_and_update_missing_saga() {
    let store = get_test_store().await;
    let state = SagaState::new(
        SagaId::new(),
        OrderId::new(),
        SagaStep::ReserveInventory,
        serde_json::Value::Null,
    );
    let next = state.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment));

    let result = store
        .compare_and_update(
            state.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            next,
        )
        .await;
    assert!(matches!(result, Err(SagaStoreError::NotFound(_))));
}

#[tokio::test]
#[serial]
async fn find_stalled_returns_oldest_unfinished() {
    let store = get_test_store().await;
    let now = Utc::now();

    let a = create_started(&store).await;
    let b = create_started(&store).await;
    let c = create_started(&store).await;

    // a: in progress, stale for ten minutes
    store
        .compare_and_update(
            a.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            a.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment))
                .touched_at(now - Duration::minutes(10)),
        )
        .await
        .unwrap();

    // b: compensating, stale for five minutes
    store
        .compare_and_update(
            b.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            b.transition(SagaStatus::Failed, Some(SagaStep::CompensateInventory))
                .touched_at(now - Duration::minutes(5)),
        )
        .await
        .unwrap();

    // c: completed long ago, never stalled
    store
        .compare_and_update(
            c.saga_id,
            SagaStatus::Started,
            Some(SagaStep::ReserveInventory),
            c.transition(SagaStatus::Completed, None)
                .touched_at(now - Duration::hours(1)),
        )
        .await
        .unwrap();

    let stalled = store
        .find_stalled(now - Duration::minutes(1), 10)
        .await
        .unwrap();
    let ids: Vec<SagaId> = stalled.iter().map(|s| s.saga_id).collect();
    assert_eq!(ids, vec![a.saga_id, b.saga_id]);

    let limited = store
        .find_stalled(now - Duration::minutes(1), 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].saga_id, a.saga_id);
}

#[tokio::test]
#[serial]
async fn concurrent_updates_admit_exactly_one() {
    let store = get_test_store().await;
    let created = create_started(&store).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        let next = created.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment));
        handles.push(tokio::spawn(async move {
            store
                .compare_and_update(
                    next.saga_id,
                    SagaStatus::Started,
                    Some(SagaStep::ReserveInventory),
                    next,
                )
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(SagaStoreError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
async fn claim_from_same_snapshot_admits_one() {
    let store = get_test_store().await;
    let created = create_started(&store).await;
    let now = created.updated_at + Duration::minutes(5);

    let claimed = store.claim(&created, now).await.unwrap();
    assert_eq!(claimed.updated_at, now);
    assert_eq!(claimed.current_step, Some(SagaStep::ReserveInventory));

    let result = store.claim(&created, now).await;
    assert!(matches!(
        result,
        Err(SagaStoreError::StaleClaim { actual_updated_at, .. }) if actual_updated_at == now
    ));

    // The winner's snapshot can claim again later.
    let later = now + Duration::minutes(5);
    assert_eq!(store.claim(&claimed, later).await.unwrap().updated_at, later);
}
