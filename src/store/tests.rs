//! `Store` contract tests, run against every backend.
//!
//! Each `run_test_*` function is backend-agnostic; an `#[rstest]` wrapper
//! runs it against `InMemoryStore`, and an `#[sqlx::test]` wrapper (feature
//! `postgres`) runs the same body against a freshly migrated database.
//! Mirrors the teacher's `storage/tests.rs` split.

use chrono::NaiveDate;
use rstest::{fixture, rstest};
use rust_decimal_macros::dec;

use crate::model::{ActionType, BatchStatus, Money, PoStatus};

use super::in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
use super::postgres::PostgresStore;
use super::{BatchFilter, PoUpsert, ProposedBatch, SortOrder, Store};

#[fixture]
fn in_memory_store() -> InMemoryStore {
    InMemoryStore::new()
}

fn sample_row(po_number: &str, supplier_number: &str, due: NaiveDate, value: rust_decimal::Decimal) -> PoUpsert {
    PoUpsert {
        po_number: po_number.to_string(),
        po_line: "1".to_string(),
        supplier_number: supplier_number.to_string(),
        supplier_name: format!("Supplier {supplier_number}"),
        action_type: ActionType::PushOut,
        due_date: due,
        recommended_date: Some(due + chrono::Duration::days(30)),
        calculated_total_value: Money::new(value),
    }
}

async fn run_test_upsert_supplier_is_idempotent_on_number<S: Store>(store: &S) {
    let first = store.upsert_supplier("S1", "Acme").await.unwrap();
    let second = store.upsert_supplier("S1", "Acme Renamed").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "Acme Renamed");
}

#[rstest]
#[tokio::test]
async fn test_upsert_supplier_is_idempotent_on_number_in_memory(in_memory_store: InMemoryStore) {
    run_test_upsert_supplier_is_idempotent_on_number(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_upsert_supplier_is_idempotent_on_number_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_upsert_supplier_is_idempotent_on_number(&store).await;
}

async fn run_test_reupload_same_external_id_updates_in_place_and_clears_batch<S: Store>(store: &S) {
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    let row = sample_row("100", "S1", due, dec!(500.00));
    let outcomes = store.upsert_purchase_orders(vec![row]).await.unwrap();
    let po_id = outcomes[0].po().id;

    let supplier = store.upsert_supplier("S1", "Acme").await.unwrap();
    let batch = store
        .create_batch_linking_pos(ProposedBatch {
            supplier_id: supplier.id,
            po_ids: vec![po_id],
            action_types: [ActionType::PushOut].into_iter().collect(),
            total_value: Money::new(dec!(500.00)),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.po_count, 1);

    let new_due = NaiveDate::from_ymd_opt(2025, 1, 20).unwrap();
    let reupload = sample_row("100", "S1", new_due, dec!(500.00));
    let outcomes = store.upsert_purchase_orders(vec![reupload]).await.unwrap();
    match &outcomes[0] {
        super::PoUpsertOutcome::Updated { po, conflict } => {
            assert_eq!(po.id, po_id);
            assert_eq!(po.due_date, new_due);
            assert!(po.batch_id.is_none(), "re-upload must clear batch_id");
            assert!(conflict.is_some(), "differing due date must record exactly one conflict");
        }
        super::PoUpsertOutcome::Inserted(_) => panic!("expected an update, got a fresh insert"),
    }
}

#[rstest]
#[tokio::test]
async fn test_reupload_same_external_id_updates_in_place_and_clears_batch_in_memory(in_memory_store: InMemoryStore) {
    run_test_reupload_same_external_id_updates_in_place_and_clears_batch(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_reupload_same_external_id_updates_in_place_and_clears_batch_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_reupload_same_external_id_updates_in_place_and_clears_batch(&store).await;
}

async fn run_test_create_batch_linking_pos_is_atomic_against_double_link<S: Store>(store: &S) {
    let supplier = store.upsert_supplier("S1", "Acme").await.unwrap();
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    let rows = vec![sample_row("1", "S1", due, dec!(100.00)), sample_row("2", "S1", due, dec!(200.00))];
    let outcomes = store.upsert_purchase_orders(rows).await.unwrap();
    let po_ids: Vec<_> = outcomes.iter().map(|o| o.po().id).collect();

    let proposal = ProposedBatch {
        supplier_id: supplier.id,
        po_ids: po_ids.clone(),
        action_types: [ActionType::PushOut].into_iter().collect(),
        total_value: Money::new(dec!(300.00)),
    };

    let first = store.create_batch_linking_pos(proposal.clone()).await.unwrap();
    assert!(first.is_some());

    // Both POs are now linked; a second attempt to link the same POs finds
    // nothing left to claim and abandons the proposal.
    let second = store.create_batch_linking_pos(proposal).await.unwrap();
    assert!(second.is_none());
}

#[rstest]
#[tokio::test]
async fn test_create_batch_linking_pos_is_atomic_against_double_link_in_memory(in_memory_store: InMemoryStore) {
    run_test_create_batch_linking_pos_is_atomic_against_double_link(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_create_batch_linking_pos_is_atomic_against_double_link_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_create_batch_linking_pos_is_atomic_against_double_link(&store).await;
}

async fn run_test_update_batch_status_if_is_a_true_compare_and_swap<S: Store>(store: &S) {
    let supplier = store.upsert_supplier("S1", "Acme").await.unwrap();
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    let row = sample_row("1", "S1", due, dec!(100.00));
    let outcomes = store.upsert_purchase_orders(vec![row]).await.unwrap();
    let po_id = outcomes[0].po().id;
    let batch = store
        .create_batch_linking_pos(ProposedBatch {
            supplier_id: supplier.id,
            po_ids: vec![po_id],
            action_types: [ActionType::PushOut].into_iter().collect(),
            total_value: Money::new(dec!(100.00)),
        })
        .await
        .unwrap()
        .unwrap();

    // Expected status is stale (batch is QUEUED, not IN_PROGRESS): no-op.
    let applied = store
        .update_batch_status_if(batch.id, BatchStatus::InProgress, BatchStatus::Completed)
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(store.get_batch(batch.id).await.unwrap().status, BatchStatus::Queued);

    // Correct expected status: applies exactly once.
    let applied = store
        .update_batch_status_if(batch.id, BatchStatus::Queued, BatchStatus::InProgress)
        .await
        .unwrap();
    assert!(applied);
    assert_eq!(store.get_batch(batch.id).await.unwrap().status, BatchStatus::InProgress);
}

#[rstest]
#[tokio::test]
async fn test_update_batch_status_if_is_a_true_compare_and_swap_in_memory(in_memory_store: InMemoryStore) {
    run_test_update_batch_status_if_is_a_true_compare_and_swap(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_update_batch_status_if_is_a_true_compare_and_swap_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_update_batch_status_if_is_a_true_compare_and_swap(&store).await;
}

async fn run_test_list_batches_filters_by_status_and_paginates<S: Store>(store: &S) {
    let supplier = store.upsert_supplier("S1", "Acme").await.unwrap();
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    for i in 0..5 {
        let value = dec!(10.00) * rust_decimal::Decimal::from(i + 1);
        let row = sample_row(&i.to_string(), "S1", due, value);
        let outcomes = store.upsert_purchase_orders(vec![row]).await.unwrap();
        let po_id = outcomes[0].po().id;
        store
            .create_batch_linking_pos(ProposedBatch {
                supplier_id: supplier.id,
                po_ids: vec![po_id],
                action_types: [ActionType::PushOut].into_iter().collect(),
                total_value: Money::new(dec!(10.00)),
            })
            .await
            .unwrap();
    }

    let page = store
        .list_batches(BatchFilter::default(), super::BatchSort::CreatedAt, SortOrder::Asc, 1, 2)
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);

    let filtered = store
        .list_batches(
            BatchFilter {
                status: Some(BatchStatus::Queued),
                ..Default::default()
            },
            super::BatchSort::CreatedAt,
            SortOrder::Asc,
            1,
            10,
        )
        .await
        .unwrap();
    assert_eq!(filtered.total, 5);
}

#[rstest]
#[tokio::test]
async fn test_list_batches_filters_by_status_and_paginates_in_memory(in_memory_store: InMemoryStore) {
    run_test_list_batches_filters_by_status_and_paginates(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_list_batches_filters_by_status_and_paginates_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_list_batches_filters_by_status_and_paginates(&store).await;
}

async fn run_test_complete_purchase_order_is_idempotent<S: Store>(store: &S) {
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    let row = sample_row("1", "S1", due, dec!(100.00));
    let outcomes = store.upsert_purchase_orders(vec![row]).await.unwrap();
    let po_id = outcomes[0].po().id;

    let applied = store.complete_purchase_order(po_id, true).await.unwrap();
    assert!(applied);
    let po = store.get_purchase_order(po_id).await.unwrap();
    assert_eq!(po.status, PoStatus::Completed);
    assert_eq!(po.due_date, due + chrono::Duration::days(30));
    assert_eq!(po.original_due_date, Some(due));

    // Second call is a no-op: already completed.
    let applied_again = store.complete_purchase_order(po_id, true).await.unwrap();
    assert!(!applied_again);
}

#[rstest]
#[tokio::test]
async fn test_complete_purchase_order_is_idempotent_in_memory(in_memory_store: InMemoryStore) {
    run_test_complete_purchase_order_is_idempotent(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_complete_purchase_order_is_idempotent_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_complete_purchase_order_is_idempotent(&store).await;
}
