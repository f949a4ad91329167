//! PostgreSQL `Store` implementation.
//!
//! Mirrors the teacher's `PostgresStorage`: a `PgPool`, compile-time checked
//! queries for the fixed-shape operations, `rows_affected()` checks for
//! every conditional update, and `FOR UPDATE SKIP LOCKED` wherever two
//! workers could otherwise race on the same row. Dynamic, filterable
//! queries (`list_batches`, `list_suppliers`) fall back to the query
//! builder instead of the macro, since their shape isn't fixed at compile
//! time.

use std::collections::BTreeSet;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    ActionType, ActivityLog, AgentRun, AgentRunStatus, BatchId, BatchLog, BatchLogType,
    BatchStatus, Conflict, ConflictType, EntityType, LogLevel, Money, PoStatus, PurchaseOrder,
    PurchaseOrderId, Supplier, SupplierBatch, SupplierId,
};

use super::{
    BatchFilter, BatchSort, BatchStats, Page, PoUpsert, PoUpsertOutcome, ProposedBatch, SortOrder,
    Store,
};

/// PostgreSQL-backed Durable Store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A listener for the `batch_events` channel, for deployments that want
    /// the Event Bus's durable-replay variant instead of the in-process
    /// broadcast default (see `events` module doc comment).
    pub async fn create_listener(&self) -> Result<PgListener> {
        PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| EngineError::Internal(anyhow!("failed to create listener: {e}")))
    }
}

fn action_type_str(a: ActionType) -> &'static str {
    match a {
        ActionType::Cancel => "cancel",
        ActionType::Expedite => "expedite",
        ActionType::PushOut => "push_out",
    }
}

fn parse_action_type(s: &str) -> ActionType {
    match s {
        "cancel" => ActionType::Cancel,
        "expedite" => ActionType::Expedite,
        _ => ActionType::PushOut,
    }
}

fn po_status_str(s: PoStatus) -> &'static str {
    match s {
        PoStatus::Pending => "pending",
        PoStatus::Queued => "queued",
        PoStatus::InProgress => "in_progress",
        PoStatus::Completed => "completed",
        PoStatus::Failed => "failed",
        PoStatus::Conflict => "conflict",
    }
}

fn parse_po_status(s: &str) -> PoStatus {
    match s {
        "pending" => PoStatus::Pending,
        "queued" => PoStatus::Queued,
        "in_progress" => PoStatus::InProgress,
        "completed" => PoStatus::Completed,
        "failed" => PoStatus::Failed,
        _ => PoStatus::Conflict,
    }
}

fn batch_status_str(s: BatchStatus) -> &'static str {
    match s {
        BatchStatus::Queued => "queued",
        BatchStatus::InProgress => "in_progress",
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
        BatchStatus::Partial => "partial",
    }
}

fn parse_batch_status(s: &str) -> BatchStatus {
    match s {
        "queued" => BatchStatus::Queued,
        "in_progress" => BatchStatus::InProgress,
        "completed" => BatchStatus::Completed,
        "failed" => BatchStatus::Failed,
        _ => BatchStatus::Partial,
    }
}

fn conflict_type_str(c: ConflictType) -> &'static str {
    match c {
        ConflictType::DueDateChanged => "due_date_changed",
        ConflictType::RecommendedDateChanged => "recommended_date_changed",
        ConflictType::ValueChanged => "value_changed",
    }
}

fn money(d: Decimal) -> Money {
    Money::new(d)
}

#[derive(sqlx::FromRow)]
struct PoRow {
    id: Uuid,
    external_id: String,
    po_number: String,
    po_line: String,
    supplier_id: Uuid,
    action_type: String,
    status: String,
    due_date: chrono::NaiveDate,
    original_due_date: Option<chrono::NaiveDate>,
    recommended_date: Option<chrono::NaiveDate>,
    calculated_total_value: Decimal,
    batch_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PoRow> for PurchaseOrder {
    fn from(r: PoRow) -> Self {
        PurchaseOrder {
            id: r.id,
            external_id: r.external_id,
            po_number: r.po_number,
            po_line: r.po_line,
            supplier_id: r.supplier_id,
            action_type: parse_action_type(&r.action_type),
            status: parse_po_status(&r.status),
            due_date: r.due_date,
            original_due_date: r.original_due_date,
            recommended_date: r.recommended_date,
            calculated_total_value: money(r.calculated_total_value),
            batch_id: r.batch_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    supplier_id: Uuid,
    status: String,
    action_types: Vec<String>,
    total_value: Decimal,
    po_count: i32,
    priority: Decimal,
    attempt_count: i32,
    max_attempts: i32,
    scheduled_for: Option<DateTime<Utc>>,
    external_id: Option<String>,
    external_url: Option<String>,
    last_outcome: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BatchRow> for SupplierBatch {
    fn from(r: BatchRow) -> Self {
        SupplierBatch {
            id: r.id,
            supplier_id: r.supplier_id,
            status: parse_batch_status(&r.status),
            action_types: r.action_types.iter().map(|s| parse_action_type(s)).collect::<BTreeSet<_>>(),
            total_value: money(r.total_value),
            po_count: r.po_count as usize,
            priority: r.priority,
            attempt_count: r.attempt_count as u32,
            max_attempts: r.max_attempts as u32,
            scheduled_for: r.scheduled_for,
            external_id: r.external_id,
            external_url: r.external_url,
            last_outcome: r.last_outcome,
            completed_at: r.completed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SupplierRollupRow {
    id: Uuid,
    supplier_number: String,
    name: String,
    phone: Option<String>,
    email: Option<String>,
    facility: Option<String>,
    created_at: DateTime<Utc>,
    batch_count: i64,
    po_count: i64,
    total_value: Decimal,
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_supplier(&self, supplier_number: &str, name: &str) -> Result<Supplier> {
        let row = sqlx::query!(
            r#"
            INSERT INTO suppliers (id, supplier_number, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (supplier_number) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, supplier_number, name, phone, email, facility, created_at
            "#,
            Uuid::new_v4(),
            supplier_number,
            name,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Supplier {
            id: row.id,
            supplier_number: row.supplier_number,
            name: row.name,
            phone: row.phone,
            email: row.email,
            facility: row.facility,
            created_at: row.created_at,
        })
    }

    async fn get_supplier(&self, id: SupplierId) -> Result<Supplier> {
        let row = sqlx::query!(
            "SELECT id, supplier_number, name, phone, email, facility, created_at FROM suppliers WHERE id = $1",
            id,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::not_found("supplier", id))?;

        Ok(Supplier {
            id: row.id,
            supplier_number: row.supplier_number,
            name: row.name,
            phone: row.phone,
            email: row.email,
            facility: row.facility,
            created_at: row.created_at,
        })
    }

    async fn list_suppliers(
        &self,
        search: Option<&str>,
        sort: SupplierSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<(Supplier, SupplierRollup)>> {
        let offset = (page.saturating_sub(1) as i64) * limit as i64;
        let like = search.map(|s| format!("%{}%", s.to_lowercase()));

        let total = sqlx::query_scalar!(
            r#"SELECT count(*) as "count!" FROM suppliers WHERE $1::text IS NULL OR lower(name) LIKE $1 OR lower(supplier_number) LIKE $1"#,
            like,
        )
        .fetch_one(&self.pool)
        .await?;

        let order_col = match sort {
            SupplierSort::Name => "s.name",
            SupplierSort::CreatedAt => "s.created_at",
            SupplierSort::TotalValue => "total_value",
            SupplierSort::BatchCount => "batch_count",
        };
        let order_dir = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        // Correlated subqueries, not joins: a supplier with N batches and M
        // POs would duplicate rows N*M ways under a join, corrupting the
        // count/sum aggregates.
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            r#"
            SELECT s.id, s.supplier_number, s.name, s.phone, s.email, s.facility, s.created_at,
                   (SELECT count(*) FROM supplier_batches b WHERE b.supplier_id = s.id) AS batch_count,
                   (SELECT count(*) FROM purchase_orders p WHERE p.supplier_id = s.id) AS po_count,
                   (SELECT coalesce(sum(b.total_value), 0) FROM supplier_batches b WHERE b.supplier_id = s.id) AS total_value
            FROM suppliers s
            WHERE 1=1
            "#,
        );
        if let Some(like) = &like {
            qb.push(" AND (lower(s.name) LIKE ")
                .push_bind(like.clone())
                .push(" OR lower(s.supplier_number) LIKE ")
                .push_bind(like.clone())
                .push(")");
        }
        qb.push(format!(" ORDER BY {order_col} {order_dir} LIMIT "))
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build_query_as::<SupplierRollupRow>().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(|row| {
                    (
                        Supplier {
                            id: row.id,
                            supplier_number: row.supplier_number,
                            name: row.name,
                            phone: row.phone,
                            email: row.email,
                            facility: row.facility,
                            created_at: row.created_at,
                        },
                        SupplierRollup {
                            batch_count: row.batch_count,
                            po_count: row.po_count,
                            total_value: money(row.total_value),
                        },
                    )
                })
                .collect(),
            total,
        })
    }

    async fn list_purchase_orders_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<PurchaseOrder>> {
        let rows = sqlx::query_as!(
            PoRow,
            r#"
            SELECT id, external_id, po_number, po_line, supplier_id, action_type, status,
                   due_date, original_due_date, recommended_date, calculated_total_value,
                   batch_id, created_at, updated_at
            FROM purchase_orders WHERE supplier_id = $1 ORDER BY created_at DESC
            "#,
            supplier_id,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_purchase_orders(&self, rows: Vec<PoUpsert>) -> Result<Vec<PoUpsertOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            let supplier_id = sqlx::query_scalar!(
                r#"
                INSERT INTO suppliers (id, supplier_number, name)
                VALUES ($1, $2, $3)
                ON CONFLICT (supplier_number) DO UPDATE SET name = suppliers.name
                RETURNING id
                "#,
                Uuid::new_v4(),
                row.supplier_number,
                row.supplier_name,
            )
            .fetch_one(&mut *tx)
            .await?;

            let external_id = row.external_id();
            let existing = sqlx::query!(
                r#"
                SELECT id, due_date, recommended_date, calculated_total_value
                FROM purchase_orders WHERE external_id = $1
                "#,
                external_id,
            )
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing) = existing {
                let mut details = serde_json::Map::new();
                let mut conflict_type = None;
                if existing.due_date != row.due_date {
                    details.insert("due_date".into(), serde_json::json!({"old": existing.due_date, "new": row.due_date}));
                    conflict_type = Some(ConflictType::DueDateChanged);
                }
                if existing.recommended_date != row.recommended_date {
                    details.insert(
                        "recommended_date".into(),
                        serde_json::json!({"old": existing.recommended_date, "new": row.recommended_date}),
                    );
                    conflict_type.get_or_insert(ConflictType::RecommendedDateChanged);
                }
                if existing.calculated_total_value != row.calculated_total_value.as_decimal() {
                    details.insert(
                        "calculated_total_value".into(),
                        serde_json::json!({
                            "old": existing.calculated_total_value.to_string(),
                            "new": row.calculated_total_value.to_string(),
                        }),
                    );
                    conflict_type.get_or_insert(ConflictType::ValueChanged);
                }

                let updated = sqlx::query!(
                    r#"
                    UPDATE purchase_orders SET
                        action_type = $2,
                        due_date = $3,
                        recommended_date = $4,
                        calculated_total_value = $5,
                        status = 'queued',
                        batch_id = NULL,
                        updated_at = now()
                    WHERE id = $1
                    RETURNING id, external_id, po_number, po_line, supplier_id, action_type, status,
                              due_date, original_due_date, recommended_date, calculated_total_value,
                              batch_id, created_at, updated_at
                    "#,
                    existing.id,
                    action_type_str(row.action_type),
                    row.due_date,
                    row.recommended_date,
                    row.calculated_total_value.as_decimal(),
                )
                .fetch_one(&mut *tx)
                .await?;

                let po: PurchaseOrder = PoRow {
                    id: updated.id,
                    external_id: updated.external_id,
                    po_number: updated.po_number,
                    po_line: updated.po_line,
                    supplier_id: updated.supplier_id,
                    action_type: updated.action_type,
                    status: updated.status,
                    due_date: updated.due_date,
                    original_due_date: updated.original_due_date,
                    recommended_date: updated.recommended_date,
                    calculated_total_value: updated.calculated_total_value,
                    batch_id: updated.batch_id,
                    created_at: updated.created_at,
                    updated_at: updated.updated_at,
                }
                .into();

                let conflict = if let Some(conflict_type) = conflict_type {
                    let details = serde_json::Value::Object(details);
                    let crow = sqlx::query!(
                        r#"
                        INSERT INTO conflicts (id, purchase_order_id, conflict_type, conflict_details)
                        VALUES ($1, $2, $3, $4)
                        RETURNING id, purchase_order_id, conflict_type, conflict_details, resolution, created_at
                        "#,
                        Uuid::new_v4(),
                        po.id,
                        conflict_type_str(conflict_type),
                        details,
                    )
                    .fetch_one(&mut *tx)
                    .await?;
                    Some(Conflict {
                        id: crow.id,
                        purchase_order_id: crow.purchase_order_id,
                        conflict_type,
                        conflict_details: crow.conflict_details,
                        resolution: crow.resolution,
                        created_at: crow.created_at,
                    })
                } else {
                    None
                };

                out.push(PoUpsertOutcome::Updated { po, conflict });
            } else {
                let inserted = sqlx::query!(
                    r#"
                    INSERT INTO purchase_orders (
                        id, external_id, po_number, po_line, supplier_id, action_type, status,
                        due_date, recommended_date, calculated_total_value
                    ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9)
                    RETURNING id, external_id, po_number, po_line, supplier_id, action_type, status,
                              due_date, original_due_date, recommended_date, calculated_total_value,
                              batch_id, created_at, updated_at
                    "#,
                    Uuid::new_v4(),
                    external_id,
                    row.po_number,
                    row.po_line,
                    supplier_id,
                    action_type_str(row.action_type),
                    row.due_date,
                    row.recommended_date,
                    row.calculated_total_value.as_decimal(),
                )
                .fetch_one(&mut *tx)
                .await?;

                let po: PurchaseOrder = PoRow {
                    id: inserted.id,
                    external_id: inserted.external_id,
                    po_number: inserted.po_number,
                    po_line: inserted.po_line,
                    supplier_id: inserted.supplier_id,
                    action_type: inserted.action_type,
                    status: inserted.status,
                    due_date: inserted.due_date,
                    original_due_date: inserted.original_due_date,
                    recommended_date: inserted.recommended_date,
                    calculated_total_value: inserted.calculated_total_value,
                    batch_id: inserted.batch_id,
                    created_at: inserted.created_at,
                    updated_at: inserted.updated_at,
                }
                .into();
                out.push(PoUpsertOutcome::Inserted(po));
            }
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn get_purchase_order(&self, id: PurchaseOrderId) -> Result<PurchaseOrder> {
        let row = sqlx::query_as!(
            PoRow,
            r#"
            SELECT id, external_id, po_number, po_line, supplier_id, action_type, status,
                   due_date, original_due_date, recommended_date, calculated_total_value,
                   batch_id, created_at, updated_at
            FROM purchase_orders WHERE id = $1
            "#,
            id,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::not_found("purchase_order", id))?;

        Ok(row.into())
    }

    async fn unassigned_purchase_orders(&self) -> Result<Vec<PurchaseOrder>> {
        let rows = sqlx::query_as!(
            PoRow,
            r#"
            SELECT id, external_id, po_number, po_line, supplier_id, action_type, status,
                   due_date, original_due_date, recommended_date, calculated_total_value,
                   batch_id, created_at, updated_at
            FROM purchase_orders
            WHERE batch_id IS NULL AND status NOT IN ('completed', 'failed')
            ORDER BY supplier_id, calculated_total_value DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_po_status_if(&self, id: PurchaseOrderId, expected: PoStatus, new_status: PoStatus) -> Result<bool> {
        let affected = sqlx::query!(
            "UPDATE purchase_orders SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
            id,
            po_status_str(expected),
            po_status_str(new_status),
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn complete_purchase_order(&self, id: PurchaseOrderId, copy_recommended_into_due: bool) -> Result<bool> {
        let affected = if copy_recommended_into_due {
            sqlx::query!(
                r#"
                UPDATE purchase_orders SET
                    status = 'completed',
                    original_due_date = COALESCE(original_due_date, due_date),
                    due_date = COALESCE(recommended_date, due_date),
                    updated_at = now()
                WHERE id = $1 AND status != 'completed'
                "#,
                id,
            )
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query!(
                "UPDATE purchase_orders SET status = 'completed', updated_at = now() WHERE id = $1 AND status != 'completed'",
                id,
            )
            .execute(&self.pool)
            .await?
            .rows_affected()
        };
        Ok(affected > 0)
    }

    async fn fail_purchase_order(&self, id: PurchaseOrderId) -> Result<bool> {
        let affected = sqlx::query!(
            "UPDATE purchase_orders SET status = 'failed', updated_at = now() WHERE id = $1 AND status NOT IN ('completed', 'failed')",
            id,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn batch_has_no_active_pos(&self, batch_id: BatchId) -> Result<bool> {
        let remaining = sqlx::query_scalar!(
            r#"SELECT count(*) as "count!" FROM purchase_orders WHERE batch_id = $1 AND status IN ('queued', 'in_progress')"#,
            batch_id,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(remaining == 0)
    }

    async fn create_batch_linking_pos(&self, proposed: ProposedBatch) -> Result<Option<SupplierBatch>> {
        let mut tx = self.pool.begin().await?;
        let batch_id = Uuid::new_v4();
        let action_types: Vec<String> = proposed.action_types.iter().map(|a| action_type_str(*a).to_string()).collect();

        let affected = sqlx::query!(
            "UPDATE purchase_orders SET batch_id = $1, status = 'queued', updated_at = now() WHERE id = ANY($2) AND batch_id IS NULL",
            batch_id,
            &proposed.po_ids[..],
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query!(
            r#"
            INSERT INTO supplier_batches (
                id, supplier_id, status, action_types, total_value, po_count, priority
            ) VALUES ($1, $2, 'queued', $3, $4, $5, $6)
            RETURNING id, supplier_id, status, action_types, total_value, po_count, priority,
                      attempt_count, max_attempts, scheduled_for, external_id, external_url,
                      last_outcome, completed_at, created_at, updated_at
            "#,
            batch_id,
            proposed.supplier_id,
            &action_types[..],
            proposed.total_value.as_decimal(),
            affected as i32,
            proposed.total_value.negated(),
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(
            BatchRow {
                id: row.id,
                supplier_id: row.supplier_id,
                status: row.status,
                action_types: row.action_types,
                total_value: row.total_value,
                po_count: row.po_count,
                priority: row.priority,
                attempt_count: row.attempt_count,
                max_attempts: row.max_attempts,
                scheduled_for: row.scheduled_for,
                external_id: row.external_id,
                external_url: row.external_url,
                last_outcome: row.last_outcome,
                completed_at: row.completed_at,
                created_at: row.created_at,
                updated_at: row.updated_at,
            }
            .into(),
        ))
    }

    async fn get_batch(&self, id: BatchId) -> Result<SupplierBatch> {
        let row = sqlx::query_as!(
            BatchRow,
            r#"
            SELECT id, supplier_id, status, action_types, total_value, po_count, priority,
                   attempt_count, max_attempts, scheduled_for, external_id, external_url,
                   last_outcome, completed_at, created_at, updated_at
            FROM supplier_batches WHERE id = $1
            "#,
            id,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::not_found("batch", id))?;
        Ok(row.into())
    }

    async fn get_batch_purchase_orders(&self, id: BatchId) -> Result<Vec<PurchaseOrder>> {
        let rows = sqlx::query_as!(
            PoRow,
            r#"
            SELECT id, external_id, po_number, po_line, supplier_id, action_type, status,
                   due_date, original_due_date, recommended_date, calculated_total_value,
                   batch_id, created_at, updated_at
            FROM purchase_orders WHERE batch_id = $1
            "#,
            id,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_batches(
        &self,
        filter: BatchFilter,
        sort: BatchSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<SupplierBatch>> {
        let mut count_qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT count(*) FROM supplier_batches b JOIN suppliers s ON s.id = b.supplier_id WHERE 1=1",
        );
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT b.id, b.supplier_id, b.status, b.action_types, b.total_value, b.po_count, b.priority,
                    b.attempt_count, b.max_attempts, b.scheduled_for, b.external_id, b.external_url,
                    b.last_outcome, b.completed_at, b.created_at, b.updated_at
             FROM supplier_batches b JOIN suppliers s ON s.id = b.supplier_id WHERE 1=1",
        );

        if let Some(status) = filter.status {
            count_qb.push(" AND b.status = ").push_bind(batch_status_str(status));
            qb.push(" AND b.status = ").push_bind(batch_status_str(status));
        }
        if let Some(action_type) = filter.action_type {
            count_qb.push(" AND b.action_types @> ARRAY[").push_bind(action_type_str(action_type)).push("]");
            qb.push(" AND b.action_types @> ARRAY[").push_bind(action_type_str(action_type)).push("]");
        }
        if let Some(search) = &filter.search {
            let like = format!("%{}%", search.to_lowercase());
            count_qb.push(" AND lower(s.name) LIKE ").push_bind(like.clone());
            qb.push(" AND lower(s.name) LIKE ").push_bind(like);
        }

        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let order_col = match sort {
            BatchSort::TotalValue => "b.total_value",
            BatchSort::SupplierName => "s.name",
            BatchSort::CreatedAt => "b.created_at",
            BatchSort::Priority => "b.priority",
        };
        let order_dir = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        qb.push(format!(" ORDER BY {order_col} {order_dir} LIMIT "))
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind((page.saturating_sub(1) as i64) * limit as i64);

        let rows = qb
            .build_query_as::<BatchRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.into_iter().map(Into::into).collect(),
            total,
        })
    }

    async fn list_batches_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<SupplierBatch>> {
        let rows = sqlx::query_as!(
            BatchRow,
            r#"
            SELECT id, supplier_id, status, action_types, total_value, po_count, priority,
                   attempt_count, max_attempts, scheduled_for, external_id, external_url,
                   last_outcome, completed_at, created_at, updated_at
            FROM supplier_batches WHERE supplier_id = $1 ORDER BY created_at DESC
            "#,
            supplier_id,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_batch_status_if(&self, id: BatchId, expected: BatchStatus, new_status: BatchStatus) -> Result<bool> {
        let affected = sqlx::query!(
            "UPDATE supplier_batches SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
            id,
            batch_status_str(expected),
            batch_status_str(new_status),
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn start_dispatch(&self, batch_id: BatchId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query!(
            r#"
            UPDATE supplier_batches SET status = 'in_progress', attempt_count = attempt_count + 1, updated_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
            batch_id,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query!(
            "UPDATE purchase_orders SET status = 'in_progress', updated_at = now() WHERE batch_id = $1 AND status IN ('queued', 'pending')",
            batch_id,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revert_dispatch(&self, batch_id: BatchId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!(
            r#"
            UPDATE supplier_batches SET status = 'queued', attempt_count = GREATEST(attempt_count - 1, 0), updated_at = now()
            WHERE id = $1
            "#,
            batch_id,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query!(
            "UPDATE purchase_orders SET status = 'queued', updated_at = now() WHERE batch_id = $1 AND status = 'in_progress'",
            batch_id,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_dispatch_success(&self, batch_id: BatchId, external_id: &str, external_url: &str) -> Result<()> {
        sqlx::query!(
            "UPDATE supplier_batches SET external_id = $2, external_url = $3, updated_at = now() WHERE id = $1",
            batch_id,
            external_id,
            external_url,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_batch(&self, batch_id: BatchId, new_status: BatchStatus, outcome: &str) -> Result<bool> {
        let affected = sqlx::query!(
            r#"
            UPDATE supplier_batches SET
                status = $2, last_outcome = $3, completed_at = now(), updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'partial')
            "#,
            batch_id,
            batch_status_str(new_status),
            outcome,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn schedule_batch_callback(&self, batch_id: BatchId, scheduled_for: DateTime<Utc>) -> Result<bool> {
        let affected = sqlx::query!(
            r#"
            UPDATE supplier_batches SET
                status = 'queued', scheduled_for = $2, attempt_count = attempt_count + 1, updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            "#,
            batch_id,
            scheduled_for,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn stats(&self) -> Result<BatchStats> {
        let by_status = sqlx::query!(
            r#"SELECT status, count(*) as "count!", sum(total_value) as "total!" FROM supplier_batches GROUP BY status"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let by_action = sqlx::query!(
            r#"SELECT action_type, count(*) as "count!", sum(calculated_total_value) as "total!" FROM purchase_orders GROUP BY action_type"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let unique_suppliers = sqlx::query_scalar!(
            r#"SELECT count(DISTINCT supplier_id) as "count!" FROM supplier_batches"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchStats {
            by_batch_status: by_status
                .into_iter()
                .map(|r| (parse_batch_status(&r.status), r.count, money(r.total)))
                .collect(),
            by_action_type: by_action
                .into_iter()
                .map(|r| (parse_action_type(&r.action_type), r.count, money(r.total)))
                .collect(),
            unique_suppliers,
        })
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!("DELETE FROM conflicts").execute(&mut *tx).await?;
        sqlx::query!("DELETE FROM agent_runs").execute(&mut *tx).await?;
        sqlx::query!("UPDATE purchase_orders SET batch_id = NULL").execute(&mut *tx).await?;
        sqlx::query!("DELETE FROM supplier_batches").execute(&mut *tx).await?;
        sqlx::query!("DELETE FROM purchase_orders").execute(&mut *tx).await?;
        sqlx::query!("DELETE FROM suppliers").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_agent_run(&self, batch_id: BatchId, external_id: &str, attempt: u32) -> Result<AgentRun> {
        let row = sqlx::query!(
            r#"
            INSERT INTO agent_runs (id, batch_id, external_id, status, attempt)
            VALUES ($1, $2, $3, 'active', $4)
            RETURNING id, batch_id, external_id, status, outcome, attempt, started_at, ended_at, duration_ms
            "#,
            Uuid::new_v4(),
            batch_id,
            external_id,
            attempt as i32,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AgentRun {
            id: row.id,
            batch_id: row.batch_id,
            external_id: row.external_id,
            status: AgentRunStatus::Active,
            outcome: row.outcome,
            attempt: row.attempt as u32,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_ms: row.duration_ms,
        })
    }

    async fn end_agent_run(&self, batch_id: BatchId, outcome: &str, duration_ms: Option<i64>) -> Result<()> {
        let status = if outcome == "failed" { "failed" } else { "completed" };
        sqlx::query!(
            r#"
            UPDATE agent_runs SET status = $2, outcome = $3, ended_at = now(), duration_ms = $4
            WHERE id = (
                SELECT id FROM agent_runs WHERE batch_id = $1 AND status = 'active'
                ORDER BY started_at DESC LIMIT 1
            )
            "#,
            batch_id,
            status,
            outcome,
            duration_ms,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_agent_runs(&self, batch_id: BatchId) -> Result<Vec<AgentRun>> {
        let rows = sqlx::query!(
            r#"
            SELECT id, batch_id, external_id, status, outcome, attempt, started_at, ended_at, duration_ms
            FROM agent_runs WHERE batch_id = $1 ORDER BY started_at
            "#,
            batch_id,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AgentRun {
                id: row.id,
                batch_id: row.batch_id,
                external_id: row.external_id,
                status: match row.status.as_str() {
                    "active" => AgentRunStatus::Active,
                    "failed" => AgentRunStatus::Failed,
                    _ => AgentRunStatus::Completed,
                },
                outcome: row.outcome,
                attempt: row.attempt as u32,
                started_at: row.started_at,
                ended_at: row.ended_at,
                duration_ms: row.duration_ms,
            })
            .collect())
    }

    async fn append_batch_log(
        &self,
        batch_id: BatchId,
        log_type: BatchLogType,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) -> Result<BatchLog> {
        let log_type_str = match log_type {
            BatchLogType::Log => "log",
            BatchLogType::PoUpdate => "po_update",
            BatchLogType::StatusChange => "status_change",
        };
        let level_str = match level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        };
        let row = sqlx::query!(
            r#"
            INSERT INTO batch_logs (id, batch_id, log_type, level, message, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, batch_id as "batch_id!: Uuid", log_type, level, message, data, created_at
            "#,
            Uuid::new_v4(),
            batch_id,
            log_type_str,
            level_str,
            message,
            data,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchLog {
            id: row.id,
            batch_id: row.batch_id,
            log_type,
            level,
            message: row.message,
            data: row.data,
            created_at: row.created_at,
        })
    }

    async fn list_batch_logs(&self, batch_id: BatchId, limit: u32) -> Result<Vec<BatchLog>> {
        let rows = sqlx::query!(
            r#"SELECT id, batch_id as "batch_id!: Uuid", log_type, level, message, data, created_at FROM batch_logs WHERE batch_id = $1 ORDER BY created_at LIMIT $2"#,
            batch_id,
            limit as i64,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BatchLog {
                id: row.id,
                batch_id: row.batch_id,
                log_type: match row.log_type.as_str() {
                    "po_update" => BatchLogType::PoUpdate,
                    "status_change" => BatchLogType::StatusChange,
                    _ => BatchLogType::Log,
                },
                level: match row.level.as_str() {
                    "debug" => LogLevel::Debug,
                    "warn" => LogLevel::Warn,
                    "error" => LogLevel::Error,
                    "success" => LogLevel::Success,
                    _ => LogLevel::Info,
                },
                message: row.message,
                data: row.data,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn append_activity_log(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<ActivityLog> {
        let entity_type_str = match entity_type {
            EntityType::Batch => "batch",
            EntityType::Po => "po",
        };
        let row = sqlx::query!(
            r#"
            INSERT INTO activity_logs (id, entity_type, entity_id, action, details)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, entity_type, entity_id, action, user_id, details, created_at
            "#,
            Uuid::new_v4(),
            entity_type_str,
            entity_id,
            action,
            details,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ActivityLog {
            id: row.id,
            entity_type,
            entity_id: row.entity_id,
            action: row.action,
            user_id: row.user_id,
            details: row.details,
            created_at: row.created_at,
        })
    }

    async fn create_conflict(
        &self,
        purchase_order_id: PurchaseOrderId,
        conflict_type: ConflictType,
        details: serde_json::Value,
    ) -> Result<Conflict> {
        let row = sqlx::query!(
            r#"
            INSERT INTO conflicts (id, purchase_order_id, conflict_type, conflict_details)
            VALUES ($1, $2, $3, $4)
            RETURNING id, purchase_order_id, conflict_type, conflict_details, resolution, created_at
            "#,
            Uuid::new_v4(),
            purchase_order_id,
            conflict_type_str(conflict_type),
            details,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Conflict {
            id: row.id,
            purchase_order_id: row.purchase_order_id,
            conflict_type,
            conflict_details: row.conflict_details,
            resolution: row.resolution,
            created_at: row.created_at,
        })
    }
}
