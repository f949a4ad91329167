//! HTTP handlers for supplier listing and detail (§6).

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::api::models::{
    BatchResponse, PaginatedResponse, PurchaseOrderResponse, SupplierDetailResponse,
    SupplierListQuery, SupplierResponse,
};
use crate::error::Result;
use crate::state::AppState;

pub async fn list_suppliers(
    State(state): State<AppState>,
    Query(query): Query<SupplierListQuery>,
) -> Result<Json<PaginatedResponse<SupplierResponse>>> {
    let page_no = query.page();
    let limit = query.limit();
    let page = state
        .store
        .list_suppliers(query.search.as_deref(), query.sort(), query.order(), page_no, limit)
        .await?;
    Ok(Json(PaginatedResponse::from_page(page, page_no, limit, SupplierResponse::from)))
}

pub async fn get_supplier(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<SupplierDetailResponse>> {
    let supplier = state.store.get_supplier(id).await?;
    let batches = state.store.list_batches_for_supplier(id).await?;
    let purchase_orders = state.store.list_purchase_orders_for_supplier(id).await?;

    let batch_count = batches.len() as i64;
    let po_count = purchase_orders.len() as i64;
    let total_value = batches.iter().map(|b| b.total_value).sum::<crate::model::Money>();

    Ok(Json(SupplierDetailResponse {
        id: supplier.id,
        supplier_number: supplier.supplier_number,
        name: supplier.name,
        phone: supplier.phone,
        email: supplier.email,
        facility: supplier.facility,
        created_at: supplier.created_at,
        batch_count,
        po_count,
        total_value: total_value.to_string(),
        batches: batches.into_iter().map(BatchResponse::from).collect(),
        purchase_orders: purchase_orders.into_iter().map(PurchaseOrderResponse::from).collect(),
    }))
}
