use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{order, order_item, order_status_history};
use crate::errors::ServiceError;
use crate::services::order_status::{Actor, OrderStatus};
use crate::services::reconciliation::GatewaySignal;
use crate::{ApiResponse, AppState, ListQuery, PaginatedResponse};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub total: Decimal,
    pub status: String,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub preference_id: Option<String>,
    pub payment_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub payment_type: Option<String>,
    pub stock_decremented: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<order::Model> for OrderResponse {
    fn from(model: order::Model) -> Self {
        Self {
            id: model.id,
            total: model.total,
            status: model.status,
            payer_email: model.payer_email,
            payer_name: model.payer_name,
            preference_id: model.preference_id,
            payment_id: model.payment_id,
            merchant_order_id: model.merchant_order_id,
            payment_type: model.payment_type,
            stock_decremented: model.stock_decremented,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub sku: Option<String>,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub subtotal: Decimal,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(model: order_item::Model) -> Self {
        Self {
            id: model.id,
            product_id: model.product_id,
            name: model.name,
            sku: model.sku,
            unit_price: model.unit_price,
            quantity: model.quantity,
            subtotal: model.subtotal,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryResponse {
    pub previous_status: Option<String>,
    pub new_status: String,
    pub changed_by: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<order_status_history::Model> for StatusHistoryResponse {
    fn from(model: order_status_history::Model) -> Self {
        Self {
            previous_status: model.previous_status,
            new_status: model.new_status,
            changed_by: model.changed_by,
            note: model.note,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(ListQuery),
    responses(
        (status = 200, description = "Paginated order list", body = ApiResponse<PaginatedResponse<OrderResponse>>)
    ),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderResponse>>>, ServiceError> {
    let (orders, total) = state
        .services
        .orders
        .list_orders(query.page, query.limit)
        .await?;
    let limit = query.limit.clamp(1, 100);
    let page = PaginatedResponse {
        items: orders.into_iter().map(OrderResponse::from).collect(),
        total,
        page: query.page,
        limit,
        total_pages: total.div_ceil(limit),
    };
    Ok(Json(ApiResponse::success(page)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order detail", body = ApiResponse<OrderResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(order.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/items",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order line items", body = ApiResponse<Vec<OrderItemResponse>>)
    ),
    tag = "Orders"
)]
pub async fn get_order_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<OrderItemResponse>>>, ServiceError> {
    // 404 for unknown orders instead of an empty list
    state.services.orders.get_order(id).await?;
    let items = state.services.orders.get_order_items(id).await?;
    Ok(Json(ApiResponse::success(
        items.into_iter().map(OrderItemResponse::from).collect(),
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/history",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Status transition history", body = ApiResponse<Vec<StatusHistoryResponse>>)
    ),
    tag = "Orders"
)]
pub async fn get_order_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StatusHistoryResponse>>>, ServiceError> {
    state.services.orders.get_order(id).await?;
    let history = state.services.order_status.get_history(id).await?;
    Ok(Json(ApiResponse::success(
        history.into_iter().map(StatusHistoryResponse::from).collect(),
    )))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    require_admin(&state, &headers)?;
    let updated = state
        .services
        .order_status
        .update_status(id, request.status, Actor::Admin, request.note)
        .await?;

    if request.status == OrderStatus::Paid {
        run_manual_paid_side_effects(&state, id).await;
    }

    Ok(Json(ApiResponse::success(updated.into())))
}

/// Bearer check against the configured admin token. A deployment without a
/// token leaves the endpoint open (local/dev).
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ServiceError> {
    let Some(expected) = &state.config.admin_api_token else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .unwrap_or("");
    if provided == expected.as_str() {
        Ok(())
    } else {
        Err(ServiceError::Unauthorized(
            "admin token required".to_string(),
        ))
    }
}

/// A manual move into `paid` carries the same exactly-once side effects as
/// a gateway signal; the stock flag guards the decrement either way.
async fn run_manual_paid_side_effects(state: &AppState, order_id: Uuid) {
    state
        .services
        .reconciliation
        .run_paid_side_effects(order_id, &GatewaySignal::default())
        .await;
}
