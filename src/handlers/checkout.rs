use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::CheckoutCode;
use crate::services::checkout::CheckoutSuccess;
use crate::services::orders::CreateOrderRequest;
use crate::AppState;

/// Storefront-facing checkout response. Success and failure share the `ok`
/// discriminator so the client can branch without inspecting HTTP status.
#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum CheckoutResponse {
    Ok {
        ok: bool,
        #[serde(flatten)]
        success: CheckoutSuccess,
    },
    Err {
        ok: bool,
        message: String,
        code: CheckoutCode,
    },
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 200, description = "Order created and payment preference ready", body = CheckoutResponse),
        (status = 400, description = "Invalid cart or total", body = CheckoutResponse),
        (status = 502, description = "Payment gateway unavailable", body = CheckoutResponse)
    ),
    tag = "Checkout"
)]
pub async fn submit_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    match state.services.checkout.submit_cart(request).await {
        Ok(success) => (
            StatusCode::OK,
            Json(CheckoutResponse::Ok { ok: true, success }),
        ),
        Err(err) => (
            err.code.status_code(),
            Json(CheckoutResponse::Err {
                ok: false,
                message: err.message,
                code: err.code,
            }),
        ),
    }
}
