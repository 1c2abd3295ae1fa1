use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::errors::{CheckoutCode, ErrorResponse};
use crate::handlers;
use crate::services::checkout::CheckoutSuccess;
use crate::services::order_status::OrderStatus;
use crate::services::orders::{CartItemInput, CreateOrderRequest};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::checkout::submit_order,
        handlers::reconciliation::checkout_return,
        handlers::reconciliation::payment_webhook,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::get_order_items,
        handlers::orders::get_order_history,
        handlers::orders::update_order_status,
    ),
    components(schemas(
        CreateOrderRequest,
        CartItemInput,
        CheckoutSuccess,
        CheckoutCode,
        OrderStatus,
        ErrorResponse,
        handlers::checkout::CheckoutResponse,
        handlers::reconciliation::ReturnResponse,
        handlers::orders::OrderResponse,
        handlers::orders::OrderItemResponse,
        handlers::orders::StatusHistoryResponse,
        handlers::orders::UpdateStatusRequest,
    )),
    tags(
        (name = "Checkout", description = "Order intake and payment preference creation"),
        (name = "Payments", description = "Gateway payment reconciliation"),
        (name = "Orders", description = "Order lookups and admin status changes")
    ),
    info(
        title = "Storefront API",
        description = "Order creation and payment reconciliation service"
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
