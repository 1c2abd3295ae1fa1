pub mod checkout;
pub mod orders;
pub mod reconciliation;

use crate::services::checkout::CheckoutService;
use crate::services::inventory::InventoryService;
use crate::services::order_status::OrderStatusService;
use crate::services::orders::OrderService;
use crate::services::reconciliation::ReconciliationService;

/// Service registry handed to handlers through [`crate::AppState`].
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub order_status: OrderStatusService,
    pub inventory: InventoryService,
    pub checkout: CheckoutService,
    pub reconciliation: ReconciliationService,
}
