pub mod checkout;
pub mod inventory;
pub mod order_status;
pub mod orders;
pub mod reconciliation;
