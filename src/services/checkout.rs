use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{CheckoutCode, CheckoutError};
use crate::events::{Event, EventSender};
use crate::gateway::{PaymentGateway, PreferenceItem, PreferencePayer, PreferenceRequest};
use crate::services::order_status::OrderStatus;
use crate::services::orders::{CreateOrderRequest, OrderIntake, OrderService};

/// Successful checkout submission. `redirect_url` is absent only when an
/// idempotent resubmit hit an order that no longer needs payment.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSuccess {
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_redirect_url: Option<String>,
}

/// Orchestrates order intake and payment preference creation.
#[derive(Clone)]
pub struct CheckoutService {
    orders: OrderService,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Option<Arc<EventSender>>,
}

impl CheckoutService {
    pub fn new(
        orders: OrderService,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            orders,
            gateway,
            event_sender,
        }
    }

    /// Full checkout submission: intake, then preference creation, then
    /// persisting the preference id on the order.
    ///
    /// The order insert commits before the gateway call; if the preference
    /// step fails the order is compensated into `pending_missing_preference`
    /// instead of being rolled back, so the sale is never silently lost.
    #[instrument(skip(self, request), fields(item_count = request.items.len()))]
    pub async fn submit_cart(
        &self,
        request: CreateOrderRequest,
    ) -> Result<CheckoutSuccess, CheckoutError> {
        if request.items.is_empty() {
            return Err(CheckoutError::new(
                CheckoutCode::InvalidCart,
                "Cart must contain at least one item",
            ));
        }
        // Zero is valid: a fully discounted cart still becomes an order.
        if request.total < Decimal::ZERO {
            return Err(CheckoutError::new(
                CheckoutCode::InvalidTotal,
                "Order total must not be negative",
            ));
        }

        let payer = build_payer(&request);
        let intake = self.orders.create_order(request).await?;

        if !intake.created {
            if let Some(done) = self.replay_without_payment(&intake) {
                return Ok(done);
            }
            info!(order_id = %intake.order.id, "Resubmitted order still pending; refreshing preference");
        }

        let order_id = intake.order.id;
        let preference_request = PreferenceRequest {
            order_id,
            items: intake
                .items
                .iter()
                .map(|item| PreferenceItem {
                    id: item.product_id.to_string(),
                    title: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            payer,
        };

        let preference = match self.gateway.create_preference(&preference_request).await {
            Ok(preference) => preference,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Preference creation failed; compensating order");
                self.compensate(order_id, "payment preference creation failed")
                    .await;
                return Err(CheckoutError::new(
                    CheckoutCode::PreferenceFailed,
                    "Could not start the payment; the order was saved and will be retried",
                ));
            }
        };

        if let Err(e) = self
            .orders
            .set_preference(order_id, &preference.preference_id)
            .await
        {
            error!(order_id = %order_id, error = %e, "Failed to persist preference id; compensating order");
            self.compensate(order_id, "failed to persist preference id")
                .await;
            return Err(CheckoutError::new(
                CheckoutCode::PreferenceUpdateFailed,
                "Could not attach the payment to the order",
            ));
        }

        if let Some(sender) = &self.event_sender {
            sender
                .send(Event::PreferenceCreated {
                    order_id,
                    preference_id: preference.preference_id.clone(),
                })
                .await;
        }

        info!(order_id = %order_id, preference_id = %preference.preference_id, "Checkout submitted");
        Ok(CheckoutSuccess {
            order_id,
            preference_id: Some(preference.preference_id),
            redirect_url: preference.init_point,
            sandbox_redirect_url: preference.sandbox_init_point,
        })
    }

    /// An idempotent resubmit of an order that already left the payable
    /// states gets its stored identifiers back without a new gateway call.
    fn replay_without_payment(&self, intake: &OrderIntake) -> Option<CheckoutSuccess> {
        let status = OrderStatus::parse(&intake.order.status).ok()?;
        match status {
            OrderStatus::Pending | OrderStatus::PendingMissingPreference | OrderStatus::Rejected => {
                None
            }
            OrderStatus::Paid | OrderStatus::Fulfilled | OrderStatus::Cancelled => {
                info!(order_id = %intake.order.id, status = %status, "Resubmit of settled order; skipping gateway");
                Some(CheckoutSuccess {
                    order_id: intake.order.id,
                    preference_id: intake.order.preference_id.clone(),
                    redirect_url: None,
                    sandbox_redirect_url: None,
                })
            }
        }
    }

    async fn compensate(&self, order_id: Uuid, note: &str) {
        if let Err(e) = self.orders.mark_preference_missing(order_id, note).await {
            warn!(order_id = %order_id, error = %e, "Compensation update failed; order left as-is");
        }
    }
}

fn build_payer(request: &CreateOrderRequest) -> Option<PreferencePayer> {
    if request.payer_email.is_none()
        && request.payer_name.is_none()
        && request.payer_phone.is_none()
    {
        return None;
    }
    Some(PreferencePayer {
        name: request.payer_name.clone(),
        email: request.payer_email.clone(),
        phone: request.payer_phone.clone(),
    })
}
