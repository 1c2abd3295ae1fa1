use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{ConfirmationEmail, ConfirmationLine, Mailer};
use crate::services::inventory::InventoryService;
use crate::services::order_status::{append_history, plan_transition, Actor, OrderStatus};
use crate::services::orders::OrderService;

/// Payment outcome notification as the gateway reports it, via the buyer
/// redirect or the server webhook. Every field is optional; the gateway is
/// inconsistent about which ones it sends, and empty strings mean "absent".
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "snake_case")]
pub struct GatewaySignal {
    pub external_reference: Option<String>,
    pub status: Option<String>,
    pub collection_status: Option<String>,
    pub payment_id: Option<String>,
    pub collection_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub payment_type: Option<String>,
    pub preference_id: Option<String>,
}

impl GatewaySignal {
    fn field(raw: &Option<String>) -> Option<&str> {
        raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// `status` wins over `collection_status` when both arrive.
    pub fn effective_status(&self) -> Option<&str> {
        Self::field(&self.status).or_else(|| Self::field(&self.collection_status))
    }

    /// `payment_id` wins over its `collection_id` alias.
    pub fn effective_payment_id(&self) -> Option<&str> {
        Self::field(&self.payment_id).or_else(|| Self::field(&self.collection_id))
    }

    pub fn order_id(&self) -> Option<Uuid> {
        Self::field(&self.external_reference).and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Maps a gateway payment status onto an order status. Unknown values map
/// to `None` and leave the order untouched.
pub fn map_gateway_status(status: &str) -> Option<OrderStatus> {
    match status.to_ascii_lowercase().as_str() {
        "approved" => Some(OrderStatus::Paid),
        "rejected" => Some(OrderStatus::Rejected),
        "pending" | "in_process" => Some(OrderStatus::Pending),
        _ => None,
    }
}

/// What a reconciliation attempt did. Soft outcomes are normal operation,
/// not errors; the buyer-facing endpoints return 200 for all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Status moved; side effects ran if this was the first paid transition.
    Updated {
        order_id: Uuid,
        new_status: OrderStatus,
        first_time_paid: bool,
    },
    /// Signal carried no order reference we could resolve.
    MissingReference,
    /// Referenced order does not exist (stale or foreign signal).
    OrderNotFound,
    /// Signal was valid but required no change (unknown status, same
    /// status, terminal order, or a concurrent writer got there first).
    NoChange { order_id: Uuid },
}

/// Applies gateway payment signals to orders with exactly-once side effects.
#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    orders: OrderService,
    inventory: InventoryService,
    mailer: Arc<dyn Mailer>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReconciliationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        orders: OrderService,
        inventory: InventoryService,
        mailer: Arc<dyn Mailer>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            orders,
            inventory,
            mailer,
            event_sender,
        }
    }

    /// Reconciles one gateway signal.
    ///
    /// The status write is a compare-and-swap on the previously observed
    /// status, so two concurrent signals for the same transition can both
    /// read `pending` but only one performs the write and runs the paid
    /// side effects; the loser sees zero affected rows and backs off.
    #[instrument(skip(self, signal), fields(actor = actor.as_str()))]
    pub async fn reconcile(
        &self,
        signal: &GatewaySignal,
        actor: Actor,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let Some(order_id) = signal.order_id() else {
            warn!("Gateway signal without usable external_reference");
            return Ok(ReconcileOutcome::MissingReference);
        };

        let db = &*self.db_pool;
        let Some(existing) = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
        else {
            warn!(order_id = %order_id, "Gateway signal for unknown order");
            return Ok(ReconcileOutcome::OrderNotFound);
        };

        let current = OrderStatus::parse(&existing.status)?;
        if current.is_terminal() {
            info!(order_id = %order_id, status = %current, "Order in terminal state; ignoring gateway signal");
            return Ok(ReconcileOutcome::NoChange { order_id });
        }

        let mapped = signal.effective_status().and_then(map_gateway_status);
        let Some(target) = mapped else {
            info!(order_id = %order_id, status = ?signal.effective_status(), "Unmapped gateway status; no change");
            self.persist_payment_metadata(order_id, signal).await?;
            return Ok(ReconcileOutcome::NoChange { order_id });
        };

        let Some(plan) = plan_transition(current, target) else {
            self.persist_payment_metadata(order_id, signal).await?;
            return Ok(ReconcileOutcome::NoChange { order_id });
        };

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(plan.new_status.to_string()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(current.to_string()));
        if let Some(payment_id) = signal.effective_payment_id() {
            update = update.col_expr(order::Column::PaymentId, Expr::value(Some(payment_id.to_string())));
        }
        if let Some(merchant_order_id) = GatewaySignal::field(&signal.merchant_order_id) {
            update = update.col_expr(
                order::Column::MerchantOrderId,
                Expr::value(Some(merchant_order_id.to_string())),
            );
        }
        if let Some(payment_type) = GatewaySignal::field(&signal.payment_type) {
            update = update.col_expr(order::Column::PaymentType, Expr::value(Some(payment_type.to_string())));
        }
        if let Some(preference_id) = GatewaySignal::field(&signal.preference_id) {
            update = update.col_expr(
                order::Column::PreferenceId,
                Expr::value(Some(preference_id.to_string())),
            );
        }

        let result = update.exec(db).await.map_err(|e| {
            error!(error = %e, "Reconciliation status write failed");
            ServiceError::DatabaseError(e)
        })?;

        if result.rows_affected == 0 {
            info!(order_id = %order_id, "Concurrent reconciliation won the status write; backing off");
            return Ok(ReconcileOutcome::NoChange { order_id });
        }

        // The status write is already durable at this point. History is
        // bookkeeping; a failed append must not undo or mask the payment.
        if let Err(e) = append_history(
            db,
            order_id,
            Some(current.to_string()),
            plan.new_status,
            actor,
            signal.effective_status().map(|s| format!("gateway status: {}", s)),
        )
        .await
        {
            error!(order_id = %order_id, error = %e, "Status history append failed after reconciliation");
        }

        if let Some(sender) = &self.event_sender {
            sender
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status: current.to_string(),
                    new_status: plan.new_status.to_string(),
                    actor: actor.as_str().to_string(),
                })
                .await;
        }

        if plan.first_time_paid {
            self.run_paid_side_effects(order_id, signal).await;
        }

        info!(order_id = %order_id, new_status = %plan.new_status, "Order reconciled");
        Ok(ReconcileOutcome::Updated {
            order_id,
            new_status: plan.new_status,
            first_time_paid: plan.first_time_paid,
        })
    }

    /// Records payment identifiers even when the status does not move, so a
    /// later signal or an operator has the gateway references on file.
    async fn persist_payment_metadata(
        &self,
        order_id: Uuid,
        signal: &GatewaySignal,
    ) -> Result<(), ServiceError> {
        let payment_id = signal.effective_payment_id();
        let merchant_order_id = GatewaySignal::field(&signal.merchant_order_id);
        let payment_type = GatewaySignal::field(&signal.payment_type);
        if payment_id.is_none() && merchant_order_id.is_none() && payment_type.is_none() {
            return Ok(());
        }

        let db = &*self.db_pool;
        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id));
        if let Some(payment_id) = payment_id {
            update = update.col_expr(order::Column::PaymentId, Expr::value(Some(payment_id.to_string())));
        }
        if let Some(merchant_order_id) = merchant_order_id {
            update = update.col_expr(
                order::Column::MerchantOrderId,
                Expr::value(Some(merchant_order_id.to_string())),
            );
        }
        if let Some(payment_type) = payment_type {
            update = update.col_expr(order::Column::PaymentType, Expr::value(Some(payment_type.to_string())));
        }
        update
            .exec(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(())
    }

    /// Side effects of the first transition into `paid`: stock decrement and
    /// confirmation email. Failures are logged, never propagated; payment
    /// acceptance must not depend on them. Also used for manual paid
    /// transitions, with an empty signal.
    pub async fn run_paid_side_effects(&self, order_id: Uuid, signal: &GatewaySignal) {
        if let Some(sender) = &self.event_sender {
            sender
                .send(Event::OrderPaid {
                    order_id,
                    payment_id: signal.effective_payment_id().map(String::from),
                })
                .await;
        }

        match self.inventory.decrement_for_order(order_id).await {
            Ok(true) => {}
            Ok(false) => info!(order_id = %order_id, "Stock was already decremented"),
            Err(e) => error!(order_id = %order_id, error = %e, "Stock decrement failed after payment"),
        }

        if let Err(e) = self.send_confirmation(order_id).await {
            warn!(order_id = %order_id, error = %e, "Confirmation email failed");
            if let Some(sender) = &self.event_sender {
                sender
                    .send(Event::ConfirmationEmailFailed {
                        order_id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        } else if let Some(sender) = &self.event_sender {
            sender.send(Event::ConfirmationEmailSent { order_id }).await;
        }
    }

    async fn send_confirmation(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        let Some(to_email) = order.payer_email.clone() else {
            info!(order_id = %order_id, "No payer email on order; skipping confirmation");
            return Ok(());
        };

        let items = self.orders.get_order_items(order_id).await?;
        let email = ConfirmationEmail {
            order_id,
            to_email,
            payer_name: order.payer_name.clone(),
            lines: items
                .iter()
                .map(|item| ConfirmationLine {
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    subtotal: item.subtotal,
                })
                .collect(),
            total: order.total,
        };
        self.mailer.send_confirmation(&email).await
    }
}
