use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Service for catalog stock adjustments driven by the order lifecycle.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Decrements stock for every line item of an order, at most once per
    /// order lifetime.
    ///
    /// The `stock_decremented` flag on the order is read and flipped inside
    /// the same transaction as the stock writes, so a duplicate call (late
    /// webhook, admin re-mark) returns `false` without touching the catalog.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn decrement_for_order(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for stock decrement");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.stock_decremented {
            info!("Stock already decremented for this order; skipping");
            return Ok(false);
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        for item in &items {
            let Some(found) = ProductEntity::find_by_id(item.product_id)
                .one(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?
            else {
                warn!(product_id = %item.product_id, "Product missing during stock decrement; skipping line");
                continue;
            };

            let new_stock = found.stock - item.quantity;
            if new_stock < 0 {
                warn!(
                    product_id = %found.id,
                    stock = found.stock,
                    quantity = item.quantity,
                    "Stock went negative; oversold"
                );
            }
            let mut active: product::ActiveModel = found.into();
            active.stock = Set(new_stock);
            active.updated_at = Set(Some(Utc::now()));
            active.update(&txn).await.map_err(|e| {
                error!(error = %e, "Failed to write stock decrement");
                ServiceError::DatabaseError(e)
            })?;
        }

        let mut order_active: order::ActiveModel = order.into();
        order_active.stock_decremented = Set(true);
        order_active.updated_at = Set(Some(Utc::now()));
        order_active.update(&txn).await.map_err(|e| {
            error!(error = %e, "Failed to flag order stock_decremented");
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock decrement");
            ServiceError::DatabaseError(e)
        })?;

        if let Some(sender) = &self.event_sender {
            sender.send(Event::StockDecremented { order_id }).await;
        }
        info!(line_count = items.len(), "Stock decremented for order");
        Ok(true)
    }
}
