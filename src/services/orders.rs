use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, ActiveModel as OrderActiveModel, Entity as OrderEntity};
use crate::entities::order_item::{
    self, ActiveModel as OrderItemActiveModel, Entity as OrderItemEntity,
};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::order_status::{append_history, Actor, OrderStatus};

/// One cart line as submitted by the storefront. `product_id` may be a
/// product UUID or a SKU; the authoritative name and price are snapshotted
/// from the catalog at intake time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartItemInput {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "Cart must contain at least one item"))]
    pub items: Vec<CartItemInput>,
    pub total: Decimal,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub payer_name: Option<String>,
    #[serde(default)]
    pub payer_phone: Option<String>,
    /// Storefront session user id; accepted for forward compatibility but
    /// not persisted.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Intake result. `created` is false when an idempotency key matched an
/// existing order and the stored order was returned instead.
#[derive(Debug)]
pub struct OrderIntake {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub created: bool,
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a pending order with its line items in a single transaction.
    ///
    /// When the request carries an idempotency key that already exists, the
    /// stored order is returned unchanged and nothing is written. The unique
    /// index on the key closes the window between the pre-check and the
    /// insert.
    #[instrument(skip(self, request), fields(item_count = request.items.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderIntake, ServiceError> {
        request.validate()?;

        if let Some(user_id) = request.user_id.as_deref() {
            info!(%user_id, "Intake attributed to storefront user");
        }

        let idempotency_key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from);

        let db = &*self.db_pool;

        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                info!(order_id = %existing.order.id, "Idempotency key matched; returning existing order");
                return Ok(existing);
            }
        }

        let order_id = Uuid::new_v4();
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order intake");
            ServiceError::DatabaseError(e)
        })?;

        let mut total = Decimal::ZERO;
        let mut item_models = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = resolve_product(&txn, &item.product_id).await?.ok_or_else(|| {
                warn!(product_ref = %item.product_id, "Cart references unknown product");
                ServiceError::OrderError(format!(
                    "Product '{}' no longer exists",
                    item.product_id
                ))
            })?;

            let quantity = item.quantity.max(1);
            let subtotal = product.price * Decimal::from(quantity);
            total += subtotal;

            item_models.push(OrderItemActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                name: Set(product.name.clone()),
                sku: Set(Some(product.sku.clone())),
                unit_price: Set(product.price),
                quantity: Set(quantity),
                subtotal: Set(subtotal),
                created_at: Set(Utc::now()),
            });
        }

        if total != request.total {
            warn!(claimed = %request.total, computed = %total, "Cart total mismatch; using catalog prices");
        }

        let order_model = OrderActiveModel {
            id: Set(order_id),
            total: Set(total),
            status: Set(OrderStatus::Pending.to_string()),
            payer_email: Set(trimmed(request.payer_email.as_deref())),
            payer_name: Set(trimmed(request.payer_name.as_deref())),
            preference_id: Set(None),
            payment_id: Set(None),
            merchant_order_id: Set(None),
            payment_type: Set(None),
            stock_decremented: Set(false),
            idempotency_key: Set(idempotency_key.clone()),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };

        let insert_result = async {
            let order = order_model.insert(&txn).await?;
            let mut items = Vec::with_capacity(item_models.len());
            for item in item_models {
                items.push(item.insert(&txn).await?);
            }
            txn.commit().await?;
            Ok::<_, DbErr>((order, items))
        }
        .await;

        let (order, items) = match insert_result {
            Ok(pair) => pair,
            Err(e) if is_unique_violation(&e) => {
                // Lost the race against a concurrent request with the same key.
                if let Some(key) = &idempotency_key {
                    if let Some(existing) = self.find_by_idempotency_key(key).await? {
                        info!(order_id = %existing.order.id, "Concurrent duplicate intake; returning existing order");
                        return Ok(existing);
                    }
                }
                return Err(ServiceError::DatabaseError(e));
            }
            Err(e) => {
                error!(error = %e, "Failed to insert order");
                return Err(ServiceError::DatabaseError(e));
            }
        };

        if let Some(sender) = &self.event_sender {
            sender
                .send(Event::OrderCreated {
                    order_id: order.id,
                    total: order.total,
                    idempotent_replay: false,
                })
                .await;
        }

        info!(order_id = %order.id, total = %order.total, "Order created");
        Ok(OrderIntake {
            order,
            items,
            created: true,
        })
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OrderIntake>, ServiceError> {
        let db = &*self.db_pool;
        let Some(order) = OrderEntity::find()
            .filter(order::Column::IdempotencyKey.eq(key))
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
        else {
            return Ok(None);
        };
        let items = self.get_order_items(order.id).await?;
        Ok(Some(OrderIntake {
            order,
            items,
            created: false,
        }))
    }

    /// Stores the gateway preference id on the order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_preference(
        &self,
        order_id: Uuid,
        preference_id: &str,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let existing = self.get_order(order_id).await?;
        let mut active: order::ActiveModel = existing.into();
        active.preference_id = Set(Some(preference_id.to_string()));
        active.updated_at = Set(Some(Utc::now()));
        active.update(db).await.map_err(|e| {
            error!(error = %e, "Failed to persist preference id");
            ServiceError::DatabaseError(e)
        })
    }

    /// Compensation for a failed preference step: flags the order so it is
    /// visible in admin tooling and excluded from normal pending flows.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_preference_missing(
        &self,
        order_id: Uuid,
        note: &str,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let existing = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let previous = existing.status.clone();
        let mut active: order::ActiveModel = existing.into();
        active.status = Set(OrderStatus::PendingMissingPreference.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await.map_err(|e| {
            error!(error = %e, "Failed to flag order as missing preference");
            ServiceError::DatabaseError(e)
        })?;

        append_history(
            &txn,
            order_id,
            Some(previous),
            OrderStatus::PendingMissingPreference,
            Actor::System,
            Some(note.to_string()),
        )
        .await?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if let Some(sender) = &self.event_sender {
            sender.send(Event::PreferenceFailed { order_id }).await;
        }
        warn!("Order flagged as pending_missing_preference");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_order_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        let db = &*self.db_pool;
        OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Newest-first page of orders plus the total row count.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let db = &*self.db_pool;
        let per_page = per_page.clamp(1, 100);
        let paginator = OrderEntity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let page_index = page.saturating_sub(1);
        let orders = paginator
            .fetch_page(page_index)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok((orders, total))
    }
}

/// Looks a product up by UUID first, then by SKU.
async fn resolve_product<C: sea_orm::ConnectionTrait>(
    conn: &C,
    reference: &str,
) -> Result<Option<product::Model>, ServiceError> {
    let reference = reference.trim();
    if let Ok(id) = Uuid::parse_str(reference) {
        if let Some(found) = ProductEntity::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?
        {
            return Ok(Some(found));
        }
    }
    ProductEntity::find()
        .filter(product::Column::Sku.eq(reference))
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn is_unique_violation(err: &DbErr) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("unique") || text.contains("duplicate key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cart_fails_validation() {
        let request = CreateOrderRequest {
            items: vec![],
            total: Decimal::ZERO,
            payer_email: None,
            payer_name: None,
            payer_phone: None,
            user_id: None,
            idempotency_key: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn unique_violation_detection_covers_both_backends() {
        let sqlite = DbErr::Custom("UNIQUE constraint failed: orders.idempotency_key".into());
        let postgres = DbErr::Custom(
            "duplicate key value violates unique constraint \"idx-orders-idempotency-key\"".into(),
        );
        let other = DbErr::Custom("connection reset".into());
        assert!(is_unique_violation(&sqlite));
        assert!(is_unique_violation(&postgres));
        assert!(!is_unique_violation(&other));
    }

    #[test]
    fn trimmed_drops_blank_values() {
        assert_eq!(trimmed(Some("  ana@example.com ")), Some("ana@example.com".to_string()));
        assert_eq!(trimmed(Some("   ")), None);
        assert_eq!(trimmed(None), None);
    }
}
