use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_status_history::{self, ActiveModel as HistoryActiveModel};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Lifecycle states of an order. Stored as snake_case strings in the
/// orders table; parse at the boundary, work with the enum everywhere else.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Rejected,
    Fulfilled,
    Cancelled,
    PendingMissingPreference,
}

impl OrderStatus {
    /// Terminal states never change again through reconciliation.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Fulfilled | OrderStatus::Cancelled)
    }

    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        Self::from_str(raw).map_err(|_| {
            ServiceError::InvalidStatus(format!("Unknown order status '{}'", raw))
        })
    }
}

/// Who initiated a status change; recorded in the history trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin,
    User,
    System,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Actor::Admin => "admin",
            Actor::User => "user",
            Actor::System => "system",
        }
    }
}

/// Outcome of planning a status transition before touching the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub new_status: OrderStatus,
    /// True only the first time an order reaches `paid`; gates the
    /// exactly-once side effects.
    pub first_time_paid: bool,
}

/// Decides whether `current -> target` is allowed for a manual (admin)
/// change. Reconciliation uses its own, looser rules.
pub fn admin_transition_allowed(current: OrderStatus, target: OrderStatus) -> bool {
    use OrderStatus::*;
    if current == target {
        return false;
    }
    match current {
        Pending => matches!(target, Paid | Fulfilled | Cancelled),
        Paid => matches!(target, Fulfilled | Cancelled | Pending),
        Rejected => matches!(target, Paid | Pending | Cancelled),
        PendingMissingPreference => matches!(target, Pending | Paid | Cancelled),
        Fulfilled | Cancelled => false,
    }
}

/// Plans a reconciliation transition. Returns `None` when the signal
/// should be ignored (no-op mapping, terminal order, or same status).
pub fn plan_transition(current: OrderStatus, target: OrderStatus) -> Option<TransitionPlan> {
    if current.is_terminal() || current == target {
        return None;
    }
    Some(TransitionPlan {
        new_status: target,
        first_time_paid: target == OrderStatus::Paid && current != OrderStatus::Paid,
    })
}

/// Service for order status transitions and their audit history.
#[derive(Clone)]
pub struct OrderStatusService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderStatusService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Manual status change with transition-table enforcement. Appends a
    /// history entry in the same transaction as the write.
    #[instrument(skip(self), fields(order_id = %order_id, target = %target))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for status update");
            ServiceError::DatabaseError(e)
        })?;

        let existing = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let current = OrderStatus::parse(&existing.status)?;
        if !admin_transition_allowed(current, target) {
            warn!(current = %current, "Rejected disallowed status transition");
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot change order from {} to {}",
                current, target
            )));
        }

        let previous_status = existing.status.clone();
        let mut active: order::ActiveModel = existing.into();
        active.status = Set(target.to_string());
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await.map_err(|e| {
            error!(error = %e, "Failed to update order status");
            ServiceError::DatabaseError(e)
        })?;

        append_history(&txn, order_id, Some(previous_status.clone()), target, actor, note).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit status update");
            ServiceError::DatabaseError(e)
        })?;

        if let Some(sender) = &self.event_sender {
            sender
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status: previous_status,
                    new_status: target.to_string(),
                    actor: actor.as_str().to_string(),
                })
                .await;
        }

        info!(new_status = %target, "Order status updated");
        Ok(updated)
    }

    /// History entries for an order, oldest first.
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        use sea_orm::QueryOrder;

        let db = &*self.db_pool;
        order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

/// Inserts a history row inside an existing transaction.
pub(crate) async fn append_history<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    previous_status: Option<String>,
    new_status: OrderStatus,
    actor: Actor,
    note: Option<String>,
) -> Result<(), ServiceError> {
    let entry = HistoryActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        previous_status: Set(previous_status),
        new_status: Set(new_status.to_string()),
        changed_by: Set(actor.as_str().to_string()),
        note: Set(note),
        created_at: Set(Utc::now()),
    };
    entry.insert(conn).await.map_err(|e| {
        error!(error = %e, "Failed to append status history");
        ServiceError::DatabaseError(e)
    })?;
    Ok(())
}
