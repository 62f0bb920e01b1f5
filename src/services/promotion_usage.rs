//! Promotion Usage Recorder
//!
//! Records, at most once per order, that the order consumed its promotion and
//! bumps the promotion's global counter. The unique `(order_id, promotion_id)`
//! index is the real guard; the existence check only saves a round trip.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{order, promotion, promotion_usage, user};
use crate::errors::{is_unique_violation, ServiceError};
use crate::events::{Event, EventSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// The order carries no promotion.
    NoPromotion,
    /// A usage row for this order already existed.
    AlreadyRecorded,
    Recorded,
}

/// Finds the user for `email`, creating a guest record when none exists.
/// Safe against concurrent callers racing on the unique email index.
pub async fn find_or_create_guest_user<C: ConnectionTrait>(
    conn: &C,
    email: &str,
) -> Result<user::Model, ServiceError> {
    let email = email.trim().to_lowercase();

    if let Some(existing) = user::Entity::find()
        .filter(user::Column::Email.eq(email.as_str()))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
    {
        return Ok(existing);
    }

    let inserted = user::ActiveModel {
        id: Set(Uuid::new_v4()),
        email: Set(email.clone()),
        name: Set(None),
        is_guest: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await;

    match inserted {
        Ok(model) => {
            info!(user_id = %model.id, "Created guest user");
            Ok(model)
        }
        Err(e) if is_unique_violation(&e) => user::Entity::find()
            .filter(user::Column::Email.eq(email.as_str()))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::InternalError(format!("guest user {} vanished", email))),
        Err(e) => Err(ServiceError::db_error(e)),
    }
}

#[derive(Clone)]
pub struct PromotionUsageRecorder {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl PromotionUsageRecorder {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Idempotently records the promotion consumed by `order_id`.
    #[instrument(skip(self))]
    pub async fn record_usage(&self, order_id: Uuid) -> Result<UsageOutcome, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let Some(promotion_id) = order.applied_promotion_id else {
            return Ok(UsageOutcome::NoPromotion);
        };

        if self.usage_exists(order_id, promotion_id).await? {
            return Ok(UsageOutcome::AlreadyRecorded);
        }

        let user_id = match (order.user_id, order.guest_email.as_deref()) {
            (Some(user_id), _) => user_id,
            (None, Some(email)) => find_or_create_guest_user(&*self.db, email).await?.id,
            (None, None) => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Order {} has neither a user nor a guest email",
                    order_id
                )))
            }
        };

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let inserted = promotion_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            promotion_id: Set(promotion_id),
            order_id: Set(order_id),
            user_id: Set(user_id),
            coupon_code: Set(order.coupon_code.clone()),
            discount_amount: Set(order.discount_amount),
            original_amount: Set(order.subtotal),
            final_amount: Set(order.total_amount),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                warn!(order_id = %order_id, "Concurrent promotion usage insert lost the race");
                return Ok(UsageOutcome::AlreadyRecorded);
            }
            Err(e) => return Err(ServiceError::db_error(e)),
        }

        promotion::Entity::update_many()
            .col_expr(
                promotion::Column::UsageCount,
                Expr::col(promotion::Column::UsageCount).add(1),
            )
            .col_expr(promotion::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promotion::Column::Id.eq(promotion_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("storefront.promotion.usage_recorded", 1);
        info!(
            order_id = %order_id,
            promotion_id = %promotion_id,
            user_id = %user_id,
            "Promotion usage recorded"
        );
        self.event_sender
            .send_or_log(Event::PromotionUsageRecorded {
                order_id,
                promotion_id,
                user_id,
            })
            .await;

        Ok(UsageOutcome::Recorded)
    }

    async fn usage_exists(&self, order_id: Uuid, promotion_id: Uuid) -> Result<bool, ServiceError> {
        Ok(promotion_usage::Entity::find()
            .filter(promotion_usage::Column::OrderId.eq(order_id))
            .filter(promotion_usage::Column::PromotionId.eq(promotion_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .is_some())
    }
}
