use crate::{
    config::PricingConfig,
    entities::{
        cart::{self, CartStatus},
        cart_item, cart_promotion,
        order::{self, Entity as OrderEntity, FulfillmentStatus, Model as OrderModel, OrderStatus},
        order_item::{self, Entity as OrderItemEntity, LineFulfillmentState},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::{load_lines_in, subtotal_of, CartLine},
        notifications::{Notifier, TrackingInfo},
        promotions::{evaluate_in, EvaluationRequest, PromotionEvaluation, PromotionRef},
        round_money,
        stock_ledger::release_order_line_in,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Shipping address captured at checkout and stored on the order as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub address1: String,
    pub address2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    /// ISO 3166-1 alpha-2
    #[validate(length(equal = 2))]
    pub country: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ShippingMethod {
    Standard,
    Express,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrderInput {
    pub cart_id: Uuid,
    pub user_id: Option<Uuid>,
    #[validate(email)]
    pub guest_email: Option<String>,
    #[validate]
    pub shipping_address: ShippingAddress,
    pub shipping_method: ShippingMethod,
    #[validate(length(min = 1, max = 32))]
    pub payment_method: String,
    /// Overrides the promotions attached to the cart
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateOrderStatusInput {
    pub status: OrderStatus,
    pub tracking: Option<TrackingInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

/// Tax on the discounted subtotal; standard shipping is free above the
/// threshold.
pub fn price_order(
    subtotal: Decimal,
    discount: Decimal,
    method: ShippingMethod,
    pricing: &PricingConfig,
) -> OrderTotals {
    let discount = discount.min(subtotal).max(Decimal::ZERO);
    let taxable = subtotal - discount;
    let tax = round_money(taxable * pricing.tax_rate);
    let shipping = match method {
        ShippingMethod::Standard if taxable >= pricing.free_shipping_threshold => Decimal::ZERO,
        ShippingMethod::Standard => pricing.standard_shipping,
        ShippingMethod::Express => pricing.express_shipping,
    };

    OrderTotals {
        subtotal,
        discount,
        tax,
        shipping,
        total: round_money(subtotal + tax + shipping - discount),
    }
}

/// Forward-only transitions; cancellation only before shipping.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Shipped)
            | (Shipped, Delivered)
            | (Pending, Cancelled)
            | (Processing, Cancelled)
    )
}

/// `ORD-YYYYMMDD-XXXXXXXX`
pub fn order_number(id: Uuid, now: DateTime<Utc>) -> String {
    let suffix: String = id.simple().to_string().chars().take(8).collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix.to_uppercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: OrderModel,
    pub items: Vec<order_item::Model>,
}

/// Finds the order or fails with `NotFound`.
pub async fn find_order<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<OrderModel, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

/// Order orchestration: checkout, status changes and lookups.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifier: Arc<dyn Notifier>,
    pricing: PricingConfig,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        notifier: Arc<dyn Notifier>,
        pricing: PricingConfig,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            event_sender,
            notifier,
            pricing,
            currency: currency.into(),
        }
    }

    /// Creates a PENDING order from a cart.
    ///
    /// The cart is claimed (`processed`, `converted`) in the same transaction
    /// that writes the order, so a cart converts at most once and the sweeper
    /// stops treating it as abandoned. Reservations move onto the order lines;
    /// on-hand stock is not touched until payment clears.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id))]
    pub async fn create_order(&self, input: CreateOrderInput) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        let now = Utc::now();

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let cart = cart::Entity::find_by_id(input.cart_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", input.cart_id)))?;

        let user_id = input.user_id.or(cart.user_id);
        let guest_email = input.guest_email.as_deref().map(|e| e.trim().to_lowercase());
        if user_id.is_none() && guest_email.is_none() {
            return Err(ServiceError::ValidationError(
                "guest_email is required for guest checkout".to_string(),
            ));
        }

        let lines = load_lines_in(&txn, cart.id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(format!("Cart {} is empty", cart.id)));
        }

        let claimed = cart::Entity::update_many()
            .col_expr(cart::Column::Processed, Expr::value(true))
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Converted))
            .col_expr(cart::Column::UpdatedAt, Expr::value(now))
            .filter(cart::Column::Id.eq(cart.id))
            .filter(cart::Column::Processed.eq(false))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected != 1 {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} was already checked out or has expired",
                cart.id
            )));
        }

        let subtotal = subtotal_of(&lines);
        let promotion = self
            .select_promotion(&txn, &input, &lines, subtotal, user_id, guest_email.clone(), now)
            .await?;
        let discount = promotion.as_ref().map(|p| p.discount).unwrap_or(Decimal::ZERO);
        let totals = price_order(subtotal, discount, input.shipping_method, &self.pricing);

        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number(order_id, now)),
            user_id: Set(user_id),
            guest_email: Set(guest_email),
            cart_id: Set(Some(cart.id)),
            status: Set(OrderStatus::Pending),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            subtotal: Set(totals.subtotal),
            tax_amount: Set(totals.tax),
            shipping_amount: Set(totals.shipping),
            discount_amount: Set(totals.discount),
            total_amount: Set(totals.total),
            currency: Set(self.currency.clone()),
            applied_promotion_id: Set(promotion.as_ref().map(|p| p.promotion_id)),
            coupon_code: Set(promotion.as_ref().and_then(|p| p.coupon_code.clone())),
            shipping_address: Set(serde_json::to_value(&input.shipping_address)?),
            shipping_method: Set(input.shipping_method.to_string()),
            payment_method: Set(input.payment_method.clone()),
            printify_order_id: Set(None),
            tracking_number: Set(None),
            tracking_url: Set(None),
            carrier: Set(None),
            shipped_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                inventory_unit_id: Set(line.inventory_unit_id),
                sku: Set(line.sku.clone()),
                product_name: Set(line.product_name.clone()),
                image_url: Set(line.image_url.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.line_total),
                fulfillment_type: Set(line.fulfillment_type),
                fulfillment_state: Set(LineFulfillmentState::Pending),
                reserved: Set(line.reserved),
                external_order_id: Set(None),
                last_error: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            items.push(item);
        }

        // The order lines own the reservations from here on
        cart_item::Entity::update_many()
            .col_expr(cart_item::Column::Reserved, Expr::value(false))
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("storefront.orders.created", 1);
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            "Order created"
        );
        self.event_sender.send_or_log(Event::OrderCreated(order.id)).await;

        Ok(OrderDetails { order, items })
    }

    /// Picks the promotion for the order: the explicit coupon when given,
    /// otherwise the cart promotion with the largest discount that still
    /// validates.
    #[allow(clippy::too_many_arguments)]
    async fn select_promotion<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: &CreateOrderInput,
        lines: &[CartLine],
        subtotal: Decimal,
        user_id: Option<Uuid>,
        guest_email: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<PromotionEvaluation>, ServiceError> {
        let request = |promotion: PromotionRef| EvaluationRequest {
            promotion,
            lines: lines.iter().map(CartLine::priced).collect(),
            subtotal,
            user_id,
            guest_email: guest_email.clone(),
            applied_promotion_ids: Vec::new(),
            now,
        };

        if let Some(code) = &input.coupon_code {
            return evaluate_in(conn, &request(PromotionRef::Code(code.clone())))
                .await
                .map(Some);
        }

        let attached = cart_promotion::Entity::find()
            .filter(cart_promotion::Column::CartId.eq(input.cart_id))
            .order_by_asc(cart_promotion::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut best: Option<PromotionEvaluation> = None;
        let mut first_error = None;
        for applied in attached {
            match evaluate_in(conn, &request(PromotionRef::Id(applied.promotion_id))).await {
                Ok(evaluation) => {
                    if best.as_ref().map_or(true, |b| evaluation.discount > b.discount) {
                        best = Some(evaluation);
                    }
                }
                Err(ServiceError::PromotionInvalid(reason)) => {
                    warn!(promotion_id = %applied.promotion_id, %reason, "Cart promotion no longer valid");
                    first_error.get_or_insert(reason);
                }
                Err(e) => return Err(e),
            }
        }

        match (best, first_error) {
            (Some(best), _) => Ok(Some(best)),
            (None, Some(reason)) => Err(reason.into()),
            (None, None) => Ok(None),
        }
    }

    /// Moves an order along its state machine.
    ///
    /// SHIPPED requires tracking data and notifies the customer. CANCELLED
    /// releases the reservations still held by unfulfilled lines in the
    /// same transaction as the status change; committed stock stays sold.
    /// Requesting the current status is a no-op.
    #[instrument(skip(self, input), fields(new_status = %input.status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        input: UpdateOrderStatusInput,
    ) -> Result<OrderModel, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        let from = order.status;
        let to = input.status;

        if from == to {
            return Ok(order);
        }
        if !is_valid_transition(from, to) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot move order {} from {} to {}",
                order.order_number, from, to
            )));
        }
        let tracking = match (to, input.tracking) {
            (OrderStatus::Shipped, Some(t)) if !t.tracking_number.trim().is_empty() => Some(t),
            (OrderStatus::Shipped, _) => {
                return Err(ServiceError::ValidationError(
                    "A tracking number is required to ship an order".to_string(),
                ))
            }
            (_, t) => t,
        };

        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(to))
            .col_expr(order::Column::UpdatedAt, Expr::value(now));
        if let (OrderStatus::Shipped, Some(t)) = (to, &tracking) {
            update = update
                .col_expr(order::Column::FulfillmentStatus, Expr::value(FulfillmentStatus::Shipped))
                .col_expr(order::Column::TrackingNumber, Expr::value(t.tracking_number.clone()))
                .col_expr(order::Column::Carrier, Expr::value(t.carrier.clone()))
                .col_expr(order::Column::TrackingUrl, Expr::value(t.tracking_url.clone()))
                .col_expr(order::Column::ShippedAt, Expr::value(Some(now)));
        }
        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(from))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let mut released = 0i64;
        if to == OrderStatus::Cancelled {
            let held = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .filter(order_item::Column::Reserved.eq(true))
                .all(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            for line in held.iter().filter(|l| !l.fulfillment_state.is_done()) {
                released += release_order_line_in(&txn, line).await?.unwrap_or(0);
            }
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        let updated = find_order(&*self.db, order_id).await?;

        info!(
            order_id = %order_id,
            old_status = %from,
            new_status = %to,
            released,
            "Order status updated"
        );
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: from.to_string(),
                new_status: to.to_string(),
            })
            .await;

        if let Some(tracking) = tracking.filter(|_| to == OrderStatus::Shipped) {
            if let Err(e) = self.notifier.order_shipped(&updated, &tracking).await {
                warn!(order_id = %order_id, error = %e, "Shipping notification failed");
            }
        }

        Ok(updated)
    }

    /// Returns the order with its line snapshots.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(OrderDetails { order, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn pricing() -> PricingConfig {
        PricingConfig {
            tax_rate: dec!(0.08),
            standard_shipping: dec!(5.99),
            express_shipping: dec!(14.99),
            free_shipping_threshold: dec!(75),
        }
    }

    #[test]
    fn totals_apply_discount_before_tax() {
        let totals = price_order(dec!(50.00), dec!(10.00), ShippingMethod::Standard, &pricing());
        assert_eq!(totals.tax, dec!(3.20));
        assert_eq!(totals.shipping, dec!(5.99));
        assert_eq!(totals.total, dec!(49.19));
    }

    #[test]
    fn standard_shipping_is_free_above_threshold() {
        let totals = price_order(dec!(100.00), Decimal::ZERO, ShippingMethod::Standard, &pricing());
        assert_eq!(totals.shipping, Decimal::ZERO);

        let express = price_order(dec!(100.00), Decimal::ZERO, ShippingMethod::Express, &pricing());
        assert_eq!(express.shipping, dec!(14.99));
    }

    #[test]
    fn discount_is_capped_at_subtotal() {
        let totals = price_order(dec!(20.00), dec!(35.00), ShippingMethod::Express, &pricing());
        assert_eq!(totals.discount, dec!(20.00));
        assert_eq!(totals.tax, Decimal::ZERO);
        assert_eq!(totals.total, dec!(14.99));
    }

    #[rstest]
    #[case(OrderStatus::Pending, OrderStatus::Processing, true)]
    #[case(OrderStatus::Processing, OrderStatus::Shipped, true)]
    #[case(OrderStatus::Shipped, OrderStatus::Delivered, true)]
    #[case(OrderStatus::Pending, OrderStatus::Cancelled, true)]
    #[case(OrderStatus::Processing, OrderStatus::Cancelled, true)]
    #[case(OrderStatus::Shipped, OrderStatus::Cancelled, false)]
    #[case(OrderStatus::Delivered, OrderStatus::Processing, false)]
    #[case(OrderStatus::Cancelled, OrderStatus::Pending, false)]
    #[case(OrderStatus::Pending, OrderStatus::Shipped, false)]
    fn state_machine_is_forward_only(
        #[case] from: OrderStatus,
        #[case] to: OrderStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(is_valid_transition(from, to), allowed);
    }

    #[test]
    fn order_numbers_embed_date_and_id_prefix() {
        let id = Uuid::parse_str("3f2a9c1e-0000-4000-8000-000000000000").unwrap();
        let when = Utc.with_ymd_and_hms(2025, 3, 9, 10, 0, 0).unwrap();
        assert_eq!(order_number(id, when), "ORD-20250309-3F2A9C1E");
    }

    #[test]
    fn shipping_method_parses_case_insensitively() {
        assert_eq!("EXPRESS".parse::<ShippingMethod>().unwrap(), ShippingMethod::Express);
        assert_eq!(ShippingMethod::Standard.to_string(), "standard");
    }
}
