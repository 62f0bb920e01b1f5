use crate::{
    entities::{
        cart::{self, CartStatus, Entity as Cart, Model as CartModel},
        cart_item::{self, Entity as CartItem},
        cart_promotion::{self, Entity as CartPromotion},
        inventory_unit,
        product::{self, FulfillmentType},
    },
    errors::{is_unique_violation, PromotionError, ServiceError},
    events::{Event, EventSender},
    services::{
        promotions::{evaluate_in, EvaluationRequest, PricedLine, PromotionEvaluation, PromotionRef},
        round_money,
        stock_ledger::{release_in, reserve_in, resolve_unit, StockLedger},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateCartInput {
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    /// Inventory unit id or SKU
    #[validate(length(min = 1, max = 64))]
    pub unit: String,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

/// Who is applying a promotion or checking out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
}

/// A cart line joined with its product and unit, priced at the live catalog price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub item_id: Uuid,
    pub product_id: Uuid,
    pub inventory_unit_id: Uuid,
    pub sku: String,
    pub product_name: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    pub fulfillment_type: FulfillmentType,
    pub reserved: bool,
}

impl CartLine {
    pub fn priced(&self) -> PricedLine {
        PricedLine {
            product_id: self.product_id,
            category: self.category.clone(),
            unit_price: self.unit_price,
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<CartLine>,
    pub promotions: Vec<cart_promotion::Model>,
    pub subtotal: Decimal,
    /// Sum of the applied discounts, capped at the subtotal
    pub discount_total: Decimal,
}

/// Sums line totals.
pub fn subtotal_of(lines: &[CartLine]) -> Decimal {
    round_money(lines.iter().map(|l| l.line_total).sum())
}

/// Loads a cart's lines with their products and inventory units.
pub async fn load_lines_in<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<CartLine>, ServiceError> {
    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
    let unit_ids: Vec<Uuid> = items.iter().map(|i| i.inventory_unit_id).collect();

    let products: HashMap<Uuid, product::Model> = product::Entity::find()
        .filter(product::Column::Id.is_in(product_ids))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();
    let units: HashMap<Uuid, inventory_unit::Model> = inventory_unit::Entity::find()
        .filter(inventory_unit::Column::Id.is_in(unit_ids))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();

    items
        .into_iter()
        .map(|item| {
            let product = products.get(&item.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
            let unit = units.get(&item.inventory_unit_id).ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Inventory unit {} not found",
                    item.inventory_unit_id
                ))
            })?;
            Ok(CartLine {
                item_id: item.id,
                product_id: product.id,
                inventory_unit_id: unit.id,
                sku: unit.sku.clone(),
                product_name: product.name.clone(),
                category: product.category.clone(),
                image_url: product.image_url.clone(),
                unit_price: product.price,
                quantity: item.quantity,
                line_total: round_money(product.price * Decimal::from(item.quantity)),
                fulfillment_type: product.fulfillment_type,
                reserved: item.reserved,
            })
        })
        .collect()
}

async fn find_cart<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<CartModel, ServiceError> {
    Cart::find_by_id(cart_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))
}

fn ensure_mutable(cart: &CartModel) -> Result<(), ServiceError> {
    if cart.status != CartStatus::Active {
        return Err(ServiceError::InvalidOperation(format!(
            "Cart {} has already been checked out",
            cart.id
        )));
    }
    if cart.processed {
        return Err(ServiceError::InvalidOperation(format!(
            "Cart {} expired and its reservations were released",
            cart.id
        )));
    }
    Ok(())
}

/// Shopping cart service.
///
/// The `CartService` drives the stock ledger from the storefront:
/// - Adding a local-inventory item reserves its quantity in the same
///   transaction that writes the cart line
/// - Removing a line releases whatever it still holds
/// - Promotions are evaluated on apply but never touch usage counters
///
/// # Examples
///
/// ```ignore
/// let cart = cart_service.create_cart(CreateCartInput::default()).await?;
/// let cart = cart_service
///     .add_item(cart.id, AddToCartInput { product_id, unit: "MUG-RED".into(), quantity: 2 })
///     .await?;
/// ```
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    ledger: StockLedger,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `ledger` - Stock ledger used for low-stock notifications
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>, ledger: StockLedger) -> Self {
        Self {
            db,
            event_sender,
            ledger,
        }
    }

    /// Creates an empty cart owned by a user or an anonymous session.
    ///
    /// Publishes a `CartCreated` event upon success.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<CartModel, ServiceError> {
        input.validate()?;
        if input.user_id.is_none() && input.session_id.is_none() {
            return Err(ServiceError::ValidationError(
                "A cart needs a user_id or a session_id".to_string(),
            ));
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(input.user_id),
            session_id: Set(input.session_id),
            status: Set(CartStatus::Active),
            processed: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        self.event_sender.send_or_log(Event::CartCreated(cart.id)).await;
        info!(cart_id = %cart.id, "Created cart");
        Ok(cart)
    }

    /// Adds an item to the cart or increases the quantity of its line.
    ///
    /// Local-inventory products reserve the added quantity; print-on-demand
    /// and hybrid products never reserve. The reservation and the line
    /// write share one transaction, so a failed reservation leaves the cart
    /// untouched.
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - The cart after the change
    /// * `Err(ServiceError::NotFound)` - Cart, product or unit not found
    /// * `Err(ServiceError::InsufficientStock)` - Not enough available stock
    /// * `Err(ServiceError::InvalidOperation)` - Cart was checked out or expired
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartWithItems, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let cart = find_cart(&txn, cart_id).await?;
        ensure_mutable(&cart)?;

        let product = product::Entity::find_by_id(input.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", input.product_id)))?;

        let unit = resolve_unit(&txn, &input.unit).await?;
        if unit.product_id != product.id {
            return Err(ServiceError::ValidationError(format!(
                "Unit {} does not belong to product {}",
                unit.sku, product.id
            )));
        }

        let reserve = product.fulfillment_type == FulfillmentType::LocalInventory;
        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::InventoryUnitId.eq(unit.id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        let (held_before, new_quantity) = match &existing {
            Some(item) => (if item.reserved { item.quantity } else { 0 }, item.quantity + input.quantity),
            None => (0, input.quantity),
        };
        let held_after = if reserve { new_quantity } else { 0 };

        // Only the difference touches the ledger
        let delta = held_after - held_before;
        if delta > 0 {
            reserve_in(&txn, unit.id, delta).await?;
        } else if delta < 0 {
            release_in(&txn, unit.id, -delta).await?;
        }

        match existing {
            Some(item) => {
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(new_quantity);
                item.reserved = Set(reserve);
                item.updated_at = Set(now);
                item.update(&txn).await.map_err(ServiceError::db_error)?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(product.id),
                    inventory_unit_id: Set(unit.id),
                    quantity: Set(input.quantity),
                    reserved: Set(reserve),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            }
        }

        touch_cart(&txn, cart_id, now).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if delta > 0 {
            self.event_sender
                .send_or_log(Event::StockReserved {
                    unit_id: unit.id,
                    quantity: delta,
                })
                .await;
            self.ledger.notify_if_low(unit.id).await;
        }

        info!(
            cart_id = %cart_id,
            sku = %unit.sku,
            quantity = input.quantity,
            reserved = reserve,
            "Added item to cart"
        );
        self.get_cart(cart_id).await
    }

    /// Removes a line and releases the stock it still holds.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, cart_id: Uuid, item_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let cart = find_cart(&txn, cart_id).await?;
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been checked out",
                cart_id
            )));
        }

        let item = CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart_id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        let released = if item.reserved {
            release_in(&txn, item.inventory_unit_id, item.quantity).await?
        } else {
            0
        };

        CartItem::delete_by_id(item.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        touch_cart(&txn, cart_id, Utc::now()).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if released > 0 {
            self.event_sender
                .send_or_log(Event::StockReleased {
                    unit_id: item.inventory_unit_id,
                    quantity: released,
                })
                .await;
        }
        info!(cart_id = %cart_id, item_id = %item_id, released, "Removed cart item");
        self.get_cart(cart_id).await
    }

    /// Evaluates a promotion against the cart without attaching it.
    #[instrument(skip(self, identity))]
    pub async fn preview_promotion(
        &self,
        cart_id: Uuid,
        promotion: PromotionRef,
        identity: CustomerIdentity,
        now: DateTime<Utc>,
    ) -> Result<PromotionEvaluation, ServiceError> {
        let cart = find_cart(&*self.db, cart_id).await?;
        self.evaluate_for_cart(&cart, promotion, identity, now).await
    }

    /// Validates a promotion against the cart and attaches it.
    ///
    /// The `(cart, promotion)` unique index backs `AlreadyApplied` when two
    /// requests race past the evaluator.
    #[instrument(skip(self, identity))]
    pub async fn apply_promotion(
        &self,
        cart_id: Uuid,
        promotion: PromotionRef,
        identity: CustomerIdentity,
        now: DateTime<Utc>,
    ) -> Result<PromotionEvaluation, ServiceError> {
        let cart = find_cart(&*self.db, cart_id).await?;
        ensure_mutable(&cart)?;
        let evaluation = self.evaluate_for_cart(&cart, promotion, identity, now).await?;

        let inserted = cart_promotion::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart_id),
            promotion_id: Set(evaluation.promotion_id),
            coupon_code: Set(evaluation.coupon_code.clone()),
            discount_amount: Set(evaluation.discount),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(PromotionError::AlreadyApplied.into());
            }
            Err(e) => return Err(ServiceError::db_error(e)),
        }

        self.event_sender
            .send_or_log(Event::PromotionApplied {
                cart_id,
                promotion_id: evaluation.promotion_id,
                discount: evaluation.discount,
            })
            .await;
        info!(
            cart_id = %cart_id,
            promotion_id = %evaluation.promotion_id,
            discount = %evaluation.discount,
            "Applied promotion to cart"
        );
        Ok(evaluation)
    }

    /// Detaches a promotion. Usage counters are not involved.
    #[instrument(skip(self))]
    pub async fn remove_promotion(&self, cart_id: Uuid, promotion_id: Uuid) -> Result<(), ServiceError> {
        let result = CartPromotion::delete_many()
            .filter(cart_promotion::Column::CartId.eq(cart_id))
            .filter(cart_promotion::Column::PromotionId.eq(promotion_id))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Promotion {} is not applied to cart {}",
                promotion_id, cart_id
            )));
        }
        info!(cart_id = %cart_id, promotion_id = %promotion_id, "Removed promotion from cart");
        Ok(())
    }

    /// Retrieves a cart with live-priced lines and applied promotions.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = find_cart(&*self.db, cart_id).await?;
        let items = load_lines_in(&*self.db, cart_id).await?;
        let promotions = CartPromotion::find()
            .filter(cart_promotion::Column::CartId.eq(cart_id))
            .order_by_asc(cart_promotion::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let subtotal = subtotal_of(&items);
        let discount_total = promotions
            .iter()
            .map(|p| p.discount_amount)
            .sum::<Decimal>()
            .min(subtotal);

        Ok(CartWithItems {
            cart,
            items,
            promotions,
            subtotal,
            discount_total,
        })
    }

    async fn evaluate_for_cart(
        &self,
        cart: &CartModel,
        promotion: PromotionRef,
        identity: CustomerIdentity,
        now: DateTime<Utc>,
    ) -> Result<PromotionEvaluation, ServiceError> {
        let lines = load_lines_in(&*self.db, cart.id).await?;
        let applied = CartPromotion::find()
            .filter(cart_promotion::Column::CartId.eq(cart.id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let request = EvaluationRequest {
            promotion,
            subtotal: subtotal_of(&lines),
            lines: lines.iter().map(CartLine::priced).collect(),
            user_id: identity.user_id.or(cart.user_id),
            guest_email: identity.guest_email,
            applied_promotion_ids: applied.iter().map(|p| p.promotion_id).collect(),
            now,
        };
        evaluate_in(&*self.db, &request).await
    }

    /// Deletes a cart's rows without touching stock. Called once payment
    /// has cleared and the order owns its lines.
    #[instrument(skip(self))]
    pub async fn delete_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        CartPromotion::delete_many()
            .filter(cart_promotion::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let deleted = Cart::delete_by_id(cart_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Cart {} not found", cart_id)));
        }
        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(cart_id = %cart_id, "Deleted cart");
        Ok(())
    }
}

async fn touch_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    Cart::update_many()
        .col_expr(cart::Column::UpdatedAt, Expr::value(now))
        .filter(cart::Column::Id.eq(cart_id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn cart(status: CartStatus, processed: bool) -> CartModel {
        CartModel {
            id: Uuid::new_v4(),
            user_id: None,
            session_id: Some("s-1".into()),
            status,
            processed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn only_active_unprocessed_carts_are_mutable() {
        assert!(ensure_mutable(&cart(CartStatus::Active, false)).is_ok());
        assert_matches!(
            ensure_mutable(&cart(CartStatus::Active, true)),
            Err(ServiceError::InvalidOperation(_))
        );
        assert_matches!(
            ensure_mutable(&cart(CartStatus::Converted, true)),
            Err(ServiceError::InvalidOperation(_))
        );
    }

    #[test]
    fn subtotal_sums_line_totals() {
        let line = |total| CartLine {
            item_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            inventory_unit_id: Uuid::new_v4(),
            sku: "SKU".into(),
            product_name: "Mug".into(),
            category: None,
            image_url: None,
            unit_price: total,
            quantity: 1,
            line_total: total,
            fulfillment_type: FulfillmentType::LocalInventory,
            reserved: true,
        };
        assert_eq!(subtotal_of(&[line(dec!(12.50)), line(dec!(7.25))]), dec!(19.75));
        assert_eq!(subtotal_of(&[]), Decimal::ZERO);
    }
}
