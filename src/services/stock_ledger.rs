//! Stock Ledger
//!
//! Tracks on-hand versus reserved quantity per inventory unit. Every mutation
//! is a single conditional `UPDATE` so concurrent carts cannot oversell:
//!
//! * `reserve` increments `reserved_stock` only while `quantity >= reserved_stock + qty`
//! * `release` decrements `reserved_stock` by `min(qty, reserved_stock)`
//! * `commit` decrements `quantity` (and up to `qty` of `reserved_stock`) only
//!   while `quantity >= qty`

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, Query, SimpleExpr},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait, UpdateMany,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    cart, cart_item,
    inventory_unit::{self, Entity as InventoryUnitEntity},
    order::{self, OrderStatus},
    order_item,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Result of an availability check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Availability {
    pub unit_id: Uuid,
    pub sku: String,
    pub available_stock: i32,
    pub can_fulfill: bool,
}

/// Result of cleaning up expired reservations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Abandoned carts whose reservations were released.
    pub carts_released: u64,
    /// Order lines of stale unpaid orders whose reservations were released.
    pub order_lines_released: u64,
    /// Total units returned to availability.
    pub units_released: i64,
    /// Carts or lines another sweeper claimed first.
    pub skipped: u64,
    pub cleaned_at: DateTime<Utc>,
}

fn validate_quantity(qty: i32) -> Result<(), ServiceError> {
    if qty <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Quantity must be positive, got {}",
            qty
        )));
    }
    Ok(())
}

/// Resolves an inventory unit by primary id, falling back to SKU.
pub async fn resolve_unit<C: ConnectionTrait>(
    conn: &C,
    key: &str,
) -> Result<inventory_unit::Model, ServiceError> {
    if let Ok(id) = Uuid::parse_str(key) {
        if let Some(unit) = InventoryUnitEntity::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
        {
            return Ok(unit);
        }
    }

    InventoryUnitEntity::find()
        .filter(inventory_unit::Column::Sku.eq(key))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Inventory unit {} not found", key)))
}

/// `reserved_stock - qty`, floored at zero.
fn clamped_decrement(qty: i32) -> SimpleExpr {
    SimpleExpr::Case(Box::new(
        Expr::case(
            Expr::col(inventory_unit::Column::ReservedStock).gt(qty),
            Expr::col(inventory_unit::Column::ReservedStock).sub(qty),
        )
        .finally(0),
    ))
}

/// Atomically adds `qty` to the reservation of `unit_id`.
pub async fn reserve_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    qty: i32,
) -> Result<(), ServiceError> {
    validate_quantity(qty)?;

    let result = InventoryUnitEntity::update_many()
        .col_expr(
            inventory_unit::Column::ReservedStock,
            Expr::col(inventory_unit::Column::ReservedStock).add(qty),
        )
        .col_expr(inventory_unit::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory_unit::Column::Id.eq(unit_id))
        .filter(
            Expr::col(inventory_unit::Column::Quantity)
                .gte(Expr::col(inventory_unit::Column::ReservedStock).add(qty)),
        )
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        let unit = InventoryUnitEntity::find_by_id(unit_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Inventory unit {} not found", unit_id))
            })?;
        return Err(ServiceError::InsufficientStock(format!(
            "{}: requested {}, available {}",
            unit.sku,
            qty,
            unit.available_stock()
        )));
    }

    Ok(())
}

/// Attempts before a contended release gives up.
const RELEASE_ATTEMPTS: usize = 5;

/// Decrements the reservation of `unit_id` by `min(qty, reserved_stock)`.
/// Returns the amount actually released.
///
/// The update only applies while `reserved_stock` still holds the value the
/// amount was computed from, so the reported amount is exact even when
/// releases race.
pub async fn release_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    qty: i32,
) -> Result<i32, ServiceError> {
    validate_quantity(qty)?;

    for _ in 0..RELEASE_ATTEMPTS {
        let unit = InventoryUnitEntity::find_by_id(unit_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Inventory unit {} not found", unit_id)))?;

        let released = qty.min(unit.reserved_stock);
        if released <= 0 {
            return Ok(0);
        }

        let result = InventoryUnitEntity::update_many()
            .col_expr(
                inventory_unit::Column::ReservedStock,
                Expr::col(inventory_unit::Column::ReservedStock).sub(released),
            )
            .col_expr(inventory_unit::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(inventory_unit::Column::Id.eq(unit_id))
            .filter(inventory_unit::Column::ReservedStock.eq(unit.reserved_stock))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 1 {
            return Ok(released);
        }
        debug!(unit_id = %unit_id, "Reservation changed during release, retrying");
    }

    Err(ServiceError::ConcurrentModification(unit_id))
}

/// Consumes `qty` units that the caller holds a reservation for: decrements
/// `quantity` by `qty` and releases up to `qty` of `reserved_stock`.
/// Fails with `InsufficientStock` when `quantity < qty`, whatever is reserved.
pub async fn commit_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    qty: i32,
) -> Result<(), ServiceError> {
    validate_quantity(qty)?;

    let result = InventoryUnitEntity::update_many()
        .col_expr(
            inventory_unit::Column::Quantity,
            Expr::col(inventory_unit::Column::Quantity).sub(qty),
        )
        .col_expr(
            inventory_unit::Column::ReservedStock,
            clamped_decrement(qty),
        )
        .col_expr(inventory_unit::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory_unit::Column::Id.eq(unit_id))
        .filter(inventory_unit::Column::Quantity.gte(qty))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        return Err(insufficient_for_commit(conn, unit_id, qty).await);
    }
    Ok(())
}

/// Consumes `qty` units out of unreserved stock only, leaving every existing
/// reservation intact. Used for lines that never reserved (hybrid products,
/// lines whose reservation expired).
pub async fn commit_available_in<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    qty: i32,
) -> Result<(), ServiceError> {
    validate_quantity(qty)?;

    let result = InventoryUnitEntity::update_many()
        .col_expr(
            inventory_unit::Column::Quantity,
            Expr::col(inventory_unit::Column::Quantity).sub(qty),
        )
        .col_expr(inventory_unit::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory_unit::Column::Id.eq(unit_id))
        .filter(
            Expr::col(inventory_unit::Column::Quantity)
                .gte(Expr::col(inventory_unit::Column::ReservedStock).add(qty)),
        )
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        return Err(insufficient_for_commit(conn, unit_id, qty).await);
    }
    Ok(())
}

async fn insufficient_for_commit<C: ConnectionTrait>(
    conn: &C,
    unit_id: Uuid,
    qty: i32,
) -> ServiceError {
    match InventoryUnitEntity::find_by_id(unit_id).one(conn).await {
        Ok(Some(unit)) => ServiceError::InsufficientStock(format!(
            "{}: cannot commit {}, on hand {}, available {}",
            unit.sku,
            qty,
            unit.quantity,
            unit.available_stock()
        )),
        Ok(None) => ServiceError::NotFound(format!("Inventory unit {} not found", unit_id)),
        Err(e) => ServiceError::db_error(e),
    }
}

/// Service wrapping the ledger primitives with transactions, events and metrics.
#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl StockLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the unit's available stock and whether `qty` can be fulfilled.
    #[instrument(skip(self))]
    pub async fn check_availability(
        &self,
        unit_key: &str,
        qty: i32,
    ) -> Result<Availability, ServiceError> {
        let unit = resolve_unit(&*self.db, unit_key).await?;
        let available_stock = unit.available_stock();
        Ok(Availability {
            unit_id: unit.id,
            sku: unit.sku,
            available_stock,
            can_fulfill: available_stock >= qty,
        })
    }

    /// Reserves `qty` units. Never reserves partially.
    #[instrument(skip(self))]
    pub async fn reserve(&self, unit_key: &str, qty: i32) -> Result<(), ServiceError> {
        validate_quantity(qty)?;
        let unit = resolve_unit(&*self.db, unit_key).await?;

        // Cheap early rejection; the conditional update below is the real guard.
        if unit.available_stock() < qty {
            return Err(ServiceError::InsufficientStock(format!(
                "{}: requested {}, available {}",
                unit.sku,
                qty,
                unit.available_stock()
            )));
        }

        reserve_in(&*self.db, unit.id, qty).await?;
        counter!("storefront.stock.reserved", qty as u64);
        info!(unit_id = %unit.id, quantity = qty, "Stock reserved");

        self.event_sender
            .send_or_log(Event::StockReserved {
                unit_id: unit.id,
                quantity: qty,
            })
            .await;
        self.notify_if_low(unit.id).await;
        Ok(())
    }

    /// Releases up to `qty` reserved units; returns how many were released.
    #[instrument(skip(self))]
    pub async fn release(&self, unit_key: &str, qty: i32) -> Result<i32, ServiceError> {
        let unit = resolve_unit(&*self.db, unit_key).await?;
        let released = release_in(&*self.db, unit.id, qty).await?;

        if released < qty {
            debug!(
                unit_id = %unit.id,
                requested = qty,
                released,
                "Release clamped to current reservation"
            );
        }
        if released > 0 {
            counter!("storefront.stock.released", released as u64);
            self.event_sender
                .send_or_log(Event::StockReleased {
                    unit_id: unit.id,
                    quantity: released,
                })
                .await;
        }
        Ok(released)
    }

    /// Commits `qty` units against a held reservation inside one transaction.
    #[instrument(skip(self))]
    pub async fn commit(&self, unit_key: &str, qty: i32) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let unit = resolve_unit(&txn, unit_key).await?;
        commit_in(&txn, unit.id, qty).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("storefront.stock.committed", qty as u64);
        info!(unit_id = %unit.id, quantity = qty, "Stock committed");
        self.event_sender
            .send_or_log(Event::StockCommitted {
                unit_id: unit.id,
                quantity: qty,
            })
            .await;
        self.notify_if_low(unit.id).await;
        Ok(())
    }

    /// Emits `LowStock` when availability fell to the unit's threshold.
    pub async fn notify_if_low(&self, unit_id: Uuid) {
        match InventoryUnitEntity::find_by_id(unit_id).one(&*self.db).await {
            Ok(Some(unit)) if unit.available_stock() <= unit.low_stock_threshold => {
                self.event_sender
                    .send_or_log(Event::LowStock {
                        unit_id: unit.id,
                        available: unit.available_stock(),
                        threshold: unit.low_stock_threshold,
                        sku: unit.sku,
                    })
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(unit_id = %unit_id, error = %e, "Low stock check failed"),
        }
    }

    /// Releases the reservations of carts untouched for `max_age_hours` and
    /// of unpaid orders older than that.
    ///
    /// Each cart is claimed by flipping `processed` in the same transaction
    /// that releases its lines, so concurrent or repeated sweeps release a
    /// cart at most once.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_reservations(
        &self,
        max_age_hours: i64,
    ) -> Result<CleanupResult, ServiceError> {
        if max_age_hours <= 0 {
            return Err(ServiceError::ValidationError(
                "max_age_hours must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let cutoff = now - Duration::hours(max_age_hours);
        let mut result = CleanupResult {
            cleaned_at: now,
            ..Default::default()
        };

        let stale_carts = cart::Entity::find()
            .filter(cart::Column::Processed.eq(false))
            .filter(cart::Column::UpdatedAt.lt(cutoff))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        for stale in stale_carts {
            match self.release_cart(stale.id, now).await {
                Ok(Some(units)) => {
                    result.carts_released += 1;
                    result.units_released += units;
                    info!(cart_id = %stale.id, units, "Released abandoned cart reservation");
                }
                Ok(None) => result.skipped += 1,
                Err(e) => {
                    error!(cart_id = %stale.id, error = %e, "Failed to release cart reservation")
                }
            }
        }

        let stale_lines = order_item::Entity::find()
            .inner_join(order::Entity)
            .filter(order_item::Column::Reserved.eq(true))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        for line in stale_lines {
            match self.release_order_line(&line).await {
                Ok(Some(units)) => {
                    result.order_lines_released += 1;
                    result.units_released += units;
                }
                Ok(None) => result.skipped += 1,
                Err(e) => {
                    error!(order_item_id = %line.id, error = %e, "Failed to release order line")
                }
            }
        }

        counter!(
            "storefront.reservations.swept",
            result.carts_released + result.order_lines_released
        );
        info!(
            carts_released = result.carts_released,
            order_lines_released = result.order_lines_released,
            units_released = result.units_released,
            "Completed expired reservation cleanup"
        );

        if result.carts_released + result.order_lines_released > 0 {
            self.event_sender
                .send_or_log(Event::ReservationsSwept {
                    carts_released: result.carts_released + result.order_lines_released,
                    units_released: result.units_released,
                })
                .await;
        }

        Ok(result)
    }

    /// Claims and releases one cart. `None` when another caller got there first.
    async fn release_cart(
        &self,
        cart_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let claimed = cart::Entity::update_many()
            .col_expr(cart::Column::Processed, Expr::value(true))
            .col_expr(cart::Column::UpdatedAt, Expr::value(now))
            .filter(cart::Column::Id.eq(cart_id))
            .filter(cart::Column::Processed.eq(false))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if claimed.rows_affected != 1 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Ok(None);
        }

        let units = release_cart_lines_in(&txn, cart_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(Some(units))
    }

    async fn release_order_line(
        &self,
        line: &order_item::Model,
    ) -> Result<Option<i64>, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let released = release_unpaid_order_line_in(&txn, line).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(released)
    }
}

/// Releases every reserved line of a cart the caller has already claimed.
pub async fn release_cart_lines_in<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<i64, ServiceError> {
    let lines = cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .filter(cart_item::Column::Reserved.eq(true))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut units = 0i64;
    for line in &lines {
        units += release_in(conn, line.inventory_unit_id, line.quantity).await? as i64;
    }

    if !lines.is_empty() {
        cart_item::Entity::update_many()
            .col_expr(cart_item::Column::Reserved, Expr::value(false))
            .col_expr(cart_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
    }
    Ok(units)
}

/// Claims an order line's reservation flag and releases it.
/// `None` when the line no longer held a reservation.
pub async fn release_order_line_in<C: ConnectionTrait>(
    conn: &C,
    line: &order_item::Model,
) -> Result<Option<i64>, ServiceError> {
    let claim = order_item::Entity::update_many()
        .filter(order_item::Column::Id.eq(line.id))
        .filter(order_item::Column::Reserved.eq(true));
    release_claimed_line(conn, line, claim).await
}

/// Like [`release_order_line_in`], but only while the parent order is still
/// PENDING. A paid order keeps its reservation for fulfillment.
pub async fn release_unpaid_order_line_in<C: ConnectionTrait>(
    conn: &C,
    line: &order_item::Model,
) -> Result<Option<i64>, ServiceError> {
    let pending_orders = Query::select()
        .column(order::Column::Id)
        .from(order::Entity)
        .and_where(order::Column::Status.eq(OrderStatus::Pending))
        .to_owned();
    let claim = order_item::Entity::update_many()
        .filter(order_item::Column::Id.eq(line.id))
        .filter(order_item::Column::Reserved.eq(true))
        .filter(order_item::Column::OrderId.in_subquery(pending_orders));
    release_claimed_line(conn, line, claim).await
}

async fn release_claimed_line<C: ConnectionTrait>(
    conn: &C,
    line: &order_item::Model,
    claim: UpdateMany<order_item::Entity>,
) -> Result<Option<i64>, ServiceError> {
    let claimed = claim
        .col_expr(order_item::Column::Reserved, Expr::value(false))
        .col_expr(order_item::Column::UpdatedAt, Expr::value(Utc::now()))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if claimed.rows_affected != 1 {
        return Ok(None);
    }
    let released = release_in(conn, line.inventory_unit_id, line.quantity).await?;
    Ok(Some(released as i64))
}

/// Runs the reservation sweep on a fixed interval until the task is aborted.
pub fn spawn_reservation_sweeper(
    ledger: StockLedger,
    max_age_hours: i64,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Reservation sweeper started");

        loop {
            ticker.tick().await;
            if let Err(e) = ledger.cleanup_expired_reservations(max_age_hours).await {
                error!(error = %e, "Reservation sweep failed");
            }
        }
    })
}
