//! Fulfillment Dispatcher
//!
//! Routes every line of a paid order by its fulfillment type:
//!
//! * `LOCAL_INVENTORY` commits stock through the ledger
//! * `PRINTIFY_POD` is submitted to the print-on-demand provider
//! * `HYBRID` commits from unreserved local stock and falls back to the
//!   provider when there is not enough
//!
//! Lines are processed independently. A line that reached `COMMITTED` or
//! `SUBMITTED` is never processed again, which makes reprocessing a whole
//! order safe.

use futures::future::join_all;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        inventory_unit,
        order::{self, FulfillmentStatus, Model as OrderModel, OrderStatus},
        order_item::{self, LineFulfillmentState, Model as OrderItemModel},
        product::{self, FulfillmentType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{FulfillmentProvider, PodAddress, PodLineItem, PodOrderRequest},
    services::{
        orders::{find_order, OrderService, ShippingAddress, UpdateOrderStatusInput},
        stock_ledger::{commit_available_in, commit_in, StockLedger},
    },
};

/// A line's `reserved` flag can flip at most once, so two reads settle it.
const CLAIM_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_id: Uuid,
    pub sku: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentReport {
    pub order_id: Uuid,
    pub fulfillment_status: FulfillmentStatus,
    pub committed: Vec<Uuid>,
    pub submitted: Vec<Uuid>,
    /// Lines already fulfilled by an earlier run
    pub skipped: Vec<Uuid>,
    pub failed: Vec<FailedItem>,
    pub printify_order_id: Option<String>,
}

impl FulfillmentReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
enum LocalOutcome {
    Committed,
    /// Not enough unreserved stock for a hybrid line
    Fallback,
    /// Another run already claimed the line
    Skipped,
    Failed(String),
}

#[derive(Debug)]
enum PodOutcome {
    Submitted(String),
    Skipped,
    Failed(String),
}

#[derive(Clone)]
pub struct FulfillmentDispatcher {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    ledger: StockLedger,
    provider: Arc<dyn FulfillmentProvider>,
    orders: OrderService,
}

impl FulfillmentDispatcher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        ledger: StockLedger,
        provider: Arc<dyn FulfillmentProvider>,
        orders: OrderService,
    ) -> Self {
        Self {
            db,
            event_sender,
            ledger,
            provider,
            orders,
        }
    }

    /// Fulfils every outstanding line of a paid order.
    ///
    /// The order ends `PROCESSING` when no line failed and `FAILED`
    /// otherwise; failed lines are listed in the report and stay retryable.
    #[instrument(skip(self))]
    pub async fn process_order(&self, order_id: Uuid) -> Result<FulfillmentReport, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.status != OrderStatus::Processing {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is {} and cannot be fulfilled",
                order.order_number, order.status
            )));
        }
        let address: ShippingAddress = serde_json::from_value(order.shipping_address.clone())?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut report = FulfillmentReport {
            order_id,
            fulfillment_status: FulfillmentStatus::Processing,
            committed: Vec::new(),
            submitted: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            printify_order_id: order.printify_order_id.clone(),
        };

        let (done, outstanding): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|i| i.fulfillment_state.is_done());
        report.skipped.extend(done.iter().map(|i| i.id));

        let (local, mut pod): (Vec<_>, Vec<_>) = outstanding
            .into_iter()
            .partition(|i| i.fulfillment_type != FulfillmentType::PrintifyPod);

        let local_outcomes = join_all(local.iter().map(|item| self.fulfill_local(item))).await;
        for (item, outcome) in local.into_iter().zip(local_outcomes) {
            match outcome {
                LocalOutcome::Committed => report.committed.push(item.id),
                LocalOutcome::Skipped => report.skipped.push(item.id),
                LocalOutcome::Fallback => pod.push(item),
                LocalOutcome::Failed(reason) => report.failed.push(FailedItem {
                    item_id: item.id,
                    sku: item.sku.clone(),
                    reason,
                }),
            }
        }

        let pod_outcomes = join_all(pod.iter().map(|item| self.submit_pod(&order, &address, item))).await;
        for (item, outcome) in pod.into_iter().zip(pod_outcomes) {
            match outcome {
                PodOutcome::Submitted(external_id) => {
                    report.submitted.push(item.id);
                    report.printify_order_id.get_or_insert(external_id);
                }
                PodOutcome::Skipped => report.skipped.push(item.id),
                PodOutcome::Failed(reason) => report.failed.push(FailedItem {
                    item_id: item.id,
                    sku: item.sku.clone(),
                    reason,
                }),
            }
        }

        for failed in &report.failed {
            self.mark_failed(failed).await?;
        }

        report.fulfillment_status = if report.is_complete() {
            FulfillmentStatus::Processing
        } else {
            FulfillmentStatus::Failed
        };

        order::Entity::update_many()
            .col_expr(order::Column::FulfillmentStatus, Expr::value(report.fulfillment_status))
            .col_expr(order::Column::PrintifyOrderId, Expr::value(report.printify_order_id.clone()))
            .col_expr(order::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if report.is_complete() {
            info!(
                order_id = %order_id,
                committed = report.committed.len(),
                submitted = report.submitted.len(),
                skipped = report.skipped.len(),
                "Order fulfillment dispatched"
            );
            self.event_sender
                .send_or_log(Event::FulfillmentCompleted(order_id))
                .await;
        } else {
            counter!("storefront.fulfillment.failed_items", report.failed.len() as u64);
            warn!(
                order_id = %order_id,
                failed = report.failed.len(),
                "Order fulfillment partially failed"
            );
            self.event_sender
                .send_or_log(Event::FulfillmentFailed {
                    order_id,
                    failed_items: report.failed.iter().map(|f| f.item_id).collect(),
                })
                .await;
        }

        Ok(report)
    }

    /// Resets a failed order and reprocesses it. Lines fulfilled by the
    /// earlier run are skipped.
    #[instrument(skip(self))]
    pub async fn retry_failed_fulfillment(
        &self,
        order_id: Uuid,
    ) -> Result<FulfillmentReport, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.fulfillment_status != FulfillmentStatus::Failed {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} fulfillment is {}, only FAILED can be retried",
                order.order_number, order.fulfillment_status
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let reset = order::Entity::update_many()
            .col_expr(order::Column::FulfillmentStatus, Expr::value(FulfillmentStatus::Pending))
            .col_expr(order::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::FulfillmentStatus.eq(FulfillmentStatus::Failed))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if reset.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }
        order_item::Entity::update_many()
            .col_expr(order_item::Column::FulfillmentState, Expr::value(LineFulfillmentState::Pending))
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::FulfillmentState.eq(LineFulfillmentState::Failed))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, "Retrying order fulfillment");
        self.process_order(order_id).await
    }

    /// Pulls provider status for the order's print-on-demand submissions and
    /// ships the order once every submission reports tracking.
    #[instrument(skip(self))]
    pub async fn sync_tracking(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.status != OrderStatus::Processing {
            return Ok(order);
        }

        let mut external_ids: Vec<String> = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::FulfillmentState.eq(LineFulfillmentState::Submitted))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .filter_map(|i| i.external_order_id)
            .collect();
        external_ids.sort();
        external_ids.dedup();

        if external_ids.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} has no print-on-demand submissions",
                order.order_number
            )));
        }

        let mut tracking = None;
        for external_id in &external_ids {
            let status = self.provider.get_order_status(external_id).await?;
            if !status.is_shipped() {
                info!(order_id = %order_id, external_id = %external_id, status = %status.status, "Submission not shipped yet");
                return Ok(order);
            }
            if tracking.is_none() {
                tracking = status.tracking;
            }
        }

        self.orders
            .update_order_status(
                order_id,
                UpdateOrderStatusInput {
                    status: OrderStatus::Shipped,
                    tracking,
                },
            )
            .await
    }

    async fn fulfill_local(&self, item: &OrderItemModel) -> LocalOutcome {
        match self.try_commit(item).await {
            Ok(true) => {
                counter!("storefront.stock.committed", item.quantity as u64);
                self.event_sender
                    .send_or_log(Event::StockCommitted {
                        unit_id: item.inventory_unit_id,
                        quantity: item.quantity,
                    })
                    .await;
                self.ledger.notify_if_low(item.inventory_unit_id).await;
                LocalOutcome::Committed
            }
            Ok(false) => LocalOutcome::Skipped,
            Err(ServiceError::InsufficientStock(reason))
                if item.fulfillment_type == FulfillmentType::Hybrid =>
            {
                info!(item_id = %item.id, %reason, "Hybrid line falls back to print-on-demand");
                LocalOutcome::Fallback
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Local commit failed");
                LocalOutcome::Failed(e.to_string())
            }
        }
    }

    /// Claims the line and commits its stock in one transaction. `false`
    /// when the line was already claimed.
    ///
    /// The claim is conditional on the `reserved` flag it was read with, so
    /// a sweep that released the line in between is never consumed twice.
    async fn try_commit(&self, item: &OrderItemModel) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let mut reserved = item.reserved;
        let mut claimed = false;
        for _ in 0..CLAIM_ATTEMPTS {
            let result = order_item::Entity::update_many()
                .col_expr(order_item::Column::FulfillmentState, Expr::value(LineFulfillmentState::Committed))
                .col_expr(order_item::Column::Reserved, Expr::value(false))
                .col_expr(order_item::Column::LastError, Expr::value(Option::<String>::None))
                .col_expr(order_item::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
                .filter(order_item::Column::Id.eq(item.id))
                .filter(order_item::Column::Reserved.eq(reserved))
                .filter(order_item::Column::FulfillmentState.is_in([
                    LineFulfillmentState::Pending,
                    LineFulfillmentState::Failed,
                ]))
                .exec(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            if result.rows_affected == 1 {
                claimed = true;
                break;
            }

            let current = order_item::Entity::find_by_id(item.id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            match current {
                Some(line) if !line.fulfillment_state.is_done() && line.reserved != reserved => {
                    reserved = line.reserved;
                }
                _ => {
                    txn.rollback().await.map_err(ServiceError::db_error)?;
                    return Ok(false);
                }
            }
        }
        if !claimed {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Err(ServiceError::ConcurrentModification(item.id));
        }

        // A line that still holds its reservation consumes it; anything else
        // may only take unreserved stock.
        let committed = if item.fulfillment_type == FulfillmentType::LocalInventory && reserved {
            commit_in(&txn, item.inventory_unit_id, item.quantity).await
        } else {
            commit_available_in(&txn, item.inventory_unit_id, item.quantity).await
        };
        if let Err(e) = committed {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Err(e);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(true)
    }

    async fn submit_pod(
        &self,
        order: &OrderModel,
        address: &ShippingAddress,
        item: &OrderItemModel,
    ) -> PodOutcome {
        let request = match self.pod_request(order, address, item).await {
            Ok(request) => request,
            Err(e) => return PodOutcome::Failed(e.to_string()),
        };

        let response = match self.provider.submit_order(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Print-on-demand submission failed");
                return PodOutcome::Failed(e.to_string());
            }
        };

        let recorded = order_item::Entity::update_many()
            .col_expr(order_item::Column::FulfillmentState, Expr::value(LineFulfillmentState::Submitted))
            .col_expr(order_item::Column::ExternalOrderId, Expr::value(Some(response.id.clone())))
            .col_expr(order_item::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(order_item::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(order_item::Column::Id.eq(item.id))
            .filter(order_item::Column::FulfillmentState.is_in([
                LineFulfillmentState::Pending,
                LineFulfillmentState::Failed,
            ]))
            .exec(&*self.db)
            .await;

        match recorded {
            Ok(r) if r.rows_affected == 1 => PodOutcome::Submitted(response.id),
            Ok(_) => PodOutcome::Skipped,
            Err(e) => {
                // The provider accepted the order; surface it for manual follow-up
                error!(
                    item_id = %item.id,
                    printify_order_id = %response.id,
                    error = %e,
                    "Failed to record print-on-demand submission"
                );
                PodOutcome::Failed(format!("submitted as {} but not recorded: {}", response.id, e))
            }
        }
    }

    async fn pod_request(
        &self,
        order: &OrderModel,
        address: &ShippingAddress,
        item: &OrderItemModel,
    ) -> Result<PodOrderRequest, ServiceError> {
        let product = product::Entity::find_by_id(item.product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", item.product_id)))?;
        let unit = inventory_unit::Entity::find_by_id(item.inventory_unit_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Inventory unit {} not found", item.inventory_unit_id))
            })?;

        let (Some(product_id), Some(variant_id)) = (product.printify_product_id, unit.printify_variant_id)
        else {
            return Err(ServiceError::FulfillmentFailed(format!(
                "{} has no Printify product/variant mapping",
                item.sku
            )));
        };

        let line_ref: String = item.id.simple().to_string().chars().take(8).collect();
        Ok(PodOrderRequest {
            external_id: format!("{}-{}", order.order_number, line_ref),
            label: order.order_number.clone(),
            line_items: vec![PodLineItem {
                product_id,
                variant_id,
                quantity: item.quantity,
            }],
            address_to: PodAddress::from(address),
        })
    }

    async fn mark_failed(&self, failed: &FailedItem) -> Result<(), ServiceError> {
        order_item::Entity::update_many()
            .col_expr(order_item::Column::FulfillmentState, Expr::value(LineFulfillmentState::Failed))
            .col_expr(order_item::Column::LastError, Expr::value(Some(failed.reason.clone())))
            .col_expr(order_item::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(order_item::Column::Id.eq(failed.item_id))
            .filter(order_item::Column::FulfillmentState.is_not_in([
                LineFulfillmentState::Committed,
                LineFulfillmentState::Submitted,
            ]))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }
}
