use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the bus is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Domain events emitted by the storefront services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartCreated(Uuid),

    // Stock ledger
    StockReserved {
        unit_id: Uuid,
        quantity: i32,
    },
    StockReleased {
        unit_id: Uuid,
        quantity: i32,
    },
    StockCommitted {
        unit_id: Uuid,
        quantity: i32,
    },
    LowStock {
        unit_id: Uuid,
        sku: String,
        available: i32,
        threshold: i32,
    },
    ReservationsSwept {
        carts_released: u64,
        units_released: i64,
    },

    // Promotions
    PromotionApplied {
        cart_id: Uuid,
        promotion_id: Uuid,
        discount: Decimal,
    },
    PromotionUsageRecorded {
        order_id: Uuid,
        promotion_id: Uuid,
        user_id: Uuid,
    },

    // Orders
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payments
    PaymentCaptured {
        order_id: Uuid,
        payment_id: Uuid,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    /// Money was captured for an order that can no longer be fulfilled.
    RefundRequired {
        order_id: Uuid,
        payment_id: Uuid,
        reason: String,
    },

    // Fulfillment
    FulfillmentCompleted(Uuid),
    FulfillmentFailed {
        order_id: Uuid,
        failed_items: Vec<Uuid>,
    },
}

/// Consumes the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Event processing loop started");

    while let Some(event) = rx.recv().await {
        match event {
            Event::LowStock {
                unit_id,
                sku,
                available,
                threshold,
            } => {
                warn!(
                    unit_id = %unit_id,
                    sku = %sku,
                    available,
                    threshold,
                    "Low stock"
                );
            }
            Event::PaymentFailed { order_id, reason } => {
                warn!(order_id = %order_id, reason = %reason, "Payment failed");
            }
            Event::RefundRequired {
                order_id,
                payment_id,
                reason,
            } => {
                error!(
                    order_id = %order_id,
                    payment_id = %payment_id,
                    reason = %reason,
                    "Captured payment needs a refund"
                );
            }
            Event::FulfillmentFailed {
                order_id,
                failed_items,
            } => {
                error!(
                    order_id = %order_id,
                    failed = failed_items.len(),
                    "Fulfillment failed; order awaits retry"
                );
            }
            Event::ReservationsSwept {
                carts_released,
                units_released,
            } => {
                info!(carts_released, units_released, "Reservation sweep finished");
            }
            other => {
                info!(event = ?other, "Domain event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
