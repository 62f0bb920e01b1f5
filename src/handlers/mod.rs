pub mod admin;
pub mod carts;
pub mod common;
pub mod fulfillment;
pub mod health;
pub mod inventory;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod promotions;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    gateways::{FulfillmentProvider, PaymentGateway},
    services::{
        cart::CartService, fulfillment::FulfillmentDispatcher, notifications::Notifier,
        orders::OrderService, payments::PaymentService, promotion_usage::PromotionUsageRecorder,
        promotions::PromotionService, stock_ledger::StockLedger,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub ledger: StockLedger,
    pub carts: CartService,
    pub promotions: PromotionService,
    pub usage: PromotionUsageRecorder,
    pub orders: OrderService,
    pub fulfillment: FulfillmentDispatcher,
    pub payments: PaymentService,
}

impl AppServices {
    /// Wires every service over one pool and event channel. External
    /// integrations are passed in so tests can substitute fakes.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn FulfillmentProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = StockLedger::new(db_pool.clone(), event_sender.clone());
        let carts = CartService::new(db_pool.clone(), event_sender.clone(), ledger.clone());
        let promotions = PromotionService::new(db_pool.clone());
        let usage = PromotionUsageRecorder::new(db_pool.clone(), event_sender.clone());
        let orders = OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            notifier,
            config.pricing(),
            config.currency.clone(),
        );
        let fulfillment = FulfillmentDispatcher::new(
            db_pool.clone(),
            event_sender.clone(),
            ledger.clone(),
            provider,
            orders.clone(),
        );
        let payments = PaymentService::new(
            db_pool,
            event_sender,
            gateway,
            usage.clone(),
            fulfillment.clone(),
            carts.clone(),
        );

        Self {
            ledger,
            carts,
            promotions,
            usage,
            orders,
            fulfillment,
            payments,
        }
    }
}
