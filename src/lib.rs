//! Storefront API Library
//!
//! Cart, stock, promotion, order, payment and fulfillment services behind
//! an axum HTTP surface.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod rate_limiter;
pub mod services;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Storefront routes, mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    let carts = Router::new()
        .route("/carts", post(handlers::carts::create_cart))
        .route("/carts/:id", get(handlers::carts::get_cart))
        .route("/carts/:id/items", post(handlers::carts::add_item))
        .route(
            "/carts/:id/items/:item_id",
            delete(handlers::carts::remove_item),
        )
        .route(
            "/carts/:id/promotions",
            post(handlers::carts::apply_promotion),
        )
        .route(
            "/carts/:id/promotions/:promotion_id",
            delete(handlers::carts::remove_promotion),
        );

    let inventory = Router::new().route(
        "/inventory/:unit/availability",
        get(handlers::inventory::check_availability),
    );

    let promotions = Router::new()
        .route(
            "/promotions/validate",
            post(handlers::promotions::validate_promotion),
        )
        .route("/promotions/:id", get(handlers::promotions::get_promotion));

    let orders = Router::new()
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/payments",
            post(handlers::payments::initiate_payment),
        )
        .route(
            "/orders/:id/payments/capture",
            post(handlers::payments::capture_payment),
        )
        .route(
            "/payments/webhook",
            post(handlers::payment_webhooks::payment_webhook),
        );

    let admin = Router::new()
        .route(
            "/admin/promotions",
            post(handlers::promotions::create_promotion),
        )
        .route(
            "/admin/promotions/:id/deactivate",
            post(handlers::promotions::deactivate_promotion),
        )
        .route(
            "/admin/promotions/:id/recount",
            post(handlers::promotions::recount_usage),
        )
        .route(
            "/admin/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .route(
            "/admin/orders/:id/fulfillment",
            post(handlers::fulfillment::process_order),
        )
        .route(
            "/admin/orders/:id/fulfillment/retry",
            post(handlers::fulfillment::retry_failed_fulfillment),
        )
        .route(
            "/admin/orders/:id/fulfillment/sync-tracking",
            post(handlers::fulfillment::sync_tracking),
        )
        .route(
            "/admin/reservations/sweep",
            post(handlers::admin::sweep_reservations),
        );

    Router::new()
        .merge(carts)
        .merge(inventory)
        .merge(promotions)
        .merge(orders)
        .merge(admin)
}

/// Builds the full application router with its middleware stack.
pub fn app(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
