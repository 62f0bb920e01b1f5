#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        inventory_unit,
        order::Model as OrderModel,
        product::{self, FulfillmentType},
        promotion::{self, PromotionType},
    },
    errors::ServiceError,
    events::{self, EventSender},
    gateways::{
        CaptureResult, CaptureStatus, FulfillmentProvider, PaymentGateway, PodOrderRequest,
        PodOrderResponse, PodOrderStatus,
    },
    handlers::AppServices,
    services::{
        notifications::{Notifier, TrackingInfo},
        orders::ShippingAddress,
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Payment gateway that approves everything unless told to decline.
#[derive(Default)]
pub struct FakeGateway {
    created: AtomicUsize,
    pub decline: AtomicBool,
    pub captures: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> &'static str {
        "fake"
    }

    async fn create_order(
        &self,
        _amount: Decimal,
        _currency: &str,
        _reference: &str,
    ) -> Result<String, ServiceError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("PAY-{}", n + 1))
    }

    async fn capture_payment(&self, external_id: &str) -> Result<CaptureResult, ServiceError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.decline.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentFailed(format!(
                "{} was declined",
                external_id
            )));
        }
        Ok(completed_capture(external_id))
    }
}

pub fn completed_capture(external_id: &str) -> CaptureResult {
    CaptureResult {
        id: format!("CAP-{}", external_id),
        payer_email: Some("payer@example.com".to_string()),
        status: CaptureStatus::Completed,
        raw: json!({ "id": external_id, "status": "COMPLETED" }),
    }
}

/// Print-on-demand provider that records submissions and can be switched to fail.
#[derive(Default)]
pub struct FakeFulfillmentProvider {
    pub fail: AtomicBool,
    pub shipped: AtomicBool,
    pub submissions: Mutex<Vec<PodOrderRequest>>,
}

impl FakeFulfillmentProvider {
    pub fn failing() -> Self {
        let provider = Self::default();
        provider.fail.store(true, Ordering::SeqCst);
        provider
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FulfillmentProvider for FakeFulfillmentProvider {
    async fn submit_order(
        &self,
        request: &PodOrderRequest,
    ) -> Result<PodOrderResponse, ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::FulfillmentFailed(
                "provider rejected order".to_string(),
            ));
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request.clone());
        Ok(PodOrderResponse {
            id: format!("pod-{}", submissions.len()),
            status: "pending".to_string(),
        })
    }

    async fn get_order_status(&self, _external_id: &str) -> Result<PodOrderStatus, ServiceError> {
        if self.shipped.load(Ordering::SeqCst) {
            Ok(PodOrderStatus {
                status: "shipped".to_string(),
                tracking: Some(TrackingInfo {
                    tracking_number: "1Z999".to_string(),
                    carrier: Some("UPS".to_string()),
                    tracking_url: None,
                }),
            })
        } else {
            Ok(PodOrderStatus {
                status: "in-production".to_string(),
                tracking: None,
            })
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub shipped: Mutex<Vec<(Uuid, TrackingInfo)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn order_shipped(
        &self,
        order: &OrderModel,
        tracking: &TrackingInfo,
    ) -> Result<(), ServiceError> {
        self.shipped
            .lock()
            .unwrap()
            .push((order.id, tracking.clone()));
        Ok(())
    }
}

/// Application state over a fresh in-memory SQLite database with fake integrations.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub provider: Arc<FakeFulfillmentProvider>,
    pub notifier: Arc<RecordingNotifier>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_provider(FakeFulfillmentProvider::default()).await
    }

    pub async fn with_provider(provider: FakeFulfillmentProvider) -> Self {
        Self::build(provider, DbConfig::sqlite_memory()).await
    }

    /// A SQLite file in `dir` behind a multi-connection pool, so concurrent
    /// tasks really hit the database at the same time.
    pub async fn file_backed(dir: &TempDir) -> Self {
        let db_file = dir.path().join("storefront_test.db");
        let config = DbConfig {
            url: format!("sqlite://{}?mode=rwc", db_file.display()),
            max_connections: 8,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        Self::build(FakeFulfillmentProvider::default(), config).await
    }

    async fn build(provider: FakeFulfillmentProvider, db_config: DbConfig) -> Self {
        let mut cfg = AppConfig::new(db_config.url.clone(), "test".to_string());
        cfg.admin_api_token = Some(ADMIN_TOKEN.to_string());

        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::default());

        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            &cfg,
            gateway.clone(),
            provider.clone(),
            notifier.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            event_sender,
            services,
        };
        let router = storefront_api::app(state.clone(), Duration::from_secs(10));

        Self {
            router,
            state,
            gateway,
            provider,
            notifier,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Sends a request through the router and returns the status and JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None, &[]).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body), &[]).await
    }

    pub async fn admin_post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            uri,
            Some(body),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await
    }

    pub async fn seed_product(
        &self,
        name: &str,
        price: Decimal,
        fulfillment_type: FulfillmentType,
    ) -> product::Model {
        let now = Utc::now();
        let printify_product_id = match fulfillment_type {
            FulfillmentType::LocalInventory => None,
            _ => Some(format!("pp-{}", name.to_lowercase().replace(' ', "-"))),
        };
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            category: Set(Some("apparel".to_string())),
            price: Set(price),
            image_url: Set(None),
            fulfillment_type: Set(fulfillment_type),
            printify_product_id: Set(printify_product_id),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert product")
    }

    pub async fn seed_unit(&self, product_id: Uuid, sku: &str, quantity: i32) -> inventory_unit::Model {
        let now = Utc::now();
        inventory_unit::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(sku.to_string()),
            quantity: Set(quantity),
            reserved_stock: Set(0),
            low_stock_threshold: Set(5),
            printify_variant_id: Set(Some("12345".to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert inventory unit")
    }

    pub async fn unit(&self, id: Uuid) -> inventory_unit::Model {
        inventory_unit::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query unit")
            .expect("unit exists")
    }

    pub async fn seed_promotion(
        &self,
        code: &str,
        promotion_type: PromotionType,
        value: Decimal,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> promotion::Model {
        let now = Utc::now();
        promotion::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("{} promotion", code)),
            description: Set(None),
            promotion_type: Set(promotion_type),
            value: Set(value),
            minimum_order_value: Set(None),
            start_date: Set(start_date),
            end_date: Set(end_date),
            is_active: Set(true),
            coupon_code: Set(Some(code.to_string())),
            usage_limit: Set(None),
            usage_count: Set(0),
            per_user_limit: Set(None),
            requires_authentication: Set(false),
            apply_to_all_items: Set(true),
            applicable_categories: Set(json!([])),
            applicable_products: Set(json!([])),
            free_item_product_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert promotion")
    }

    /// A promotion valid from yesterday until next week.
    pub async fn seed_current_promotion(
        &self,
        code: &str,
        promotion_type: PromotionType,
        value: Decimal,
    ) -> promotion::Model {
        let now = Utc::now();
        self.seed_promotion(
            code,
            promotion_type,
            value,
            now - chrono::Duration::days(1),
            now + chrono::Duration::days(7),
        )
        .await
    }
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        email: "ada@example.com".to_string(),
        phone: Some("+15555550100".to_string()),
        address1: "1 Analytical Way".to_string(),
        address2: None,
        city: "London".to_string(),
        state: "LDN".to_string(),
        postal_code: "N1 9GU".to_string(),
        country: "GB".to_string(),
    }
}
