mod common;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use axum::http::Method;
use common::{completed_capture, shipping_address, TestApp, ADMIN_TOKEN};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::json;
use storefront_api::{
    entities::{
        order::{FulfillmentStatus, OrderStatus},
        payment::{self, PaymentStatus},
        product::FulfillmentType,
        promotion,
        promotion::PromotionType,
        promotion_usage, user,
    },
    errors::{PromotionError, ServiceError},
    services::{
        cart::{AddToCartInput, CreateCartInput, CustomerIdentity},
        orders::{CreateOrderInput, OrderDetails, ShippingMethod, UpdateOrderStatusInput},
        promotion_usage::UsageOutcome,
        promotions::PromotionRef,
    },
};
use uuid::Uuid;

struct Checkout {
    cart_id: Uuid,
    unit_id: Uuid,
}

/// Two posters at $25 from a unit holding 40.
async fn fill_cart(app: &TestApp) -> Checkout {
    let product = app
        .seed_product("Poster", dec!(25.00), FulfillmentType::LocalInventory)
        .await;
    let unit = app.seed_unit(product.id, "POSTER-A3", 40).await;
    let carts = &app.services().carts;
    let cart = carts
        .create_cart(CreateCartInput {
            user_id: None,
            session_id: Some("guest-session".to_string()),
        })
        .await
        .unwrap();
    carts
        .add_item(
            cart.id,
            AddToCartInput {
                product_id: product.id,
                unit: "POSTER-A3".to_string(),
                quantity: 2,
            },
        )
        .await
        .unwrap();
    Checkout {
        cart_id: cart.id,
        unit_id: unit.id,
    }
}

fn guest_order(cart_id: Uuid, email: &str) -> CreateOrderInput {
    CreateOrderInput {
        cart_id,
        user_id: None,
        guest_email: Some(email.to_string()),
        shipping_address: shipping_address(),
        shipping_method: ShippingMethod::Standard,
        payment_method: "paypal".to_string(),
        coupon_code: None,
    }
}

async fn place_guest_order_with_coupon(app: &TestApp, email: &str) -> (Checkout, OrderDetails) {
    app.seed_current_promotion("TEST20", PromotionType::PercentageDiscount, dec!(20))
        .await;
    let checkout = fill_cart(app).await;
    app.services()
        .carts
        .apply_promotion(
            checkout.cart_id,
            PromotionRef::Code("TEST20".to_string()),
            CustomerIdentity {
                user_id: None,
                guest_email: Some(email.to_string()),
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, email))
        .await
        .unwrap();
    (checkout, order)
}

#[tokio::test]
async fn order_totals_apply_discount_before_tax() {
    let app = TestApp::new().await;
    let (checkout, details) = place_guest_order_with_coupon(&app, "a@b.com").await;
    let order = &details.order;

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.subtotal, dec!(50.00));
    assert_eq!(order.discount_amount, dec!(10.00));
    assert_eq!(order.tax_amount, dec!(3.20));
    assert_eq!(order.shipping_amount, dec!(5.99));
    assert_eq!(order.total_amount, dec!(49.19));
    assert_eq!(order.coupon_code.as_deref(), Some("TEST20"));
    assert!(order.order_number.starts_with("ORD-"));

    assert_eq!(details.items.len(), 1);
    assert!(details.items[0].reserved);
    // Stock stays reserved, not committed, until payment clears
    let unit = app.unit(checkout.unit_id).await;
    assert_eq!(unit.quantity, 40);
    assert_eq!(unit.reserved_stock, 2);
}

#[tokio::test]
async fn a_cart_converts_into_at_most_one_order() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let orders = &app.services().orders;

    orders
        .create_order(guest_order(checkout.cart_id, "a@b.com"))
        .await
        .unwrap();
    let err = orders
        .create_order(guest_order(checkout.cart_id, "a@b.com"))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InvalidOperation(_));
    assert_eq!(app.unit(checkout.unit_id).await.reserved_stock, 2);
}

#[tokio::test]
async fn guest_checkout_requires_an_email() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let mut input = guest_order(checkout.cart_id, "a@b.com");
    input.guest_email = None;

    let err = app.services().orders.create_order(input).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn captured_guest_payment_records_promotion_usage_once() {
    let app = TestApp::new().await;
    let (checkout, details) = place_guest_order_with_coupon(&app, "a@b.com").await;
    let order_id = details.order.id;
    let payments = &app.services().payments;

    let payment = payments.initiate_payment(order_id).await.unwrap();
    let external_id = payment.external_payment_id.clone().unwrap();
    let again = payments.initiate_payment(order_id).await.unwrap();
    assert_eq!(again.id, payment.id);

    let outcome = payments.capture_payment(order_id, &external_id).await.unwrap();
    assert_eq!(outcome.payment.status, PaymentStatus::Completed);
    assert_eq!(outcome.order_status, OrderStatus::Processing);
    assert_eq!(outcome.promotion_usage, UsageOutcome::Recorded);
    let report = outcome.fulfillment.expect("fulfillment started");
    assert_eq!(report.committed.len(), 1);
    assert!(report.is_complete());

    let guest = user::Entity::find()
        .filter(user::Column::Email.eq("a@b.com"))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("guest user created");
    assert!(guest.is_guest);
    let usages = promotion_usage::Entity::find()
        .filter(promotion_usage::Column::OrderId.eq(order_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].user_id, guest.id);

    let unit = app.unit(checkout.unit_id).await;
    assert_eq!(unit.quantity, 38);
    assert_eq!(unit.reserved_stock, 0);
    assert!(app.services().carts.get_cart(checkout.cart_id).await.unwrap_err().is_not_found());

    // Replays only re-run the idempotent follow-up steps
    let replay = payments.capture_payment(order_id, &external_id).await.unwrap();
    assert_eq!(replay.promotion_usage, UsageOutcome::AlreadyRecorded);
    assert_eq!(app.gateway.captures.load(Ordering::SeqCst), 1);
    assert_eq!(
        app.services().usage.record_usage(order_id).await.unwrap(),
        UsageOutcome::AlreadyRecorded
    );

    let promo = promotion::Entity::find_by_id(usages[0].promotion_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promo.usage_count, 1);
    assert_eq!(app.unit(checkout.unit_id).await.quantity, 38);
}

#[tokio::test]
async fn declined_capture_marks_payment_failed_and_keeps_order_pending() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, "c@d.com"))
        .await
        .unwrap()
        .order;
    let payments = &app.services().payments;
    let payment = payments.initiate_payment(order.id).await.unwrap();
    app.gateway.decline.store(true, Ordering::SeqCst);

    let err = payments
        .capture_payment(order.id, payment.external_payment_id.as_deref().unwrap())
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentFailed(_));
    let details = app.services().orders.get_order(order.id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Pending);
    let usages = promotion_usage::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages, 0);
}

#[tokio::test]
async fn cancelling_a_pending_order_releases_its_reservations() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, "a@b.com"))
        .await
        .unwrap()
        .order;
    let uri = format!("/api/v1/admin/orders/{}/status", order.id);

    let (status, body) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "CANCELLED" })),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("CANCELLED"));
    assert_eq!(app.unit(checkout.unit_id).await.reserved_stock, 0);

    // Same status is a no-op and never releases twice
    let (status, _) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "CANCELLED" })),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(app.unit(checkout.unit_id).await.reserved_stock, 0);

    let (status, _) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "PROCESSING" })),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn shipping_requires_tracking_and_notifies_the_customer() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, "a@b.com"))
        .await
        .unwrap()
        .order;
    let payments = &app.services().payments;
    let payment = payments.initiate_payment(order.id).await.unwrap();
    payments
        .capture_payment(order.id, payment.external_payment_id.as_deref().unwrap())
        .await
        .unwrap();
    let uri = format!("/api/v1/admin/orders/{}/status", order.id);

    let (status, _) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "SHIPPED" })),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({
                "status": "SHIPPED",
                "tracking": { "tracking_number": "1Z123", "carrier": "UPS", "tracking_url": null }
            })),
            &[("x-admin-token", ADMIN_TOKEN)],
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["tracking_number"], json!("1Z123"));
    assert_eq!(body["data"]["fulfillment_status"], json!("SHIPPED"));

    let shipped = app.notifier.shipped.lock().unwrap();
    assert_eq!(shipped.len(), 1);
    assert_eq!(shipped[0].0, order.id);
}

#[tokio::test]
async fn checkout_over_http_uses_the_caller_identity() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Tote", dec!(30.00), FulfillmentType::LocalInventory)
        .await;
    app.seed_unit(product.id, "TOTE-1", 10).await;
    let caller = Uuid::new_v4().to_string();
    let headers = [("x-user-id", caller.as_str())];

    let (status, cart) = app
        .request(Method::POST, "/api/v1/carts", Some(json!({})), &headers)
        .await;
    assert_eq!(status, 201);
    assert_eq!(cart["data"]["user_id"], json!(caller));
    let cart_id = cart["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .post(
            &format!("/api/v1/carts/{}/items", cart_id),
            json!({ "product_id": product.id, "unit": "TOTE-1", "quantity": 3 }),
        )
        .await;
    assert_eq!(status, 200);

    let (status, order) = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cart_id": cart_id,
                "shipping_address": shipping_address(),
                "shipping_method": "express",
                "payment_method": "paypal"
            })),
            &headers,
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(order["data"]["user_id"], json!(caller));
    assert_eq!(order["data"]["status"], json!("PENDING"));
    assert_eq!(order["data"]["items"].as_array().unwrap().len(), 1);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/carts",
            Some(json!({})),
            &[("x-user-id", "not-a-uuid")],
        )
        .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn capture_webhook_moves_the_order_to_processing() {
    let app = TestApp::new().await;
    let checkout = fill_cart(&app).await;
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, "a@b.com"))
        .await
        .unwrap()
        .order;
    let payment = app.services().payments.initiate_payment(order.id).await.unwrap();
    let external_id = payment.external_payment_id.clone().unwrap();
    let event = json!({
        "id": "WH-1",
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": "CAP-1",
            "status": "COMPLETED",
            "supplementary_data": { "related_ids": { "order_id": external_id } }
        }
    });

    let (status, body) = app.post("/api/v1/payments/webhook", event.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("processed"));

    let details = app.services().orders.get_order(order.id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Processing);
    assert_eq!(details.order.fulfillment_status, FulfillmentStatus::Processing);
    assert_eq!(app.unit(checkout.unit_id).await.quantity, 38);

    // Redelivery changes nothing
    let (status, _) = app.post("/api/v1/payments/webhook", event).await;
    assert_eq!(status, 200);
    assert_eq!(app.unit(checkout.unit_id).await.quantity, 38);

    let (status, body) = app
        .post(
            "/api/v1/payments/webhook",
            json!({ "event_type": "CHECKOUT.ORDER.APPROVED", "resource": {} }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("ignored"));
}

#[tokio::test]
async fn per_customer_limit_blocks_a_second_guest_order_and_recount_repairs_the_counter() {
    let app = TestApp::new().await;
    let promo = app
        .seed_current_promotion("ONCE10", PromotionType::PercentageDiscount, dec!(10))
        .await;
    let mut limited: promotion::ActiveModel = promo.clone().into();
    limited.per_user_limit = Set(Some(1));
    limited.update(&*app.state.db).await.unwrap();

    let guest = CustomerIdentity {
        user_id: None,
        guest_email: Some("repeat@example.com".to_string()),
    };
    let checkout = fill_cart(&app).await;
    let carts = &app.services().carts;
    carts
        .apply_promotion(
            checkout.cart_id,
            PromotionRef::Code("ONCE10".to_string()),
            guest.clone(),
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    let order = app
        .services()
        .orders
        .create_order(guest_order(checkout.cart_id, "repeat@example.com"))
        .await
        .unwrap()
        .order;
    let payments = &app.services().payments;
    let payment = payments.initiate_payment(order.id).await.unwrap();
    payments
        .capture_payment(order.id, payment.external_payment_id.as_deref().unwrap())
        .await
        .unwrap();

    let product_id = app.unit(checkout.unit_id).await.product_id;
    let second = carts
        .create_cart(CreateCartInput {
            user_id: None,
            session_id: Some("guest-session-2".to_string()),
        })
        .await
        .unwrap();
    carts
        .add_item(
            second.id,
            AddToCartInput {
                product_id,
                unit: "POSTER-A3".to_string(),
                quantity: 1,
            },
        )
        .await
        .unwrap();
    let err = carts
        .apply_promotion(
            second.id,
            PromotionRef::Code("ONCE10".to_string()),
            guest,
            chrono::Utc::now(),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::PromotionInvalid(PromotionError::UserLimitReached)
    );

    let mut drifted: promotion::ActiveModel = promotion::Entity::find_by_id(promo.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .into();
    drifted.usage_count = Set(5);
    drifted.update(&*app.state.db).await.unwrap();

    let (status, body) = app
        .admin_post(&format!("/api/v1/admin/promotions/{}/recount", promo.id), json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["usage_count"], json!(1));
    let repaired = promotion::Entity::find_by_id(promo.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repaired.usage_count, 1);
}

#[tokio::test]
async fn payment_for_a_cancelled_order_is_never_applied() {
    let app = TestApp::new().await;
    let (_, details) = place_guest_order_with_coupon(&app, "late@example.com").await;
    let order_id = details.order.id;
    let promotion_id = details.order.applied_promotion_id.unwrap();
    let payments = &app.services().payments;
    let payment = payments.initiate_payment(order_id).await.unwrap();
    let external_id = payment.external_payment_id.clone().unwrap();

    app.services()
        .orders
        .update_order_status(
            order_id,
            UpdateOrderStatusInput {
                status: OrderStatus::Cancelled,
                tracking: None,
            },
        )
        .await
        .unwrap();

    let err = payments.capture_payment(order_id, &external_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
    assert_eq!(app.gateway.captures.load(Ordering::SeqCst), 0);

    // The provider may still report a capture it completed on its side
    let err = payments
        .handle_capture_event(&external_id, completed_capture(&external_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    let stored = payment::Entity::find_by_id(payment.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
    let usages = promotion_usage::Entity::find()
        .filter(promotion_usage::Column::OrderId.eq(order_id))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages, 0);
    let promo = promotion::Entity::find_by_id(promotion_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promo.usage_count, 0);
    let order = app.services().orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.cart_id.is_some());

    let err = payments.capture_payment(order_id, &external_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}
