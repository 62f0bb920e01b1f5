mod common;

use assert_matches::assert_matches;
use common::{shipping_address, TestApp};
use futures::future::join_all;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use storefront_api::{
    entities::{
        product::FulfillmentType,
        promotion::{self, PromotionType},
        promotion_usage,
    },
    errors::ServiceError,
    services::{
        cart::{AddToCartInput, CreateCartInput, CustomerIdentity},
        orders::{CreateOrderInput, ShippingMethod},
        promotion_usage::UsageOutcome,
        promotions::{CreatePromotionInput, PromotionRef},
    },
};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_oversell() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::file_backed(&dir).await;
    let product = app
        .seed_product("Mug", dec!(12.00), FulfillmentType::LocalInventory)
        .await;
    let unit = app.seed_unit(product.id, "MUG-RACE", 10).await;

    let handles = (0..20).map(|_| {
        let ledger = app.services().ledger.clone();
        tokio::spawn(async move { ledger.reserve("MUG-RACE", 1).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("reserve task panicked"))
        .collect();

    let reserved = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(reserved, 10);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    }
    assert_eq!(app.unit(unit.id).await.reserved_stock, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_of_several_large_reserves_fits() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::file_backed(&dir).await;
    let product = app
        .seed_product("Print", dec!(30.00), FulfillmentType::LocalInventory)
        .await;
    let unit = app.seed_unit(product.id, "PRINT-RACE", 5).await;

    let handles = (0..4).map(|_| {
        let ledger = app.services().ledger.clone();
        tokio::spawn(async move { ledger.reserve("PRINT-RACE", 3).await })
    });
    let succeeded = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("reserve task panicked"))
        .filter(Result::is_ok)
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(app.unit(unit.id).await.reserved_stock, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_releases_report_exactly_what_was_held() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::file_backed(&dir).await;
    let product = app
        .seed_product("Tote", dec!(18.00), FulfillmentType::LocalInventory)
        .await;
    let unit = app.seed_unit(product.id, "TOTE-RACE", 10).await;
    app.services().ledger.reserve("TOTE-RACE", 6).await.unwrap();

    let handles = (0..4).map(|_| {
        let ledger = app.services().ledger.clone();
        tokio::spawn(async move { ledger.release("TOTE-RACE", 3).await })
    });
    let released: i32 = join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined
                .expect("release task panicked")
                .expect("release succeeds")
        })
        .sum();

    assert_eq!(released, 6);
    let unit = app.unit(unit.id).await;
    assert_eq!(unit.reserved_stock, 0);
    assert_eq!(unit.quantity, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_usage_recording_counts_once() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::file_backed(&dir).await;
    let promo = app
        .seed_current_promotion("RACE10", PromotionType::PercentageDiscount, dec!(10))
        .await;
    let product = app
        .seed_product("Cap", dec!(20.00), FulfillmentType::LocalInventory)
        .await;
    app.seed_unit(product.id, "CAP-RACE", 10).await;

    let carts = &app.services().carts;
    let cart = carts
        .create_cart(CreateCartInput {
            user_id: None,
            session_id: Some("race-session".to_string()),
        })
        .await
        .unwrap();
    carts
        .add_item(
            cart.id,
            AddToCartInput {
                product_id: product.id,
                unit: "CAP-RACE".to_string(),
                quantity: 1,
            },
        )
        .await
        .unwrap();
    carts
        .apply_promotion(
            cart.id,
            PromotionRef::Code("RACE10".to_string()),
            CustomerIdentity {
                user_id: None,
                guest_email: Some("racer@example.com".to_string()),
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    let order = app
        .services()
        .orders
        .create_order(CreateOrderInput {
            cart_id: cart.id,
            user_id: None,
            guest_email: Some("racer@example.com".to_string()),
            shipping_address: shipping_address(),
            shipping_method: ShippingMethod::Standard,
            payment_method: "paypal".to_string(),
            coupon_code: None,
        })
        .await
        .unwrap();
    let order_id = order.order.id;

    let handles = (0..4).map(|_| {
        let usage = app.services().usage.clone();
        tokio::spawn(async move { usage.record_usage(order_id).await })
    });
    let outcomes: Vec<UsageOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined
                .expect("usage task panicked")
                .expect("recording succeeds")
        })
        .collect();

    let recorded = outcomes
        .iter()
        .filter(|o| **o == UsageOutcome::Recorded)
        .count();
    assert_eq!(recorded, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, UsageOutcome::Recorded | UsageOutcome::AlreadyRecorded)));

    let usages = promotion_usage::Entity::find()
        .filter(promotion_usage::Column::OrderId.eq(order_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages.len(), 1);
    let promo = promotion::Entity::find_by_id(promo.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promo.usage_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_leave_one_active_promotion_per_code() {
    let dir = TempDir::new().unwrap();
    let app = TestApp::file_backed(&dir).await;
    let now = chrono::Utc::now();

    let handles = (0..4).map(|i| {
        let promotions = app.services().promotions.clone();
        let input = CreatePromotionInput {
            name: format!("Flash sale {}", i),
            description: None,
            promotion_type: PromotionType::FixedAmount,
            value: dec!(5),
            minimum_order_value: None,
            start_date: now,
            end_date: now + chrono::Duration::days(1),
            coupon_code: Some("FLASH5".to_string()),
            usage_limit: None,
            per_user_limit: None,
            requires_authentication: false,
            apply_to_all_items: true,
            applicable_categories: vec![],
            applicable_products: vec![],
            free_item_product_id: None,
        };
        tokio::spawn(async move { promotions.create_promotion(input).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("create task panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(ServiceError::ValidationError(_)));
    }
    let active = promotion::Entity::find()
        .filter(promotion::Column::CouponCode.eq("FLASH5"))
        .filter(promotion::Column::IsActive.eq(true))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}
