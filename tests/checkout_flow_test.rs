mod common;

use rust_decimal_macros::dec;
use sea_orm::EntityTrait;

use common::TestApp;
use storefront_api::entities::{order, order_item};
use storefront_api::errors::CheckoutCode;
use storefront_api::services::order_status::OrderStatus;
use storefront_api::services::orders::{CartItemInput, CreateOrderRequest};

fn cart(items: Vec<(&str, i32)>, total: rust_decimal::Decimal) -> CreateOrderRequest {
    CreateOrderRequest {
        items: items
            .into_iter()
            .map(|(product_id, quantity)| CartItemInput {
                product_id: product_id.to_string(),
                quantity,
                name: None,
                sku: None,
                unit_price: None,
            })
            .collect(),
        total,
        payer_email: Some("ana@example.com".to_string()),
        payer_name: Some("Ana".to_string()),
        payer_phone: None,
        user_id: None,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn happy_path_creates_pending_order_with_preference() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let result = app
        .services
        .checkout
        .submit_cart(cart(vec![("p1", 2)], dec!(2000)))
        .await
        .expect("checkout should succeed");

    assert_eq!(result.preference_id.as_deref(), Some("pref-1"));
    assert!(result.redirect_url.is_some());

    let stored = app
        .services
        .orders
        .get_order(result.order_id)
        .await
        .unwrap();
    assert_eq!(stored.status, OrderStatus::Pending.to_string());
    assert_eq!(stored.total, dec!(2000));
    assert_eq!(stored.preference_id.as_deref(), Some("pref-1"));
    assert!(!stored.stock_decremented);

    let items = app
        .services
        .orders
        .get_order_items(result.order_id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 2);
    assert_eq!(items[0].unit_price, dec!(1000));
    assert_eq!(items[0].subtotal, dec!(2000));
    assert_eq!(items[0].name, "Remera");
}

#[tokio::test]
async fn empty_cart_is_rejected_without_touching_the_gateway() {
    let app = TestApp::new().await;

    let err = app
        .services
        .checkout
        .submit_cart(cart(vec![], dec!(0)))
        .await
        .unwrap_err();

    assert_eq!(err.code, CheckoutCode::InvalidCart);
    assert_eq!(app.gateway.request_count(), 0);
}

#[tokio::test]
async fn negative_total_is_a_distinct_failure() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let err = app
        .services
        .checkout
        .submit_cart(cart(vec![("p1", 1)], dec!(-1)))
        .await
        .unwrap_err();

    assert_eq!(err.code, CheckoutCode::InvalidTotal);
    assert_eq!(app.gateway.request_count(), 0);
}

#[tokio::test]
async fn fully_discounted_cart_with_zero_total_is_accepted() {
    let app = TestApp::new().await;
    app.seed_product("gift", "Sticker pack", dec!(0), 10).await;

    let result = app
        .services
        .checkout
        .submit_cart(cart(vec![("gift", 1)], dec!(0)))
        .await
        .expect("free carts are valid orders");

    let stored = app
        .services
        .orders
        .get_order(result.order_id)
        .await
        .unwrap();
    assert_eq!(stored.total, dec!(0));
    assert_eq!(stored.status, OrderStatus::Pending.to_string());
}

#[tokio::test]
async fn unknown_product_aborts_the_whole_order() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let err = app
        .services
        .checkout
        .submit_cart(cart(vec![("p1", 1), ("ghost", 1)], dec!(1000)))
        .await
        .unwrap_err();

    assert_eq!(err.code, CheckoutCode::OrderCreateFailed);
    assert!(err.message.contains("ghost"));

    // Atomicity: neither the order nor the resolvable item may persist.
    let orders = order::Entity::find().all(&*app.db).await.unwrap();
    let items = order_item::Entity::find().all(&*app.db).await.unwrap();
    assert!(orders.is_empty());
    assert!(items.is_empty());
    assert_eq!(app.gateway.request_count(), 0);
}

#[tokio::test]
async fn quantities_below_one_are_clamped() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let result = app
        .services
        .checkout
        .submit_cart(cart(vec![("p1", 0)], dec!(1000)))
        .await
        .unwrap();

    let items = app
        .services
        .orders
        .get_order_items(result.order_id)
        .await
        .unwrap();
    assert_eq!(items[0].quantity, 1);
    assert_eq!(items[0].subtotal, dec!(1000));
}

#[tokio::test]
async fn idempotency_key_returns_the_same_order() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let mut first_request = cart(vec![("p1", 2)], dec!(2000));
    first_request.idempotency_key = Some("cart-abc".to_string());
    let first = app
        .services
        .checkout
        .submit_cart(first_request)
        .await
        .unwrap();

    let mut second_request = cart(vec![("p1", 2)], dec!(2000));
    second_request.idempotency_key = Some("cart-abc".to_string());
    let second = app
        .services
        .checkout
        .submit_cart(second_request)
        .await
        .unwrap();

    assert_eq!(first.order_id, second.order_id);

    let orders = order::Entity::find().all(&*app.db).await.unwrap();
    assert_eq!(orders.len(), 1);
    let items = order_item::Entity::find().all(&*app.db).await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn products_resolve_by_uuid_as_well_as_sku() {
    let app = TestApp::new().await;
    let seeded = app.seed_product("p1", "Remera", dec!(1000), 10).await;

    let result = app
        .services
        .checkout
        .submit_cart(cart(vec![(&seeded.id.to_string(), 1)], dec!(1000)))
        .await
        .unwrap();

    let items = app
        .services
        .orders
        .get_order_items(result.order_id)
        .await
        .unwrap();
    assert_eq!(items[0].product_id, seeded.id);
    assert_eq!(items[0].sku.as_deref(), Some("p1"));
}

#[tokio::test]
async fn gateway_failure_compensates_into_pending_missing_preference() {
    let app = TestApp::new().await;
    app.seed_product("p1", "Remera", dec!(1000), 10).await;
    app.gateway.set_failing(true);

    let err = app
        .services
        .checkout
        .submit_cart(cart(vec![("p1", 2)], dec!(2000)))
        .await
        .unwrap_err();
    assert_eq!(err.code, CheckoutCode::PreferenceFailed);

    // The order survived the failed preference step.
    let orders = order::Entity::find().all(&*app.db).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(
        orders[0].status,
        OrderStatus::PendingMissingPreference.to_string()
    );
    assert!(orders[0].preference_id.is_none());

    let history = app
        .services
        .order_status
        .get_history(orders[0].id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].new_status,
        OrderStatus::PendingMissingPreference.to_string()
    );
    assert_eq!(history[0].changed_by, "system");
}
