mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal_macros::dec;
use sea_orm::{ConnectionTrait, EntityTrait};
use tower::ServiceExt;
use uuid::Uuid;

use common::TestApp;
use storefront_api::entities::product;
use storefront_api::services::order_status::{Actor, OrderStatus};
use storefront_api::services::orders::{CartItemInput, CreateOrderRequest};
use storefront_api::services::reconciliation::{GatewaySignal, ReconcileOutcome};

async fn checkout_pending_order(app: &TestApp) -> (Uuid, Uuid) {
    let seeded = app.seed_product("p1", "Remera", dec!(1000), 10).await;
    let result = app
        .services
        .checkout
        .submit_cart(CreateOrderRequest {
            items: vec![CartItemInput {
                product_id: "p1".to_string(),
                quantity: 2,
                name: None,
                sku: None,
                unit_price: None,
            }],
            total: dec!(2000),
            payer_email: Some("ana@example.com".to_string()),
            payer_name: Some("Ana".to_string()),
            payer_phone: None,
            user_id: None,
            idempotency_key: None,
        })
        .await
        .expect("checkout");
    (result.order_id, seeded.id)
}

fn approved(order_id: Uuid) -> GatewaySignal {
    GatewaySignal {
        external_reference: Some(order_id.to_string()),
        status: Some("approved".to_string()),
        payment_id: Some("pay-123".to_string()),
        merchant_order_id: Some("mo-9".to_string()),
        payment_type: Some("credit_card".to_string()),
        ..Default::default()
    }
}

async fn stock_of(app: &TestApp, product_id: Uuid) -> i32 {
    product::Entity::find_by_id(product_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .stock
}

#[tokio::test]
async fn approved_signal_pays_the_order_with_side_effects() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;

    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Updated {
            order_id,
            new_status: OrderStatus::Paid,
            first_time_paid: true,
        }
    );

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid.to_string());
    assert_eq!(order.payment_id.as_deref(), Some("pay-123"));
    assert_eq!(order.merchant_order_id.as_deref(), Some("mo-9"));
    assert_eq!(order.payment_type.as_deref(), Some("credit_card"));
    assert!(order.stock_decremented);

    assert_eq!(stock_of(&app, product_id).await, 8);
    assert_eq!(app.mailer.sent_count(), 1);
    let sent = app.mailer.sent.lock().unwrap();
    assert_eq!(sent[0].to_email, "ana@example.com");
    assert_eq!(sent[0].total, dec!(2000));
}

#[tokio::test]
async fn duplicate_approved_signal_runs_side_effects_once() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;

    app.services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();
    let second = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::User)
        .await
        .unwrap();

    assert_eq!(second, ReconcileOutcome::NoChange { order_id });
    assert_eq!(stock_of(&app, product_id).await, 8);
    assert_eq!(app.mailer.sent_count(), 1);

    // Exactly one paid transition in the history.
    let history = app
        .services
        .order_status
        .get_history(order_id)
        .await
        .unwrap();
    let paid_entries = history
        .iter()
        .filter(|h| h.new_status == OrderStatus::Paid.to_string())
        .count();
    assert_eq!(paid_entries, 1);
}

#[tokio::test]
async fn rejected_signal_moves_order_to_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;

    let signal = GatewaySignal {
        external_reference: Some(order_id.to_string()),
        status: Some("rejected".to_string()),
        ..Default::default()
    };
    let outcome = app
        .services
        .reconciliation
        .reconcile(&signal, Actor::System)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Updated {
            order_id,
            new_status: OrderStatus::Rejected,
            first_time_paid: false,
        }
    );
    assert_eq!(stock_of(&app, product_id).await, 10);
    assert_eq!(app.mailer.sent_count(), 0);
}

#[tokio::test]
async fn pending_signal_on_pending_order_is_a_no_op() {
    let app = TestApp::new().await;
    let (order_id, _) = checkout_pending_order(&app).await;

    let signal = GatewaySignal {
        external_reference: Some(order_id.to_string()),
        status: Some("in_process".to_string()),
        ..Default::default()
    };
    let outcome = app
        .services
        .reconciliation
        .reconcile(&signal, Actor::User)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NoChange { order_id });

    let history = app
        .services
        .order_status
        .get_history(order_id)
        .await
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn unknown_gateway_status_leaves_the_order_but_records_payment_ids() {
    let app = TestApp::new().await;
    let (order_id, _) = checkout_pending_order(&app).await;

    let signal = GatewaySignal {
        external_reference: Some(order_id.to_string()),
        status: Some("charged_back".to_string()),
        payment_id: Some("pay-77".to_string()),
        ..Default::default()
    };
    let outcome = app
        .services
        .reconciliation
        .reconcile(&signal, Actor::System)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NoChange { order_id });

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending.to_string());
    assert_eq!(order.payment_id.as_deref(), Some("pay-77"));
}

#[tokio::test]
async fn terminal_orders_ignore_gateway_signals() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;

    app.services
        .order_status
        .update_status(order_id, OrderStatus::Cancelled, Actor::Admin, None)
        .await
        .unwrap();

    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NoChange { order_id });

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled.to_string());
    assert_eq!(stock_of(&app, product_id).await, 10);
}

#[tokio::test]
async fn unknown_order_is_a_soft_outcome() {
    let app = TestApp::new().await;

    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(Uuid::new_v4()), Actor::User)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::OrderNotFound);

    let blank = GatewaySignal::default();
    let outcome = app
        .services
        .reconciliation
        .reconcile(&blank, Actor::User)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::MissingReference);
}

#[tokio::test]
async fn compensated_order_can_still_be_paid_later() {
    let app = TestApp::new().await;
    let (order_id, product_id) = {
        let seeded = app.seed_product("p1", "Remera", dec!(1000), 5).await;
        app.gateway.set_failing(true);
        let err = app
            .services
            .checkout
            .submit_cart(CreateOrderRequest {
                items: vec![CartItemInput {
                    product_id: "p1".to_string(),
                    quantity: 1,
                    name: None,
                    sku: None,
                    unit_price: None,
                }],
                total: dec!(1000),
                payer_email: None,
                payer_name: None,
                payer_phone: None,
                user_id: None,
                idempotency_key: Some("cart-retry".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.code,
            storefront_api::errors::CheckoutCode::PreferenceFailed
        );
        let orders = storefront_api::entities::order::Entity::find()
            .all(&*app.db)
            .await
            .unwrap();
        (orders[0].id, seeded.id)
    };

    // The buyer paid through a stale checkout link; the webhook still lands.
    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Updated {
            order_id,
            new_status: OrderStatus::Paid,
            first_time_paid: true,
        }
    );
    assert_eq!(stock_of(&app, product_id).await, 4);
    // No payer email on the order, so no confirmation was attempted.
    assert_eq!(app.mailer.sent_count(), 0);
}

#[tokio::test]
async fn status_write_survives_a_failed_history_append() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;

    // Break the bookkeeping table; the payment itself must still land.
    app.db
        .execute_unprepared("DROP TABLE order_status_history")
        .await
        .unwrap();

    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Updated {
            new_status: OrderStatus::Paid,
            ..
        }
    ));

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid.to_string());
    assert_eq!(stock_of(&app, product_id).await, 8);
    assert_eq!(app.mailer.sent_count(), 1);
}

#[tokio::test]
async fn checkout_return_degrades_to_confirmation_on_reconcile_error() {
    let app = TestApp::new().await;
    let (order_id, _) = checkout_pending_order(&app).await;
    let router = app.router();

    // Force a database error inside reconcile. Child tables go first so
    // SQLite's foreign-key enforcement allows dropping `orders`.
    app.db
        .execute_unprepared("DROP TABLE order_status_history")
        .await
        .unwrap();
    app.db.execute_unprepared("DROP TABLE order_items").await.unwrap();
    app.db.execute_unprepared("DROP TABLE orders").await.unwrap();

    let uri = format!(
        "/api/v1/checkout/return?external_reference={}&status=approved",
        order_id
    );
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["orderId"], order_id.to_string());
    assert_eq!(json["message"], "Payment received; order confirmation pending");
}

#[tokio::test]
async fn mailer_failure_does_not_block_payment() {
    let app = TestApp::new().await;
    let (order_id, product_id) = checkout_pending_order(&app).await;
    app.mailer
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = app
        .services
        .reconciliation
        .reconcile(&approved(order_id), Actor::System)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Updated { .. }));

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid.to_string());
    assert_eq!(stock_of(&app, product_id).await, 8);
    assert_eq!(app.mailer.sent_count(), 0);
}

#[tokio::test]
async fn admin_transitions_respect_the_state_machine() {
    let app = TestApp::new().await;
    let (order_id, _) = checkout_pending_order(&app).await;

    // pending -> rejected is reserved for the gateway.
    let err = app
        .services
        .order_status
        .update_status(order_id, OrderStatus::Rejected, Actor::Admin, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot change order"));

    app.services
        .order_status
        .update_status(order_id, OrderStatus::Paid, Actor::Admin, None)
        .await
        .unwrap();
    app.services
        .order_status
        .update_status(
            order_id,
            OrderStatus::Fulfilled,
            Actor::Admin,
            Some("shipped".to_string()),
        )
        .await
        .unwrap();

    let err = app
        .services
        .order_status
        .update_status(order_id, OrderStatus::Pending, Actor::Admin, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot change order"));

    let history = app
        .services
        .order_status
        .get_history(order_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].note.as_deref(), Some("shipped"));
    assert_eq!(history[1].changed_by, "admin");
}
