use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema, Set,
};
use uuid::Uuid;

use storefront_api::config::AppConfig;
use storefront_api::entities::{order, order_item, order_status_history, product};
use storefront_api::errors::ServiceError;
use storefront_api::gateway::{CreatedPreference, PaymentGateway, PreferenceRequest};
use storefront_api::handlers::AppServices;
use storefront_api::notifications::{ConfirmationEmail, Mailer};
use storefront_api::services::checkout::CheckoutService;
use storefront_api::services::inventory::InventoryService;
use storefront_api::services::order_status::OrderStatusService;
use storefront_api::services::orders::OrderService;
use storefront_api::services::reconciliation::ReconciliationService;
use storefront_api::{api_v1_routes, AppState};

/// Configuration double for route-level tests; no secrets, no admin token.
pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        auto_migrate: false,
        cors_allowed_origins: None,
        cors_allow_any_origin: false,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_idle_timeout_secs: 60,
        db_acquire_timeout_secs: 5,
        public_base_url: "http://localhost:3000".to_string(),
        gateway_access_token: "test-token".to_string(),
        gateway_base_url: "https://gw.test".to_string(),
        gateway_timeout_secs: 5,
        payment_webhook_secret: None,
        payment_webhook_tolerance_secs: None,
        admin_api_token: None,
        mailer_endpoint: None,
        mailer_from: None,
        mailer_from_name: "Store".to_string(),
    }
}

/// Payment gateway double: records every request and can be switched into
/// failure mode per test.
#[derive(Default)]
pub struct MockGateway {
    pub fail: AtomicBool,
    counter: AtomicUsize,
    pub requests: Mutex<Vec<PreferenceRequest>>,
}

impl MockGateway {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayError("gateway unavailable".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedPreference {
            preference_id: format!("pref-{}", n),
            init_point: Some(format!("https://gw.test/init/{}", n)),
            sandbox_init_point: Some(format!("https://gw.test/sandbox/{}", n)),
        })
    }
}

/// Mailer double that records sent confirmations.
#[derive(Default)]
pub struct RecordingMailer {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<ConfirmationEmail>>,
}

impl RecordingMailer {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<(), ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::InternalError("smtp down".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub services: AppServices,
    pub gateway: Arc<MockGateway>,
    pub mailer: Arc<RecordingMailer>,
}

impl TestApp {
    pub async fn new() -> Self {
        // Single connection so every query sees the same in-memory database.
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options)
            .await
            .expect("in-memory sqlite connect");

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        for stmt in [
            schema.create_table_from_entity(product::Entity),
            schema.create_table_from_entity(order::Entity),
            schema.create_table_from_entity(order_item::Entity),
            schema.create_table_from_entity(order_status_history::Entity),
        ] {
            db.execute(backend.build(&stmt))
                .await
                .expect("create table");
        }

        let db = Arc::new(db);
        let gateway = Arc::new(MockGateway::default());
        let mailer = Arc::new(RecordingMailer::default());

        let orders = OrderService::new(db.clone(), None);
        let order_status = OrderStatusService::new(db.clone(), None);
        let inventory = InventoryService::new(db.clone(), None);
        let checkout = CheckoutService::new(orders.clone(), gateway.clone(), None);
        let reconciliation = ReconciliationService::new(
            db.clone(),
            orders.clone(),
            inventory.clone(),
            mailer.clone(),
            None,
        );

        Self {
            db,
            services: AppServices {
                orders,
                order_status,
                inventory,
                checkout,
                reconciliation,
            },
            gateway,
            mailer,
        }
    }

    /// Builds the `/api/v1` router over this app's services, for tests that
    /// exercise handler behavior rather than the services directly.
    pub fn router(&self) -> Router {
        let state = AppState {
            db: self.db.clone(),
            config: Arc::new(test_config()),
            event_sender: None,
            services: self.services.clone(),
        };
        Router::new()
            .nest("/api/v1", api_v1_routes())
            .with_state(state)
    }

    pub async fn seed_product(
        &self,
        sku: &str,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(sku.to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }
}
