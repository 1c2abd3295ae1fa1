use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio::signal;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info};

use storefront_api::config::{init_tracing, load_config};
use storefront_api::db::{establish_connection_from_app_config, run_migrations};
use storefront_api::gateway::MercadoPagoClient;
use storefront_api::handlers::AppServices;
use storefront_api::notifications::{HttpMailer, Mailer, NoopMailer};
use storefront_api::services::checkout::CheckoutService;
use storefront_api::services::inventory::InventoryService;
use storefront_api::services::order_status::OrderStatusService;
use storefront_api::services::orders::OrderService;
use storefront_api::services::reconciliation::ReconciliationService;
use storefront_api::{api_status, events, health_check, openapi, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = load_config()?;
    init_tracing(cfg.log_level(), cfg.log_json);

    info!(environment = %cfg.environment, "Starting storefront API");

    let db = Arc::new(establish_connection_from_app_config(&cfg).await?);
    if cfg.auto_migrate {
        info!("Running database migrations");
        run_migrations(&db).await?;
    }

    let (event_sender, event_receiver) = events::channel();
    let event_sender = Arc::new(event_sender);
    tokio::spawn(events::process_events(event_receiver));

    let gateway = Arc::new(MercadoPagoClient::from_app_config(&cfg)?);
    let mailer: Arc<dyn Mailer> = match HttpMailer::from_app_config(&cfg)? {
        Some(mailer) => Arc::new(mailer),
        None => Arc::new(NoopMailer),
    };

    let orders = OrderService::new(db.clone(), Some(event_sender.clone()));
    let order_status = OrderStatusService::new(db.clone(), Some(event_sender.clone()));
    let inventory = InventoryService::new(db.clone(), Some(event_sender.clone()));
    let checkout = CheckoutService::new(orders.clone(), gateway, Some(event_sender.clone()));
    let reconciliation = ReconciliationService::new(
        db.clone(),
        orders.clone(),
        inventory.clone(),
        mailer,
        Some(event_sender.clone()),
    );

    let state = AppState {
        db,
        config: Arc::new(cfg.clone()),
        event_sender: Some(event_sender),
        services: AppServices {
            orders,
            order_status,
            inventory,
            checkout,
            reconciliation,
        },
    };

    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.should_allow_permissive_cors() {
        info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        CorsLayer::permissive()
    } else {
        error!("Missing CORS configuration; set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
        return Err(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
                .into(),
        );
    };

    let app = Router::<AppState>::new()
        .route("/", get(|| async { "storefront-api up" }))
        .route("/health", get(health_check))
        .route("/status", get(api_status))
        .nest("/api/v1", storefront_api::api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(storefront_api::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors_layer)
        .layer(axum::middleware::from_fn(
            storefront_api::tracing::request_id_middleware,
        ))
        .with_state(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
