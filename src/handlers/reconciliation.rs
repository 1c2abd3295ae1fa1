use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::order_status::{Actor, OrderStatus};
use crate::services::reconciliation::{GatewaySignal, ReconcileOutcome};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Buyer-facing reconciliation summary. Always returned with 200: the buyer
/// already paid (or not) on the gateway side, so this page must render a
/// confirmation even when our own lookup degrades.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/return",
    params(GatewaySignal),
    responses(
        (status = 200, description = "Reconciliation attempted; body describes the outcome", body = ReturnResponse)
    ),
    tag = "Checkout"
)]
pub async fn checkout_return(
    State(state): State<AppState>,
    Query(signal): Query<GatewaySignal>,
) -> impl IntoResponse {
    let outcome = state
        .services
        .reconciliation
        .reconcile(&signal, Actor::User)
        .await;

    let body = match outcome {
        Ok(ReconcileOutcome::Updated {
            order_id,
            new_status,
            ..
        }) => ReturnResponse {
            ok: true,
            order_id: Some(order_id),
            status: Some(new_status),
            message: None,
        },
        Ok(ReconcileOutcome::NoChange { order_id }) => ReturnResponse {
            ok: true,
            order_id: Some(order_id),
            status: None,
            message: None,
        },
        Ok(ReconcileOutcome::OrderNotFound) | Ok(ReconcileOutcome::MissingReference) => {
            ReturnResponse {
                ok: true,
                order_id: None,
                status: None,
                message: Some("Payment received; order confirmation pending".to_string()),
            }
        }
        Err(e) => {
            error!(error = %e, "Return reconciliation failed; degrading to confirmation page");
            ReturnResponse {
                ok: true,
                order_id: signal.order_id(),
                status: None,
                message: Some("Payment received; order confirmation pending".to_string()),
            }
        }
    };

    (StatusCode::OK, Json(body))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = &state.config.payment_webhook_secret {
        let tolerance = state.config.payment_webhook_tolerance_secs.unwrap_or(300);
        if !verify_signature(&headers, &body, secret, tolerance) {
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let signal: GatewaySignal = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    let outcome = state
        .services
        .reconciliation
        .reconcile(&signal, Actor::System)
        .await?;
    info!(outcome = ?outcome, "Webhook processed");

    Ok((StatusCode::OK, "ok"))
}

/// Accepts either separate `x-timestamp` + `x-signature` headers or a
/// composite `x-signature: ts=...,v1=...` header. The signed string is
/// `{timestamp}.{body}`.
fn verify_signature(headers: &HeaderMap, payload: &Bytes, secret: &str, tolerance_secs: u64) -> bool {
    let composite = headers
        .get("x-signature")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let (ts, sig) = if composite.contains("v1=") {
        let mut ts = "";
        let mut v1 = "";
        for part in composite.split(',') {
            let mut it = part.trim().splitn(2, '=');
            match (it.next(), it.next()) {
                (Some("ts"), Some(val)) => ts = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        (ts, v1)
    } else {
        let ts = headers
            .get("x-timestamp")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        (ts, composite)
    };

    if ts.is_empty() || sig.is_empty() {
        return false;
    }

    match ts.parse::<i64>() {
        Ok(ts_i) => {
            let now = chrono::Utc::now().timestamp();
            if (now - ts_i).unsigned_abs() > tolerance_secs {
                return false;
            }
        }
        Err(_) => return false,
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, sig)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
