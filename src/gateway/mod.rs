use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;

/// Line item sent to the payment gateway when creating a preference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferenceItem {
    pub id: String,
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct PreferencePayer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreferenceRequest {
    pub order_id: Uuid,
    pub items: Vec<PreferenceItem>,
    pub payer: Option<PreferencePayer>,
}

/// Result of a successful preference creation. The gateway may omit either
/// redirect URL depending on the account mode.
#[derive(Debug, Clone)]
pub struct CreatedPreference {
    pub preference_id: String,
    pub init_point: Option<String>,
    pub sandbox_init_point: Option<String>,
}

/// Port for the hosted-checkout payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError>;
}

#[derive(Serialize)]
struct WirePhone {
    number: String,
}

#[derive(Serialize)]
struct WirePayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<WirePhone>,
}

#[derive(Serialize)]
struct WireBackUrls {
    success: String,
    failure: String,
    pending: String,
}

#[derive(Serialize)]
struct WirePreferenceBody<'a> {
    items: &'a [PreferenceItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<WirePayer>,
    back_urls: WireBackUrls,
    auto_return: &'static str,
    external_reference: String,
}

#[derive(Deserialize)]
struct WirePreferenceResponse {
    id: Option<String>,
    init_point: Option<String>,
    sandbox_init_point: Option<String>,
}

/// Error carrying the upstream HTTP status and the raw response body, which
/// for gateway rejections is often plain text rather than JSON.
fn gateway_rejection(status: reqwest::StatusCode, raw_body: &str) -> ServiceError {
    let detail = raw_body.trim();
    let detail = if detail.is_empty() {
        "no response body"
    } else {
        detail
    };
    ServiceError::GatewayError(format!("Gateway returned {}: {}", status, detail))
}

/// HTTP client for the MercadoPago checkout-preferences API.
pub struct MercadoPagoClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    public_base_url: String,
}

impl MercadoPagoClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        public_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to build gateway HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self, ServiceError> {
        Self::new(
            config.gateway_base_url.clone(),
            config.gateway_access_token.clone(),
            config.public_base_url.clone(),
            Duration::from_secs(config.gateway_timeout_secs),
        )
    }

    fn build_payer(payer: &PreferencePayer) -> Option<WirePayer> {
        let phone_digits = normalize_phone(payer.phone.as_deref());
        let name = payer
            .name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        let email = payer
            .email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        if name.is_none() && email.is_none() && phone_digits.is_none() {
            return None;
        }
        Some(WirePayer {
            name,
            email,
            phone: phone_digits.map(|number| WirePhone { number }),
        })
    }
}

/// Strips non-digit characters from a phone number; all-symbol or empty
/// input counts as absent.
fn normalize_phone(raw: Option<&str>) -> Option<String> {
    let digits: String = raw?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError> {
        let body = WirePreferenceBody {
            items: &request.items,
            payer: request.payer.as_ref().and_then(Self::build_payer),
            back_urls: WireBackUrls {
                success: format!("{}/checkout/success", self.public_base_url),
                failure: format!("{}/checkout", self.public_base_url),
                pending: format!("{}/checkout", self.public_base_url),
            },
            auto_return: "approved",
            external_reference: request.order_id.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gateway request failed: {}", e);
                ServiceError::GatewayError(format!("Preference request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            error!(status = %status, body = %raw, "Gateway rejected preference");
            return Err(gateway_rejection(status, &raw));
        }

        let payload: WirePreferenceResponse = response.json().await.map_err(|e| {
            error!("Gateway response was not valid JSON: {}", e);
            ServiceError::GatewayError(format!("Invalid gateway response: {}", e))
        })?;

        let preference_id = payload.id.filter(|id| !id.is_empty()).ok_or_else(|| {
            error!("Gateway response missing preference id");
            ServiceError::GatewayError("Gateway response missing preference id".to_string())
        })?;

        Ok(CreatedPreference {
            preference_id,
            init_point: payload.init_point.filter(|s| !s.is_empty()),
            sandbox_init_point: payload.sandbox_init_point.filter(|s| !s.is_empty()),
        })
    }
}
