use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;

/// One line of an order confirmation email.
#[derive(Debug, Clone)]
pub struct ConfirmationLine {
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

/// Order confirmation message, rendered once and handed to a [`Mailer`].
#[derive(Debug, Clone)]
pub struct ConfirmationEmail {
    pub order_id: Uuid,
    pub to_email: String,
    pub payer_name: Option<String>,
    pub lines: Vec<ConfirmationLine>,
    pub total: Decimal,
}

impl ConfirmationEmail {
    pub fn subject(&self) -> String {
        format!("Order confirmation #{}", self.order_id)
    }

    pub fn render_html(&self) -> String {
        let rows: String = self
            .lines
            .iter()
            .map(|line| {
                format!(
                    "<tr>\
                     <td style=\"padding:8px;border-bottom:1px solid #eee\">{}</td>\
                     <td style=\"padding:8px;border-bottom:1px solid #eee;text-align:center\">{}</td>\
                     <td style=\"padding:8px;border-bottom:1px solid #eee;text-align:right\">{}</td>\
                     <td style=\"padding:8px;border-bottom:1px solid #eee;text-align:right\">{}</td>\
                     </tr>",
                    escape_html(&line.name),
                    line.quantity,
                    format_money(line.unit_price),
                    format_money(line.subtotal),
                )
            })
            .collect();

        let greeting = match &self.payer_name {
            Some(name) => format!("Hi {},", escape_html(name)),
            None => "Hi,".to_string(),
        };

        format!(
            "<!DOCTYPE html>\
             <html>\
             <head><meta charset=\"utf-8\"><title>Order confirmation</title></head>\
             <body style=\"font-family:sans-serif;max-width:560px;margin:0 auto;padding:20px;color:#333\">\
             <h2 style=\"color:#111\">Your order is confirmed</h2>\
             <p>{}</p>\
             <p>We received your order. Details:</p>\
             <table style=\"width:100%;border-collapse:collapse;margin:16px 0\">\
             <thead><tr style=\"background:#f5f5f5\">\
             <th style=\"padding:8px;text-align:left\">Product</th>\
             <th style=\"padding:8px;text-align:center\">Qty</th>\
             <th style=\"padding:8px;text-align:right\">Unit price</th>\
             <th style=\"padding:8px;text-align:right\">Subtotal</th>\
             </tr></thead>\
             <tbody>{}</tbody>\
             </table>\
             <p style=\"font-size:1.1em;font-weight:bold\">Total: {}</p>\
             <p style=\"color:#666;font-size:0.9em\">Order number: <strong>{}</strong>. Keep it for any inquiry.</p>\
             <p style=\"margin-top:24px\">Thanks for your purchase.</p>\
             </body>\
             </html>",
            greeting,
            rows,
            format_money(self.total),
            self.order_id,
        )
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Order confirmation\n\n");
        out.push_str(&format!("Order number: {}\n", self.order_id));
        if let Some(name) = &self.payer_name {
            out.push_str(&format!("Hi {},\n", name));
        }
        out.push_str("\nDetails:\n");
        for line in &self.lines {
            out.push_str(&format!(
                "- {} x {} = {}\n",
                line.name,
                line.quantity,
                format_money(line.subtotal)
            ));
        }
        out.push_str(&format!("\nTotal: {}\n\nThanks for your purchase.\n", format_money(self.total)));
        out
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_money(value: Decimal) -> String {
    format!("$ {:.2}", value)
}

/// Port for outbound transactional email. Implementations report failure
/// through the Result; callers decide whether delivery is best-effort.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<(), ServiceError>;
}

#[derive(Serialize)]
struct WireEmail<'a> {
    from: String,
    to: &'a str,
    subject: String,
    html: String,
    text: String,
}

/// Delivers mail through an HTTP transactional-email API endpoint.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    from_email: String,
    from_name: String,
}

impl HttpMailer {
    pub fn new(
        endpoint: impl Into<String>,
        from_email: impl Into<String>,
        from_name: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to build mailer HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            from_email: from_email.into(),
            from_name: from_name.into(),
        })
    }

    /// Builds a mailer from configuration, or a [`NoopMailer`] fallback when
    /// no endpoint is configured.
    pub fn from_app_config(config: &AppConfig) -> Result<Option<Self>, ServiceError> {
        match (&config.mailer_endpoint, &config.mailer_from) {
            (Some(endpoint), Some(from)) => Ok(Some(Self::new(
                endpoint.clone(),
                from.clone(),
                config.mailer_from_name.clone(),
            )?)),
            _ => {
                warn!("Mailer endpoint not configured; confirmation emails disabled");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    #[instrument(skip(self, email), fields(order_id = %email.order_id))]
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<(), ServiceError> {
        let to = email.to_email.trim();
        if to.is_empty() {
            return Err(ServiceError::ValidationError(
                "Recipient email is empty".to_string(),
            ));
        }

        let body = WireEmail {
            from: format!("\"{}\" <{}>", self.from_name, self.from_email),
            to,
            subject: email.subject(),
            html: email.render_html(),
            text: email.render_text(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Mailer request failed: {}", e);
                ServiceError::InternalError(format!("Mailer request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            error!(status = %status, "Mailer endpoint rejected message");
            return Err(ServiceError::InternalError(format!(
                "Mailer endpoint returned {}",
                status
            )));
        }

        info!(to = %to, "Confirmation email sent");
        Ok(())
    }
}

/// Mailer that silently drops messages. Used when email is not configured.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<(), ServiceError> {
        info!(order_id = %email.order_id, "Email disabled; skipping confirmation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_email() -> ConfirmationEmail {
        ConfirmationEmail {
            order_id: Uuid::nil(),
            to_email: "ana@example.com".to_string(),
            payer_name: Some("Ana <Admin>".to_string()),
            lines: vec![ConfirmationLine {
                name: "Mate & Bombilla".to_string(),
                quantity: 2,
                unit_price: dec!(1000),
                subtotal: dec!(2000),
            }],
            total: dec!(2000),
        }
    }

    #[test]
    fn html_escapes_user_supplied_fields() {
        let html = sample_email().render_html();
        assert!(html.contains("Ana &lt;Admin&gt;"));
        assert!(html.contains("Mate &amp; Bombilla"));
        assert!(!html.contains("<Admin>"));
    }

    #[test]
    fn text_version_lists_items_and_total() {
        let text = sample_email().render_text();
        assert!(text.contains("- Mate & Bombilla x 2 = $ 2000.00"));
        assert!(text.contains("Total: $ 2000.00"));
    }
}
