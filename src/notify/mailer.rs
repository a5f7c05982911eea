//! HTTP mail-API dispatcher.
//!
//! Posts fulfillment emails to an HTTP mail provider; the raw SMTP hop is
//! the provider's concern. When disabled (the default, and the fallback
//! when no endpoint is configured) deliveries are logged and skipped so
//! the rest of the pipeline can run without credentials.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Notifier;
use crate::catalog::GiftCard;
use crate::config::MailerConfig;
use crate::error::{Error, Result};
use crate::order::Order;

/// Fulfillment mailer backed by an HTTP mail API.
pub struct HttpMailer {
    config: MailerConfig,
    client: Option<reqwest::Client>,
}

impl HttpMailer {
    /// Create a new mailer from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to initialize.
    pub fn new(config: MailerConfig) -> Result<Self> {
        if !config.enabled {
            info!("mailer disabled - fulfillment emails will be logged, not sent");
            return Ok(Self {
                config,
                client: None,
            });
        }

        if config.api_url.is_empty() {
            warn!("no mail API endpoint configured - mailer disabled");
            return Ok(Self {
                config: MailerConfig {
                    enabled: false,
                    ..config
                },
                client: None,
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Notify(format!("failed to build mail client: {e}")))?;

        info!("mailer ready ({})", config.api_url);
        Ok(Self {
            config,
            client: Some(client),
        })
    }

    /// Check whether the mailer will actually send mail.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn dispatch(&self, email: &str, card: &GiftCard, order: &Order) -> Result<()> {
        let Some(client) = &self.client else {
            info!(
                "mailer disabled, skipping delivery of order {} to {email}",
                order.order_id
            );
            return Ok(());
        };

        let message = serde_json::json!({
            "from": self.config.from_address,
            "to": email,
            "subject": format!("Your {} gift card", card.brand),
            "html": fulfillment_html(email, card),
        });

        let mut request = client.post(&self.config.api_url).json(&message);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Notify(format!("mail API request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Notify(format!(
                "mail API returned {}",
                response.status()
            )));
        }

        info!("gift card email for order {} sent to {email}", order.order_id);
        Ok(())
    }
}

/// Render the fulfillment email body.
fn fulfillment_html(email: &str, card: &GiftCard) -> String {
    let recipient = email.split('@').next().unwrap_or(email);
    format!(
        "<h2>Hi {recipient},</h2>\
         <p>Thank you for your payment! Here is your verified gift card.</p>\
         <p><strong>Brand:</strong> {brand}</p>\
         <p><strong>Value:</strong> \u{20b9}{value}</p>\
         <p><strong>Expiry:</strong> {expiry}</p>\
         <img src=\"{image}\" alt=\"{brand}\" width=\"300\"/>\
         <p><a href=\"{image}\" download>Download your gift card</a></p>",
        brand = card.brand,
        value = card.value_inr,
        expiry = card.expiry,
        image = card.image_url,
    )
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn test_card() -> GiftCard {
        GiftCard {
            id: 1,
            brand: "EasyMyTrip Hotels Gift Card".to_string(),
            value_inr: 500,
            payable_inr: 470,
            expiry: "22 Oct 2026".to_string(),
            image_url: "https://cards.example/easymytrip.png".to_string(),
            upi_id: "merchant@oksbi".to_string(),
        }
    }

    #[tokio::test]
    async fn test_disabled_mailer_skips_delivery() {
        let mailer = HttpMailer::new(MailerConfig::default()).expect("mailer");
        assert!(!mailer.is_enabled());

        let card = test_card();
        let order = Order::new("a@x.com", &card);
        mailer
            .dispatch("a@x.com", &card, &order)
            .await
            .expect("skip");
    }

    #[tokio::test]
    async fn test_enabled_without_endpoint_falls_back_to_disabled() {
        let config = MailerConfig {
            enabled: true,
            ..MailerConfig::default()
        };
        let mailer = HttpMailer::new(config).expect("mailer");
        assert!(!mailer.is_enabled());
    }

    #[test]
    fn test_fulfillment_html_names_the_buyer_and_card() {
        let html = fulfillment_html("asha@x.com", &test_card());

        assert!(html.contains("Hi asha,"));
        assert!(html.contains("EasyMyTrip Hotels Gift Card"));
        assert!(html.contains("\u{20b9}500"));
        assert!(html.contains("22 Oct 2026"));
        assert!(html.contains("https://cards.example/easymytrip.png"));
    }
}
