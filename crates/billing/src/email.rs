//! Billing notification emails
//!
//! Two modes:
//! 1. Send via the Resend API when an API key is configured
//! 2. Disabled (log only)
//!
//! Sends are retried three times with exponential backoff. Callers treat a
//! final failure as non-fatal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

pub const DEFAULT_FROM: &str = "Recap <billing@recap.ai>";

/// Retries after the first attempt
const MAX_RETRIES: usize = 2;

/// Per-request timeout; keeps a hung send well inside the worker lease
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Message kinds the reconciler sends
#[derive(Debug, Clone, PartialEq)]
pub enum EmailTemplate {
    PaymentReceived {
        payment_id: String,
        amount_cents: i64,
        currency: Option<String>,
    },
    SubscriptionActivated {
        plan: Option<String>,
        next_billing_date: Option<OffsetDateTime>,
    },
}

impl EmailTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::PaymentReceived { .. } => "payment_received",
            EmailTemplate::SubscriptionActivated { .. } => "subscription_activated",
        }
    }

    fn subject(&self) -> String {
        match self {
            EmailTemplate::PaymentReceived { .. } => "Payment received - thank you!".to_string(),
            EmailTemplate::SubscriptionActivated { plan, .. } => match plan {
                Some(plan) => format!("Your Recap {} plan is active", display_plan(plan)),
                None => "Your Recap subscription is active".to_string(),
            },
        }
    }

    fn body_lines(&self) -> Vec<String> {
        match self {
            EmailTemplate::PaymentReceived {
                payment_id,
                amount_cents,
                currency,
            } => vec![
                format!(
                    "We received your payment of {}.",
                    format_amount(*amount_cents, currency.as_deref())
                ),
                format!("Payment reference: {payment_id}"),
            ],
            EmailTemplate::SubscriptionActivated {
                plan,
                next_billing_date,
            } => {
                let mut lines = vec![match plan {
                    Some(plan) => format!(
                        "Your {} subscription is now active. Enjoy your meetings!",
                        display_plan(plan)
                    ),
                    None => "Your subscription is now active. Enjoy your meetings!".to_string(),
                }];
                if let Some(date) = next_billing_date {
                    lines.push(format!("Your next billing date is {}.", format_date(*date)));
                }
                lines
            }
        }
    }

    fn render_text(&self) -> String {
        let mut text = self.body_lines().join("\n\n");
        text.push_str("\n\n- The Recap team\n");
        text
    }

    fn render_html(&self) -> String {
        let paragraphs: String = self
            .body_lines()
            .iter()
            .map(|line| format!("<p>{}</p>", escape_html(line)))
            .collect();
        format!("<!DOCTYPE html><html><body>{paragraphs}<p>- The Recap team</p></body></html>")
    }
}

fn display_plan(slug: &str) -> String {
    let mut chars = slug.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `1999, "usd"` -> `19.99 USD`
fn format_amount(cents: i64, currency: Option<&str>) -> String {
    let amount = format!("{}.{:02}", cents / 100, cents % 100);
    match currency {
        Some(c) if !c.is_empty() => format!("{amount} {}", c.to_uppercase()),
        _ => amount,
    }
}

fn format_date(date: OffsetDateTime) -> String {
    date.format(format_description!("[month repr:short] [day], [year]"))
        .unwrap_or_else(|_| date.date().to_string())
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Outbound notification capability
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, template: &EmailTemplate) -> BillingResult<()>;
}

#[derive(Clone)]
pub struct EmailConfig {
    /// Resend API key; `None` disables delivery
    pub api_key: Option<String>,
    pub from: String,
    pub api_url: String,
    /// Backoff multiplier in milliseconds: retries wait 2x then 4x this
    pub retry_factor_ms: u64,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .field("api_url", &self.api_url)
            .field("retry_factor_ms", &self.retry_factor_ms)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl EmailConfig {
    pub fn new(api_key: Option<String>, from: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            from: from.unwrap_or_else(|| DEFAULT_FROM.to_string()),
            api_url: RESEND_API_URL.to_string(),
            retry_factor_ms: 500,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Resend API request body
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
    html: String,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Email service for billing notifications
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http_client: Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        if config.api_key.is_none() {
            tracing::warn!("RESEND_API_KEY not set, billing emails will be logged only");
        }
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build email HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn send_once(&self, api_key: &str, to: &str, template: &EmailTemplate) -> BillingResult<()> {
        let request = ResendEmailRequest {
            from: &self.config.from,
            to: vec![to],
            subject: template.subject(),
            text: template.render_text(),
            html: template.render_html(),
        };

        let response = self
            .http_client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| BillingError::Email(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Email(format!("Resend returned {status}")));
        }

        match response.json::<ResendEmailResponse>().await {
            Ok(body) => tracing::debug!(email_id = %body.id, template = template.name(), "Email sent"),
            Err(e) => tracing::debug!(error = %e, "Email sent, response body unreadable"),
        }
        Ok(())
    }
}

#[async_trait]
impl EmailSender for BillingEmailService {
    async fn send(&self, to: &str, template: &EmailTemplate) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::info!(
                template = template.name(),
                "Email delivery disabled, skipping billing email"
            );
            return Ok(());
        };

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.retry_factor_ms)
            .take(MAX_RETRIES);

        Retry::spawn(strategy, move || async move {
            let result = self.send_once(api_key, to, template).await;
            if let Err(e) = &result {
                tracing::warn!(template = template.name(), error = %e, "Email attempt failed");
            }
            result
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn service(url: String) -> BillingEmailService {
        BillingEmailService::new(EmailConfig {
            api_key: Some("re_test".to_string()),
            from: DEFAULT_FROM.to_string(),
            api_url: url,
            retry_factor_ms: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
        .unwrap()
    }

    fn payment_template() -> EmailTemplate {
        EmailTemplate::PaymentReceived {
            payment_id: "pay_1".to_string(),
            amount_cents: 1999,
            currency: Some("usd".to_string()),
        }
    }

    #[tokio::test]
    async fn test_sends_through_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"to":["ada@example.com"],"subject":"Payment received - thank you!"}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        service(format!("{}/emails", server.url()))
            .send("ada@example.com", &payment_template())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_three_times_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let result = service(format!("{}/emails", server.url()))
            .send("ada@example.com", &payment_template())
            .await;

        assert!(matches!(result, Err(BillingError::Email(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_disabled_without_api_key() {
        let service =
            BillingEmailService::new(EmailConfig::new(Some("  ".to_string()), None)).unwrap();
        assert!(!service.is_enabled());
        assert!(service
            .send("ada@example.com", &payment_template())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_hung_provider_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let service = BillingEmailService::new(EmailConfig {
            api_key: Some("re_test".to_string()),
            from: DEFAULT_FROM.to_string(),
            api_url: format!("http://{addr}/emails"),
            retry_factor_ms: 0,
            request_timeout: Duration::from_millis(100),
        })
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.send("ada@example.com", &payment_template()),
        )
        .await
        .expect("send should give up on its own");

        assert!(matches!(result, Err(BillingError::Email(_))));
    }

    #[test]
    fn test_config_debug_redacts_api_key() {
        let config = EmailConfig::new(Some("re_live_secret".to_string()), None);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("re_live_secret"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_templates_render() {
        let text = payment_template().render_text();
        assert!(text.contains("19.99 USD"));
        assert!(text.contains("pay_1"));

        let activated = EmailTemplate::SubscriptionActivated {
            plan: Some("pro".to_string()),
            next_billing_date: Some(datetime!(2025-02-14 0:00 UTC)),
        };
        assert_eq!(activated.subject(), "Your Recap Pro plan is active");
        assert!(activated.render_text().contains("Feb 14, 2025"));
        assert!(activated.render_html().starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn test_html_is_escaped() {
        let template = EmailTemplate::PaymentReceived {
            payment_id: "<script>".to_string(),
            amount_cents: 5,
            currency: None,
        };
        let html = template.render_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("0.05"));
    }
}
