//! Application state

use std::sync::Arc;

use recap_billing::{BillingResult, BillingStore, JobQueue, SignatureVerifier, WebhookIngestor};
use recap_shared::RateLimiter;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Audit reads for the admin routes
    pub store: Arc<dyn BillingStore>,
    pub ingestor: WebhookIngestor,
    /// Per-delivery-id throttle on the webhook endpoint
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Fails when the webhook secret cannot be used as an HMAC key
    pub fn new(
        config: Config,
        store: Arc<dyn BillingStore>,
        queue: Arc<dyn JobQueue>,
        rate_limiter: RateLimiter,
    ) -> BillingResult<Self> {
        let verifier = SignatureVerifier::new(&config.webhook_secret, config.webhook_tolerance)?;
        let ingestor = WebhookIngestor::new(store.clone(), queue, verifier, config.job_options);

        Ok(Self {
            config,
            store,
            ingestor,
            rate_limiter,
        })
    }
}
