//! Payment provider webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact payload,
//! so nothing may be parsed or re-serialized before verification.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use recap_billing::{
    IngestOutcome, WebhookHeaders, HEADER_WEBHOOK_ID, HEADER_WEBHOOK_SIGNATURE,
    HEADER_WEBHOOK_TIMESTAMP,
};
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /webhooks/payments`
///
/// Duplicates are acknowledged with the same 200 as fresh events.
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let webhook_headers = WebhookHeaders::from_parts(
        header(&headers, HEADER_WEBHOOK_ID),
        header(&headers, HEADER_WEBHOOK_SIGNATURE),
        header(&headers, HEADER_WEBHOOK_TIMESTAMP),
    )
    .inspect_err(|e| {
        tracing::warn!(error = %e, body_len = body.len(), "Rejected webhook without required headers");
    })?;

    check_rate_limit(&state, &webhook_headers.id).await?;

    match state.ingestor.ingest(&webhook_headers, &body).await {
        Ok(IngestOutcome::Accepted { .. }) | Ok(IngestOutcome::Duplicate { .. }) => {
            Ok(Json(WebhookAck { received: true }))
        }
        Err(e) => {
            if e.is_client_error() {
                tracing::warn!(
                    delivery_id = %webhook_headers.id,
                    body_len = body.len(),
                    error = %e,
                    "Rejected webhook delivery"
                );
            } else {
                tracing::error!(
                    delivery_id = %webhook_headers.id,
                    error = %e,
                    "Webhook ingestion failed"
                );
            }
            Err(e.into())
        }
    }
}

async fn check_rate_limit(state: &AppState, delivery_id: &str) -> ApiResult<()> {
    let key = format!("webhook:{delivery_id}");
    let result = state
        .rate_limiter
        .check(
            &key,
            state.config.webhook_rate_limit,
            state.config.webhook_rate_window,
        )
        .await;

    match result {
        Ok(result) if result.limited => {
            tracing::warn!(delivery_id = %delivery_id, "Webhook delivery rate limited");
            Err(ApiError::RateLimited {
                retry_after: result.retry_after_seconds(),
            })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            // Fail open: the limiter only dampens storms, dedup guards correctness
            tracing::warn!(error = %e, "Rate limiter unavailable, allowing request");
            Ok(())
        }
    }
}
