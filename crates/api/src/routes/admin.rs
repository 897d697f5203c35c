//! Webhook audit routes
//!
//! Protected by a static bearer token. When `ADMIN_API_TOKEN` is unset the
//! routes answer 404 as if they did not exist.

use axum::{
    extract::{Path, Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use recap_billing::{WebhookEvent, WebhookEventFilter, WebhookStatus};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        return ApiError::NotFound("Not found".to_string()).into_response();
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .unwrap_or_default();

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Admin request with invalid token");
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}

#[derive(Debug, Deserialize)]
pub struct ListWebhookEventsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookEventResponse {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub status: WebhookStatus,
    pub payload: serde_json::Value,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<WebhookEvent> for WebhookEventResponse {
    fn from(event: WebhookEvent) -> Self {
        Self {
            id: event.id,
            provider_event_id: event.provider_event_id,
            event_type: event.event_type,
            status: event.status,
            payload: event.payload,
            error_message: event.error_message,
            processed_at: event.processed_at,
            created_at: event.created_at,
            updated_at: event.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookEventListResponse {
    pub events: Vec<WebhookEventResponse>,
    pub limit: i64,
    pub offset: i64,
}

/// `GET /admin/webhooks?status=&limit=&offset=`, newest first
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<ListWebhookEventsQuery>,
) -> ApiResult<Json<WebhookEventListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<WebhookStatus>)
        .transpose()
        .map_err(|_| ApiError::BadRequest("status must be received, completed or failed".into()))?;

    let filter = WebhookEventFilter::new(status, query.limit, query.offset);
    let (limit, offset) = (filter.limit, filter.offset);
    let events = state.store.list_webhook_events(filter).await?;

    Ok(Json(WebhookEventListResponse {
        events: events.into_iter().map(Into::into).collect(),
        limit,
        offset,
    }))
}

/// `POST /admin/webhooks/{id}/replay`
///
/// Completed events, and events whose job is still queued or running, are
/// refused with 409.
pub async fn replay_webhook_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookEventResponse>> {
    let event = state.ingestor.replay(id).await?;
    tracing::info!(event_id = %event.id, "Admin replayed webhook event");
    Ok(Json(event.into()))
}
