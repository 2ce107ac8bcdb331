//! Delayed notification routes.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::{Channels, NotificationStatus};

use crate::state::AppState;

pub const MAX_BODY_CHARS: usize = 1000;
pub const MAX_DELAY_SECONDS: u64 = 30 * 24 * 60 * 60;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notify", post(create_notification))
        .route(
            "/notify/{id}",
            get(get_notification_status).delete(delete_notification),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    #[serde(alias = "notification")]
    pub body: String,
    pub delay_seconds: u64,
    #[serde(default)]
    pub channels: Channels,
}

impl CreateNotificationRequest {
    fn validate(&self) -> Result<(), AppError> {
        let chars = self.body.chars().count();
        if chars == 0 || chars > MAX_BODY_CHARS {
            return Err(AppError::Validation(format!(
                "body must be between 1 and {} characters",
                MAX_BODY_CHARS
            )));
        }
        if !(1..=MAX_DELAY_SECONDS).contains(&self.delay_seconds) {
            return Err(AppError::Validation(format!(
                "delay_seconds must be between 1 and {}",
                MAX_DELAY_SECONDS
            )));
        }
        if self.channels.targets().is_empty() {
            return Err(AppError::Validation(
                "at least one channel (email or telegram) is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct CreateNotificationResponse {
    pub id: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NotificationStatusResponse {
    pub id: String,
    pub status: NotificationStatus,
}

/// POST /notify: schedule a notification for later delivery.
async fn create_notification(
    State(state): State<AppState>,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<CreateNotificationResponse>), AppError> {
    request.validate()?;

    let notification = state
        .scheduler
        .schedule(
            request.body,
            Duration::from_secs(request.delay_seconds),
            request.channels,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateNotificationResponse {
            id: notification.id,
            due_at: notification.due_at,
        }),
    ))
}

/// GET /notify/{id}: current delivery status.
async fn get_notification_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NotificationStatusResponse>, AppError> {
    let status = state.scheduler.get_status(&id).await?;
    Ok(Json(NotificationStatusResponse { id, status }))
}

/// DELETE /notify/{id}: cancel a notification that has not been dispatched.
async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.scheduler.remove(&id).await?;
    Ok(Json(json!({ "deleted": true })))
}
