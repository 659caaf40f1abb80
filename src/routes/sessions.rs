// ABOUTME: Session route handlers for admission, completion, cancellation, and status queries
// ABOUTME: Front door for upstream task producers creating and finishing broker sessions
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Session routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::admission::{AdmissionOutcome, AdmissionRequest};
use crate::constants::platform::DEFAULT_PLATFORM;
use crate::database_plugins::StoreProvider;
use crate::dispatch::derive_send_url;
use crate::errors::{ApiResponse, AppError, AppResult};
use crate::models::TaskType;
use crate::resources::ServerResources;
use crate::routes::with_deadline;

// ============================================================================
// Request types
// ============================================================================

/// Create-session request from an upstream task producer
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub task_type: TaskType,
    pub external_task_id: String,
    pub send_content: String,
    #[serde(default)]
    pub platform: Option<String>,
    /// Legacy upstream priority tag; accepted and ignored
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub max_inactive_minutes: Option<i64>,
}

/// Complete-session request
#[derive(Debug, Deserialize)]
pub struct CompleteSessionRequest {
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ============================================================================
// Routes
// ============================================================================

/// Session routes handler
pub struct SessionRoutes;

impl SessionRoutes {
    /// Create all session routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/sessions/create", post(Self::create))
            .route("/api/sessions/:session_id/complete", post(Self::complete))
            .route("/api/sessions/:session_id/cancel", post(Self::cancel))
            .route("/api/sessions/:session_id/status", get(Self::status))
            .with_state(resources)
    }

    /// Admission: create a session (and its send-task for bot types)
    async fn create(
        State(resources): State<Arc<ServerResources>>,
        Json(request): Json<CreateSessionRequest>,
    ) -> AppResult<Json<ApiResponse>> {
        validate_non_empty("account_id", &request.account_id)?;
        validate_non_empty("shop_id", &request.shop_id)?;
        validate_non_empty("external_task_id", &request.external_task_id)?;

        let platform = request
            .platform
            .clone()
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_owned());
        let max_inactive_minutes = request.max_inactive_minutes.unwrap_or(
            if request.task_type.is_bot() {
                resources.config.session.default_bot_max_inactive_minutes
            } else {
                resources.config.session.default_human_max_inactive_minutes
            },
        );

        let send_url = derive_send_url(
            &resources.config.dispatch.send_url_template,
            &platform,
            &request.shop_id,
        );
        let admission_request = AdmissionRequest {
            account_id: request.account_id,
            shop_id: request.shop_id,
            shop_name: request.shop_name,
            platform,
            task_type: request.task_type,
            external_task_id: request.external_task_id,
            send_content: request.send_content,
            max_inactive_minutes,
        };

        let deadline = resources.config.dispatch.request_deadline_seconds;
        let outcome = with_deadline(deadline, "session admission", async {
            resources.admission.admit(&admission_request, send_url).await
        })
        .await?;

        match outcome {
            AdmissionOutcome::Accepted { session, task_id } => {
                if let Some(task_id) = task_id {
                    resources.dispatcher.enqueue(task_id).await;
                }
                Ok(Json(ApiResponse::ok(
                    "session created",
                    json!({
                        "session_id": session.session_id,
                        "external_task_id": session.external_task_id,
                        "task_type": session.task_type,
                        "created_at": session.created_at.to_rfc3339(),
                    }),
                )))
            }
            AdmissionOutcome::Duplicate { session } => Ok(Json(ApiResponse::ok(
                "session already exists for this external task",
                json!({
                    "session_id": session.session_id,
                    "external_task_id": session.external_task_id,
                    "task_type": session.task_type,
                    "created_at": session.created_at.to_rfc3339(),
                }),
            ))),
            AdmissionOutcome::Conflict {
                conflict_session_id,
                conflict_task_type,
            } => Err(AppError::unavailable(format!(
                "an active session occupies this account/shop pair ({conflict_task_type})"
            ))
            .with_data(json!({
                "conflict_session_id": conflict_session_id,
                "conflict_task_type": conflict_task_type,
            }))),
        }
    }

    /// Mark a session terminal; couples the send-task status flip
    async fn complete(
        State(resources): State<Arc<ServerResources>>,
        Path(session_id): Path<String>,
        Json(request): Json<CompleteSessionRequest>,
    ) -> AppResult<Json<ApiResponse>> {
        let now = Utc::now();
        let deadline = resources.config.dispatch.request_deadline_seconds;
        let state = with_deadline(deadline, "session completion", async {
            resources
                .sessions
                .complete(
                    &session_id,
                    request.success,
                    request.error_message.as_deref(),
                    now,
                )
                .await
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "session completion recorded",
            json!({
                "session_id": session_id,
                "success": request.success,
                "state": state,
                "completed_at": now.to_rfc3339(),
            }),
        )))
    }

    /// Abandon a PENDING or PAUSED session
    async fn cancel(
        State(resources): State<Arc<ServerResources>>,
        Path(session_id): Path<String>,
    ) -> AppResult<Json<ApiResponse>> {
        let now = Utc::now();
        let deadline = resources.config.dispatch.request_deadline_seconds;
        with_deadline(deadline, "session cancel", async {
            resources.sessions.cancel(&session_id, now).await
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "session cancelled",
            json!({ "session_id": session_id, "cancelled_at": now.to_rfc3339() }),
        )))
    }

    /// Combined session and task status view
    async fn status(
        State(resources): State<Arc<ServerResources>>,
        Path(session_id): Path<String>,
    ) -> AppResult<Json<ApiResponse>> {
        let deadline = resources.config.dispatch.request_deadline_seconds;
        let (session, task) = with_deadline(deadline, "session status", async {
            let session = resources.sessions.require_session(&session_id).await?;
            let task = resources.store.latest_task_for_session(&session_id).await?;
            Ok((session, task))
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "session status",
            json!({
                "session_id": session.session_id,
                "account_id": session.account_id,
                "shop_id": session.shop_id,
                "task_type": session.task_type,
                "state": session.state,
                "priority": session.priority,
                "message_count": session.message_count,
                "external_task_id": session.external_task_id,
                "created_at": session.created_at.to_rfc3339(),
                "last_activity_at": session.last_activity_at.to_rfc3339(),
                "transferred_at": session.transferred_at.map(|t| t.to_rfc3339()),
                "transfer_reason": session.transfer_reason,
                "task": task.map(|t| json!({
                    "task_id": t.task_id,
                    "status": t.status,
                    "created_at": t.created_at.to_rfc3339(),
                    "finished_at": t.finished_at.map(|f| f.to_rfc3339()),
                })),
            }),
        )))
    }
}

fn validate_non_empty(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}
