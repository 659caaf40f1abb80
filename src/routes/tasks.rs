// ABOUTME: Task route handlers serving RPA workers popping and fetching send work
// ABOUTME: Queue pop, payload fetch with SENT flip, explicit retry, and pending-task listing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Task routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{ApiResponse, AppResult};
use crate::resources::ServerResources;
use crate::routes::with_deadline;

/// Listing query
#[derive(Debug, Deserialize)]
pub struct PendingTasksQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

const fn default_limit() -> i64 {
    10
}

/// Task routes handler
pub struct TaskRoutes;

impl TaskRoutes {
    /// Create all task routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/tasks/next_id", get(Self::next_id))
            .route("/api/tasks/:task_id/send_info", get(Self::send_info))
            .route("/api/tasks/:task_id/retry", post(Self::retry))
            .route("/api/tasks/pending", get(Self::pending))
            .with_state(resources)
    }

    /// Non-blocking queue pop
    async fn next_id(
        State(resources): State<Arc<ServerResources>>,
    ) -> AppResult<Json<ApiResponse>> {
        let deadline = resources.config.dispatch.request_deadline_seconds;
        let task_id = with_deadline(deadline, "queue pop", async {
            resources.dispatcher.next_task_id().await
        })
        .await?;

        match task_id {
            Some(task_id) => Ok(Json(ApiResponse::ok(
                "task popped",
                json!({
                    "task_id": task_id,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            ))),
            None => Ok(Json(ApiResponse::soft_failure(
                "no pending tasks",
                json!({ "task_id": null }),
            ))),
        }
    }

    /// Payload fetch; first read flips the task to SENT
    async fn send_info(
        State(resources): State<Arc<ServerResources>>,
        Path(task_id): Path<i64>,
    ) -> AppResult<Json<ApiResponse>> {
        let deadline = resources.config.dispatch.request_deadline_seconds;
        let info = with_deadline(deadline, "send-info fetch", async {
            resources.dispatcher.get_send_info(task_id).await
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "send info",
            json!({
                "send_content": info.send_content,
                "send_url": info.send_url,
                "shop_name": info.shop_name,
            }),
        )))
    }

    /// Explicit retry of a FAILED task
    async fn retry(
        State(resources): State<Arc<ServerResources>>,
        Path(task_id): Path<i64>,
    ) -> AppResult<Json<ApiResponse>> {
        let deadline = resources.config.dispatch.request_deadline_seconds;
        with_deadline(deadline, "task retry", async {
            resources.dispatcher.retry(task_id).await
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "task re-queued",
            json!({ "task_id": task_id }),
        )))
    }

    /// PENDING tasks with their session context
    async fn pending(
        State(resources): State<Arc<ServerResources>>,
        Query(query): Query<PendingTasksQuery>,
    ) -> AppResult<Json<ApiResponse>> {
        let deadline = resources.config.dispatch.request_deadline_seconds;
        let rows = with_deadline(deadline, "pending-task listing", async {
            resources.dispatcher.pending_tasks(query.limit).await
        })
        .await?;

        let tasks: Vec<serde_json::Value> = rows
            .iter()
            .map(|(task, session)| {
                json!({
                    "task_id": task.task_id,
                    "session_id": task.session_id,
                    "external_task_id": task.external_task_id,
                    "send_content": task.send_content,
                    "created_at": task.created_at.to_rfc3339(),
                    "account_id": session.account_id,
                    "shop_id": session.shop_id,
                    "session_state": session.state,
                    "priority": session.priority,
                })
            })
            .collect();

        Ok(Json(ApiResponse::ok(
            "pending tasks",
            json!({
                "tasks": tasks,
                "count": tasks.len(),
                "limit": query.limit,
            }),
        )))
    }
}
