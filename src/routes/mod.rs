// ABOUTME: HTTP route composition and shared handler utilities
// ABOUTME: Assembles the session, task, message, and liveness routers over shared state
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Route composition. Every handler responds with the shared envelope and
//! runs its store/queue work under the configured request deadline.

pub mod messages;
pub mod sessions;
pub mod tasks;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::errors::{AppError, AppResult};
use crate::resources::ServerResources;

/// Run a handler future under the request deadline
///
/// # Errors
///
/// `DEADLINE_EXCEEDED` when the future does not settle in time.
pub(crate) async fn with_deadline<T>(
    seconds: u64,
    label: &str,
    future: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout(Duration::from_secs(seconds), future)
        .await
        .map_err(|_| AppError::deadline_exceeded(label))?
}

/// Build the full application router
#[must_use]
pub fn router(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(resources.clone())
        .merge(sessions::SessionRoutes::routes(resources.clone()))
        .merge(tasks::TaskRoutes::routes(resources.clone()))
        .merge(messages::MessageRoutes::routes(resources))
}

/// Liveness banner
async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "session-broker is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Component health
async fn health(State(resources): State<Arc<ServerResources>>) -> Json<serde_json::Value> {
    let report = resources.health.check().await;
    Json(serde_json::to_value(report).unwrap_or_else(|_| json!({"status": "unhealthy"})))
}
