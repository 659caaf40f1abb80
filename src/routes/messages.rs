// ABOUTME: Message route handlers accepting inbound batches from the RPA receiver
// ABOUTME: Feeds the ingestion pipeline and returns the batch summary envelope
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Message routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::constants::platform::DEFAULT_PLATFORM;
use crate::errors::{ApiResponse, AppError, AppResult};
use crate::ingest::{IngestBatch, RawBatchMessage};
use crate::resources::ServerResources;
use crate::routes::with_deadline;

/// Inbound message batch
#[derive(Debug, Deserialize)]
pub struct MessageBatchRequest {
    pub shop_name: String,
    /// Separate shop key; falls back to `shop_name` when the receiver does
    /// not know it
    #[serde(default)]
    pub shop_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    /// Batch-level account override for batches without a `t-` nick
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub max_inactive_minutes: Option<i64>,
    pub messages: Vec<RawBatchMessage>,
}

/// Message routes handler
pub struct MessageRoutes;

impl MessageRoutes {
    /// Create all message routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/messages/batch", post(Self::batch))
            .with_state(resources)
    }

    /// Ingest one batch for a single `(account, shop)` pair
    async fn batch(
        State(resources): State<Arc<ServerResources>>,
        Json(request): Json<MessageBatchRequest>,
    ) -> AppResult<Json<ApiResponse>> {
        if request.shop_name.trim().is_empty() {
            return Err(AppError::validation("shop_name must not be empty"));
        }
        if request.messages.is_empty() {
            return Err(AppError::validation("messages must not be empty"));
        }

        let batch = IngestBatch {
            shop_id: request
                .shop_id
                .clone()
                .unwrap_or_else(|| request.shop_name.clone()),
            shop_name: request.shop_name,
            platform: request
                .platform
                .unwrap_or_else(|| DEFAULT_PLATFORM.to_owned()),
            account_override: request.account_id,
            max_inactive_minutes: request.max_inactive_minutes,
            messages: request.messages,
        };

        let deadline = resources.config.dispatch.request_deadline_seconds;
        let summary = with_deadline(deadline, "message ingestion", async {
            resources.ingestor.ingest(&batch, Utc::now()).await
        })
        .await?;

        Ok(Json(ApiResponse::ok(
            "message batch processed",
            json!({
                "processed": summary.processed,
                "skipped": summary.skipped,
                "active_session_id": summary.active_session_id,
                "session_operations": summary.session_operations,
                "errors": summary.errors,
            }),
        )))
    }
}
