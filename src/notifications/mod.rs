// ABOUTME: Outbox-based notification delivery for session operation events
// ABOUTME: Drains undelivered operation rows and posts them to the configured endpoint
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Notification outbox dispatcher
//!
//! Side-effects never run inside store transactions. Components append an
//! operation row in the same transaction as the state change; this
//! dispatcher delivers those rows to the notifier endpoint on a timer.
//! Delivery failures leave the row undelivered for the next pass, so the
//! request that caused the operation never fails on notification trouble.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::database_plugins::{factory::Store, StoreProvider};
use crate::errors::AppResult;
use crate::retry::{with_retry, RetryPolicy};

/// Rows drained per pass
const OUTBOX_BATCH_SIZE: i64 = 50;

/// Outbox dispatcher
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Store,
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl OutboxDispatcher {
    /// Create a dispatcher; a `None` endpoint disables delivery (rows are
    /// marked delivered immediately so the outbox stays bounded)
    #[must_use]
    pub fn new(store: Store, endpoint: Option<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Drain one batch of undelivered operations.
    ///
    /// # Errors
    ///
    /// Propagates store failures; delivery failures are logged per row and
    /// retried on the next pass.
    pub async fn run_once(&self) -> AppResult<usize> {
        let operations = self.store.undelivered_operations(OUTBOX_BATCH_SIZE).await?;
        if operations.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        for operation in operations {
            let Some(endpoint) = self.endpoint.as_deref() else {
                self.store
                    .mark_operation_delivered(operation.id, Utc::now())
                    .await?;
                delivered += 1;
                continue;
            };

            let payload = json!({
                "session_id": operation.session_id,
                "operation": operation.operation,
                "detail": operation.detail,
                "occurred_at": operation.created_at.to_rfc3339(),
            });

            let client = self.client.clone();
            let sent = with_retry("notification delivery", RetryPolicy::default(), || {
                let client = client.clone();
                let payload = payload.clone();
                async move {
                    let response = client
                        .post(endpoint)
                        .json(&payload)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if response.status().is_success() {
                        Ok(())
                    } else {
                        Err(format!("notifier returned {}", response.status()))
                    }
                }
            })
            .await;

            match sent {
                Ok(()) => {
                    self.store
                        .mark_operation_delivered(operation.id, Utc::now())
                        .await?;
                    delivered += 1;
                    debug!(
                        operation_id = operation.id,
                        operation = %operation.operation,
                        "notification delivered"
                    );
                }
                Err(e) => {
                    // Left undelivered; the next pass picks it up again
                    warn!(
                        operation_id = operation.id,
                        error = %e,
                        "notification delivery failed, will retry"
                    );
                }
            }
        }

        Ok(delivered)
    }
}
