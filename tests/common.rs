// ABOUTME: Shared test utilities and setup functions for integration tests
// ABOUTME: Provides in-memory store/queue wiring and request fixture helpers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

#![allow(dead_code)]

//! Shared test utilities for `session_broker`
//!
//! Every test runs against an in-memory SQLite store and the in-process
//! queue, so the suite needs no external services.

use std::sync::{Arc, Once};

use anyhow::Result;
use chrono::{DateTime, Utc};
use session_broker::admission::AdmissionRequest;
use session_broker::config::ServerConfig;
use session_broker::database_plugins::factory::Store;
use session_broker::database_plugins::StoreProvider;
use session_broker::models::{Session, SessionState, TaskType};
use session_broker::queue::factory::Queue;
use session_broker::resources::ServerResources;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Full resource graph over an in-memory store and queue
pub async fn create_test_resources() -> Result<Arc<ServerResources>> {
    init_test_logging();
    let store = Store::from_dsn("sqlite::memory:")
        .await?;
    let queue = Queue::from_url("memory:")
        .await?;
    let config = Arc::new(ServerConfig::from_env()?);
    Ok(Arc::new(ServerResources::new(store, queue, config)))
}

/// Standard bot create request for `(account, shop)` with a caller key
pub fn bot_request(account_id: &str, shop_id: &str, external_task_id: &str) -> AdmissionRequest {
    AdmissionRequest {
        account_id: account_id.to_owned(),
        shop_id: shop_id.to_owned(),
        shop_name: format!("shop {shop_id}"),
        platform: "taotian".to_owned(),
        task_type: TaskType::AutoBargain,
        external_task_id: external_task_id.to_owned(),
        send_content: "您好，这个价格可以再优惠一点吗？".to_owned(),
        max_inactive_minutes: 60,
    }
}

/// Create request with an explicit task type
pub fn request_of(
    account_id: &str,
    shop_id: &str,
    external_task_id: &str,
    task_type: TaskType,
) -> AdmissionRequest {
    AdmissionRequest {
        task_type,
        ..bot_request(account_id, shop_id, external_task_id)
    }
}

/// Insert a session directly through the store, bypassing admission, so
/// tests can control timestamps and states
pub async fn seed_session(
    resources: &ServerResources,
    account_id: &str,
    shop_id: &str,
    task_type: TaskType,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
) -> Result<Session> {
    let session = Session {
        session_id: Session::generate_id(),
        account_id: account_id.to_owned(),
        shop_id: shop_id.to_owned(),
        shop_name: format!("shop {shop_id}"),
        platform: "taotian".to_owned(),
        task_type,
        priority: task_type.priority(),
        state,
        external_task_id: None,
        max_inactive_minutes: 60,
        message_count: 0,
        created_at,
        last_activity_at,
        transferred_at: None,
        transfer_reason: None,
    };
    resources
        .store
        .create_session_with_task(&session, None)
        .await?;
    Ok(session)
}

/// The default send URL the test configuration derives for a shop
pub fn test_send_url(resources: &ServerResources, shop_id: &str) -> String {
    session_broker::dispatch::derive_send_url(
        &resources.config.dispatch.send_url_template,
        "taotian",
        shop_id,
    )
}
