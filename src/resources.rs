// ABOUTME: Shared server resources wiring the store, queue, and component managers together
// ABOUTME: Constructed once at startup and handed to every route handler as axum state
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Shared state for route handlers and background tasks.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::database_plugins::factory::Store;
use crate::dispatch::TaskDispatcher;
use crate::health::HealthChecker;
use crate::ingest::MessageIngestor;
use crate::notifications::OutboxDispatcher;
use crate::queue::factory::Queue;
use crate::session::SessionManager;

/// Everything a request handler needs, built once at startup
pub struct ServerResources {
    /// Persistent store
    pub store: Store,
    /// Work queue
    pub queue: Queue,
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Admission controller
    pub admission: AdmissionController,
    /// Session state machine owner
    pub sessions: SessionManager,
    /// Send-task dispatcher
    pub dispatcher: TaskDispatcher,
    /// Message-batch ingestor
    pub ingestor: MessageIngestor,
    /// Notification outbox dispatcher
    pub outbox: OutboxDispatcher,
    /// Health checker
    pub health: HealthChecker,
}

impl ServerResources {
    /// Wire the component graph over the given store and queue
    #[must_use]
    pub fn new(store: Store, queue: Queue, config: Arc<ServerConfig>) -> Self {
        let sessions = SessionManager::new(store.clone(), config.session.pending_grace_seconds);
        let admission = AdmissionController::new(store.clone());
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            queue.clone(),
            config.dispatch.pending_task_grace_seconds,
        );
        let ingestor = MessageIngestor::new(
            store.clone(),
            sessions.clone(),
            config.ingest.session_gap_minutes,
            config.ingest.intervention_match_minutes,
            config.session.default_human_max_inactive_minutes,
        );
        let outbox = OutboxDispatcher::new(store.clone(), config.notifier.endpoint.clone());
        let health = HealthChecker::new(store.clone(), queue.clone());

        Self {
            store,
            queue,
            config,
            admission,
            sessions,
            dispatcher,
            ingestor,
            outbox,
            health,
        }
    }
}
