// ABOUTME: Health monitoring and liveness endpoints for operational visibility
// ABOUTME: Probes the store and queue and reports per-component status
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Health check endpoints and monitoring utilities.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::constants::service_names;
use crate::database_plugins::{factory::Store, StoreProvider};
use crate::queue::{factory::Queue, QueueProvider};

/// Overall health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Individual component checks
    pub checks: Vec<ComponentHealth>,
}

/// Individual component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Status description
    pub message: String,
}

/// Health checker probing the store and queue
#[derive(Clone)]
pub struct HealthChecker {
    store: Store,
    queue: Queue,
    started_at: Instant,
}

impl HealthChecker {
    /// Create a checker
    #[must_use]
    pub fn new(store: Store, queue: Queue) -> Self {
        Self {
            store,
            queue,
            started_at: Instant::now(),
        }
    }

    /// Run all component checks
    pub async fn check(&self) -> HealthResponse {
        let store_check = match self.store.get_session("health-probe").await {
            Ok(_) => ComponentHealth {
                name: "store".into(),
                status: HealthStatus::Healthy,
                message: self.store.backend_info().into(),
            },
            Err(e) => ComponentHealth {
                name: "store".into(),
                status: HealthStatus::Unhealthy,
                message: e.to_string(),
            },
        };

        let queue_check = match self.queue.len().await {
            Ok(depth) => ComponentHealth {
                name: "queue".into(),
                status: HealthStatus::Healthy,
                message: format!("{} ({depth} queued)", self.queue.backend_info()),
            },
            Err(e) => ComponentHealth {
                name: "queue".into(),
                status: HealthStatus::Unhealthy,
                message: e.to_string(),
            },
        };

        let checks = vec![store_check, queue_check];
        let status = if checks.iter().all(|c| c.status == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Healthy) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            service: service_names::SESSION_BROKER.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            checks,
        }
    }
}
