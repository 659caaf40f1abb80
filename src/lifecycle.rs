// ABOUTME: Background task lifecycle: session reaper, queue reconciler, and outbox dispatcher
// ABOUTME: Spawns periodic tokio loops at startup; each pass is idempotent and failure-tolerant
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Periodic background work.
//!
//! Three loops run for the life of the process. Each pass swallows and
//! logs its own errors so one bad tick never kills the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::resources::ServerResources;

/// Spawn the reaper, reconciler, and outbox dispatcher loops
#[must_use]
pub fn spawn_background_tasks(resources: &Arc<ServerResources>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_reaper(resources.clone()),
        spawn_reconciler(resources.clone()),
        spawn_outbox(resources.clone()),
    ]
}

/// Periodically time out sessions past their inactivity window
fn spawn_reaper(resources: Arc<ServerResources>) -> JoinHandle<()> {
    let period = Duration::from_secs(resources.config.dispatch.reap_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match resources.sessions.reap(Utc::now()).await {
                Ok(reaped) => {
                    if reaped > 0 {
                        debug!(reaped, "reaper pass finished");
                    }
                }
                Err(e) => error!(error = %e, "reaper pass failed"),
            }
        }
    })
}

/// Periodically re-queue send-tasks stuck in PENDING
fn spawn_reconciler(resources: Arc<ServerResources>) -> JoinHandle<()> {
    let period = Duration::from_secs(resources.config.dispatch.reconcile_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match resources.dispatcher.reconcile(Utc::now()).await {
                Ok(requeued) => {
                    if requeued > 0 {
                        debug!(requeued, "reconciler pass finished");
                    }
                }
                Err(e) => error!(error = %e, "reconciler pass failed"),
            }
        }
    })
}

/// Periodically deliver queued operation notifications
fn spawn_outbox(resources: Arc<ServerResources>) -> JoinHandle<()> {
    let period = Duration::from_secs(resources.config.dispatch.outbox_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match resources.outbox.run_once().await {
                Ok(delivered) => {
                    if delivered > 0 {
                        debug!(delivered, "outbox pass finished");
                    }
                }
                Err(e) => error!(error = %e, "outbox pass failed"),
            }
        }
    })
}
