// ABOUTME: Task dispatcher coupling durable send-task records with the FIFO work queue
// ABOUTME: Hands out task ids, serves payloads with at-most-once SENT flips, and reconciles the queue
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Task dispatcher
//!
//! The queue carries only decimal task-id strings; the store is the source
//! of truth. A worker that pops an id and crashes before fetching the
//! payload consumes the queue entry but leaves the record PENDING; the
//! periodic reconciliation scan re-queues such records after a grace
//! window, so hand-off is at-most-once with store-driven recovery.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::database_plugins::{factory::Store, StoreProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{SendInfo, SendTask, Session};
use crate::queue::{factory::Queue, QueueProvider};
use crate::retry::{with_retry, RetryPolicy};

/// Upper bound on tasks examined per reconciliation pass
const RECONCILE_SCAN_LIMIT: i64 = 500;

/// Derive the worker-facing send URL from the configured template.
///
/// The template carries `{platform}` and `{shop_id}` placeholders; this is
/// the only place the substitution happens.
#[must_use]
pub fn derive_send_url(template: &str, platform: &str, shop_id: &str) -> String {
    template
        .replace("{platform}", platform)
        .replace("{shop_id}", shop_id)
}

/// Task dispatcher
#[derive(Clone)]
pub struct TaskDispatcher {
    store: Store,
    queue: Queue,
    pending_task_grace_seconds: i64,
}

impl TaskDispatcher {
    /// Create a dispatcher over the given store and queue
    #[must_use]
    pub const fn new(store: Store, queue: Queue, pending_task_grace_seconds: i64) -> Self {
        Self {
            store,
            queue,
            pending_task_grace_seconds,
        }
    }

    /// Push a task id onto the queue with bounded retries.
    ///
    /// Queue loss is tolerated: on exhausted retries the task stays PENDING
    /// in the store and the reconciler re-queues it later, so this returns
    /// whether the push landed rather than failing the caller.
    pub async fn enqueue(&self, task_id: i64) -> bool {
        let queue = self.queue.clone();
        let pushed = with_retry("queue push", RetryPolicy::default(), || {
            let queue = queue.clone();
            async move { queue.push(task_id).await.map_err(|e| e.to_string()) }
        })
        .await;

        match pushed {
            Ok(fresh) => {
                debug!(task_id, fresh, "send-task queued");
                true
            }
            Err(e) => {
                warn!(task_id, error = %e, "queue push failed; reconciler will recover");
                false
            }
        }
    }

    /// Non-blocking pop of the next task id
    ///
    /// # Errors
    ///
    /// Propagates queue failures.
    pub async fn next_task_id(&self) -> AppResult<Option<i64>> {
        self.queue.pop().await
    }

    /// Fetch a task's send payload, flipping it PENDING → SENT on first
    /// read. Repeated reads return the same payload without another flip.
    ///
    /// # Errors
    ///
    /// `TASK_NOT_FOUND` when no record exists.
    pub async fn get_send_info(&self, task_id: i64) -> AppResult<SendInfo> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::task_not_found(task_id))?;

        let flipped = self.store.mark_task_sent(task_id).await?;
        if flipped {
            info!(task_id, session_id = %task.session_id, "send-task handed to worker");
        }

        Ok(SendInfo {
            send_content: task.send_content,
            send_url: task.send_url,
            shop_name: task.shop_name,
        })
    }

    /// PENDING tasks joined with their sessions, for operator visibility
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn pending_tasks(&self, limit: i64) -> AppResult<Vec<(SendTask, Session)>> {
        self.store.pending_tasks_with_sessions(limit).await
    }

    /// Re-queue tasks stuck in PENDING past the grace window whose session
    /// is still live. Idempotent pushes make this safe to run on a timer.
    ///
    /// # Errors
    ///
    /// Propagates store failures; individual push failures are logged and
    /// retried next pass.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let cutoff = now - Duration::seconds(self.pending_task_grace_seconds);
        let candidates = self
            .store
            .pending_tasks_with_sessions(RECONCILE_SCAN_LIMIT)
            .await?;

        let mut requeued = 0;
        for (task, session) in candidates {
            if task.created_at >= cutoff || !session.state.is_live() {
                continue;
            }
            if self.queue.push(task.task_id).await? {
                requeued += 1;
                info!(task_id = task.task_id, session_id = %task.session_id, "re-queued stuck task");
            }
        }

        if requeued > 0 {
            warn!(requeued, "reconciliation re-queued stuck send-tasks");
        }
        Ok(requeued)
    }

    /// Explicit retry of a FAILED task: flips it back to PENDING and queues
    /// it again.
    ///
    /// # Errors
    ///
    /// `TASK_NOT_FOUND` for unknown ids; `INVALID_STATE` when the task is
    /// not FAILED.
    pub async fn retry(&self, task_id: i64) -> AppResult<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::task_not_found(task_id))?;

        if !self.store.retry_failed_task(task_id).await? {
            return Err(AppError::invalid_state(format!(
                "task {task_id} cannot retry from {}",
                task.status
            )));
        }
        self.enqueue(task_id).await;
        Ok(())
    }
}
