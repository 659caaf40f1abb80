// ABOUTME: Queue abstraction layer for the send-task work queue
// ABOUTME: Pluggable backend support (in-memory, Redis) following the store provider pattern
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! FIFO queue of send-task ids awaiting an RPA worker.
//!
//! The queue is advisory; the store is authoritative. Pushes are
//! idempotent so the reconciler can re-queue stuck tasks without creating
//! duplicates, and `pop` never blocks.

pub mod factory;
pub mod memory;
pub mod redis;

use crate::errors::AppResult;

/// Queue provider trait for pluggable backend implementations
#[async_trait::async_trait]
pub trait QueueProvider: Send + Sync + Clone {
    /// Create a new queue instance for the given URL
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn new(url: &str) -> AppResult<Self>
    where
        Self: Sized;

    /// Enqueue a task id; a no-op returning `false` if it is already queued
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    async fn push(&self, task_id: i64) -> AppResult<bool>;

    /// Dequeue the oldest task id, or `None` when the queue is empty.
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn pop(&self) -> AppResult<Option<i64>>;

    /// Number of queued task ids
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn len(&self) -> AppResult<usize>;
}
