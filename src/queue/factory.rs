// ABOUTME: Queue factory selecting a backend from the queue URL scheme
// ABOUTME: Provides a unified enum dispatching to in-memory or Redis implementations
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

use tracing::info;

use super::memory::MemoryQueue;
use super::redis::RedisQueue;
use super::QueueProvider;
use crate::errors::{AppError, AppResult};

/// Queue instance wrapper that delegates to the selected backend
#[derive(Clone)]
pub enum Queue {
    Memory(MemoryQueue),
    Redis(RedisQueue),
}

impl Queue {
    /// Descriptive string for the active backend
    #[must_use]
    pub const fn backend_info(&self) -> &'static str {
        match self {
            Self::Memory(_) => "in-memory (single process)",
            Self::Redis(_) => "Redis (shared)",
        }
    }

    /// Create a queue from a URL; `memory:` or `redis://…`
    ///
    /// # Errors
    ///
    /// Returns an error for unknown schemes or unreachable backends.
    pub async fn from_url(url: &str) -> AppResult<Self> {
        if url == "memory:" || url.starts_with("memory://") {
            info!("Initializing in-memory queue");
            Ok(Self::Memory(MemoryQueue::new(url).await?))
        } else if url.starts_with("redis://") || url.starts_with("rediss://") {
            info!("Initializing Redis queue");
            Ok(Self::Redis(RedisQueue::new(url).await?))
        } else {
            Err(AppError::internal(format!(
                "unsupported queue URL scheme: {url}"
            )))
        }
    }
}

#[async_trait::async_trait]
impl QueueProvider for Queue {
    async fn new(url: &str) -> AppResult<Self> {
        Self::from_url(url).await
    }

    async fn push(&self, task_id: i64) -> AppResult<bool> {
        match self {
            Self::Memory(q) => q.push(task_id).await,
            Self::Redis(q) => q.push(task_id).await,
        }
    }

    async fn pop(&self) -> AppResult<Option<i64>> {
        match self {
            Self::Memory(q) => q.pop().await,
            Self::Redis(q) => q.pop().await,
        }
    }

    async fn len(&self) -> AppResult<usize> {
        match self {
            Self::Memory(q) => q.len().await,
            Self::Redis(q) => q.len().await,
        }
    }
}
