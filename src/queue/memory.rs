// ABOUTME: In-memory queue implementation for development and tests
// ABOUTME: VecDeque FIFO with a membership set guaranteeing idempotent pushes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::QueueProvider;
use crate::errors::AppResult;

#[derive(Default)]
struct Inner {
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

/// In-memory FIFO queue; single-process only
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new_empty() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueProvider for MemoryQueue {
    async fn new(_url: &str) -> AppResult<Self> {
        Ok(Self::default())
    }

    async fn push(&self, task_id: i64) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(task_id) {
            return Ok(false);
        }
        inner.order.push_back(task_id);
        Ok(true)
    }

    async fn pop(&self) -> AppResult<Option<i64>> {
        let mut inner = self.inner.lock().await;
        let next = inner.order.pop_front();
        if let Some(task_id) = next {
            inner.members.remove(&task_id);
        }
        Ok(next)
    }

    async fn len(&self) -> AppResult<usize> {
        Ok(self.inner.lock().await.order.len())
    }
}
