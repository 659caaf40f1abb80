// ABOUTME: Redis queue implementation with connection pooling for multi-instance deployments
// ABOUTME: LPUSH/RPOP list FIFO paired with a membership set for idempotent pushes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

use redis::{aio::ConnectionManager, AsyncCommands};

use super::QueueProvider;
use crate::constants::queue::{SEND_TASK_MEMBER_KEY, SEND_TASK_QUEUE_KEY};
use crate::errors::{AppError, AppResult};

/// Redis-backed FIFO queue
///
/// Uses `ConnectionManager` for automatic reconnection. Task ids travel as
/// their decimal string form; a companion set mirrors queue membership so
/// re-pushes from the reconciler are no-ops.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
}

impl RedisQueue {
    async fn connect(url: &str) -> AppResult<Self> {
        tracing::info!("Connecting to Redis queue");

        let client = redis::Client::open(url)
            .map_err(|e| AppError::internal(format!("Failed to create Redis client: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::internal(format!("Failed to connect to Redis: {e}")))?;

        tracing::info!("Redis queue connected");
        Ok(Self { manager })
    }
}

#[async_trait::async_trait]
impl QueueProvider for RedisQueue {
    async fn new(url: &str) -> AppResult<Self> {
        Self::connect(url).await
    }

    async fn push(&self, task_id: i64) -> AppResult<bool> {
        let mut conn = self.manager.clone();

        // SADD first: 0 means the id is already queued, skip the LPUSH
        let added: i64 = conn
            .sadd(SEND_TASK_MEMBER_KEY, task_id)
            .await
            .map_err(|e| AppError::internal(format!("Queue SADD failed: {e}")))?;
        if added == 0 {
            return Ok(false);
        }

        conn.lpush::<_, _, ()>(SEND_TASK_QUEUE_KEY, task_id.to_string())
            .await
            .map_err(|e| {
                tracing::error!("Queue LPUSH failed: {}", e);
                AppError::internal(format!("Queue push failed: {e}"))
            })?;
        Ok(true)
    }

    async fn pop(&self) -> AppResult<Option<i64>> {
        let mut conn = self.manager.clone();

        let raw: Option<String> = conn
            .rpop(SEND_TASK_QUEUE_KEY, None)
            .await
            .map_err(|e| AppError::internal(format!("Queue RPOP failed: {e}")))?;

        match raw {
            Some(value) => {
                let task_id: i64 = value
                    .parse()
                    .map_err(|_| AppError::internal(format!("malformed queue entry: {value}")))?;
                let _: () = conn
                    .srem(SEND_TASK_MEMBER_KEY, task_id)
                    .await
                    .map_err(|e| AppError::internal(format!("Queue SREM failed: {e}")))?;
                Ok(Some(task_id))
            }
            None => Ok(None),
        }
    }

    async fn len(&self) -> AppResult<usize> {
        let mut conn = self.manager.clone();
        let len: usize = conn
            .llen(SEND_TASK_QUEUE_KEY)
            .await
            .map_err(|e| AppError::internal(format!("Queue LLEN failed: {e}")))?;
        Ok(len)
    }
}
