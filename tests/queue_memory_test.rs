// ABOUTME: Unit tests for the in-memory queue implementation
// ABOUTME: Tests FIFO ordering, idempotent pushes, and size introspection
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

use anyhow::Result;
use session_broker::queue::factory::Queue;
use session_broker::queue::QueueProvider;

async fn memory_queue() -> Result<Queue> {
    Ok(Queue::from_url("memory:").await?)
}

#[tokio::test]
async fn pop_returns_in_push_order() -> Result<()> {
    let queue = memory_queue().await?;
    for id in [3, 1, 2] {
        assert!(queue.push(id).await?);
    }

    assert_eq!(queue.pop().await?, Some(3));
    assert_eq!(queue.pop().await?, Some(1));
    assert_eq!(queue.pop().await?, Some(2));
    assert_eq!(queue.pop().await?, None);
    Ok(())
}

#[tokio::test]
async fn duplicate_push_is_a_no_op() -> Result<()> {
    let queue = memory_queue().await?;
    assert!(queue.push(7).await?);
    assert!(!queue.push(7).await?);
    assert_eq!(queue.len().await?, 1);

    assert_eq!(queue.pop().await?, Some(7));
    // Once popped the id may be queued again
    assert!(queue.push(7).await?);
    Ok(())
}

#[tokio::test]
async fn pop_on_empty_never_blocks() -> Result<()> {
    let queue = memory_queue().await?;
    assert_eq!(queue.pop().await?, None);
    assert_eq!(queue.len().await?, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_scheme_is_rejected() {
    assert!(Queue::from_url("kafka://broker:9092").await.is_err());
}
