// ABOUTME: Integration tests for the session state machine and first-send coupling
// ABOUTME: Covers the happy bot path, failed sends, cancel, resume, and reaper timeouts
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use common::{bot_request, create_test_resources, seed_session, test_send_url};
use session_broker::admission::AdmissionOutcome;
use session_broker::database_plugins::StoreProvider;
use session_broker::errors::ErrorCode;
use session_broker::models::{SessionState, TaskStatus, TaskType};

async fn accepted_bot_session(
    resources: &session_broker::resources::ServerResources,
) -> Result<(String, i64)> {
    let outcome = resources
        .admission
        .admit(
            &bot_request("t-1000-0", "shop-1", "ext-1"),
            test_send_url(resources, "shop-1"),
        )
        .await?;
    let AdmissionOutcome::Accepted { session, task_id } = outcome else {
        panic!("bot create must be accepted");
    };
    Ok((session.session_id, task_id.expect("task id")))
}

#[tokio::test]
async fn happy_bot_path_reaches_completed() -> Result<()> {
    let resources = create_test_resources().await?;
    let (session_id, task_id) = accepted_bot_session(&resources).await?;
    resources.dispatcher.enqueue(task_id).await;

    // Worker pops the id and fetches the payload, flipping PENDING → SENT
    let popped = resources.dispatcher.next_task_id().await?;
    assert_eq!(popped, Some(task_id));
    let info = resources.dispatcher.get_send_info(task_id).await?;
    assert_eq!(info.send_content, "您好，这个价格可以再优惠一点吗？");

    let task = resources.store.get_task(task_id).await?.expect("task");
    assert_eq!(task.status, TaskStatus::Sent);

    // Worker reports success: task COMPLETED, session PENDING → ACTIVE → COMPLETED
    let state = resources
        .sessions
        .complete(&session_id, true, None, Utc::now())
        .await?;
    assert_eq!(state, SessionState::Completed);

    let task = resources.store.get_task(task_id).await?.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.finished_at.is_some());

    let session = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Completed);
    Ok(())
}

#[tokio::test]
async fn failed_send_leaves_session_pending() -> Result<()> {
    let resources = create_test_resources().await?;
    let (session_id, task_id) = accepted_bot_session(&resources).await?;

    resources.dispatcher.get_send_info(task_id).await?;
    let state = resources
        .sessions
        .complete(&session_id, false, Some("worker crashed mid-send"), Utc::now())
        .await?;
    assert_eq!(state, SessionState::Pending);

    let task = resources.store.get_task(task_id).await?.expect("task");
    assert_eq!(task.status, TaskStatus::Failed);

    // Explicit retry flips the task back and re-queues it
    resources.dispatcher.retry(task_id).await?;
    let task = resources.store.get_task(task_id).await?.expect("task");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(resources.dispatcher.next_task_id().await?, Some(task_id));
    Ok(())
}

#[tokio::test]
async fn completing_a_terminal_session_is_invalid() -> Result<()> {
    let resources = create_test_resources().await?;
    let (session_id, task_id) = accepted_bot_session(&resources).await?;

    resources.dispatcher.get_send_info(task_id).await?;
    resources
        .sessions
        .complete(&session_id, true, None, Utc::now())
        .await?;

    let err = resources
        .sessions
        .complete(&session_id, true, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
    Ok(())
}

#[tokio::test]
async fn completing_an_unactivated_session_is_invalid() -> Result<()> {
    let resources = create_test_resources().await?;
    let (session_id, _task_id) = accepted_bot_session(&resources).await?;

    // The worker never fetched the payload: no SENT task, nothing to couple
    let err = resources
        .sessions
        .complete(&session_id, true, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_not_found() -> Result<()> {
    let resources = create_test_resources().await?;
    let err = resources
        .sessions
        .complete("sess_missing", true, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionNotFound);
    Ok(())
}

#[tokio::test]
async fn cancel_fails_queued_task_and_frees_the_slot() -> Result<()> {
    let resources = create_test_resources().await?;
    let (session_id, task_id) = accepted_bot_session(&resources).await?;

    resources.sessions.cancel(&session_id, Utc::now()).await?;

    let session = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Cancelled);
    let task = resources.store.get_task(task_id).await?.expect("task");
    assert_eq!(task.status, TaskStatus::Failed);

    // The pair's slot is free again
    let outcome = resources
        .admission
        .admit(
            &common::request_of("t-1000-0", "shop-1", "ext-2", TaskType::AutoFollowUp),
            test_send_url(&resources, "shop-1"),
        )
        .await?;
    assert!(matches!(outcome, AdmissionOutcome::Accepted { .. }));
    Ok(())
}

#[tokio::test]
async fn paused_session_resumes_to_active() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();
    let paused = seed_session(
        &resources,
        "t-1000-0",
        "shop-1",
        TaskType::AutoBargain,
        SessionState::Paused,
        now,
        now,
    )
    .await?;

    resources.sessions.resume(&paused.session_id, now).await?;
    let session = resources
        .store
        .get_session(&paused.session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Active);

    // Resuming twice is an invalid transition
    let err = resources
        .sessions
        .resume(&paused.session_id, now)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
    Ok(())
}

#[tokio::test]
async fn reaper_times_out_inactive_sessions() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    // Two hours idle with a 60-minute window
    let stale = seed_session(
        &resources,
        "t-1000-0",
        "shop-1",
        TaskType::AutoBargain,
        SessionState::Active,
        now - Duration::hours(3),
        now - Duration::hours(2),
    )
    .await?;
    // Fresh session on another pair survives
    let fresh = seed_session(
        &resources,
        "t-1000-0",
        "shop-2",
        TaskType::AutoBargain,
        SessionState::Active,
        now,
        now,
    )
    .await?;

    let reaped = resources.sessions.reap(now).await?;
    assert_eq!(reaped, 1);

    let stale = resources
        .store
        .get_session(&stale.session_id)
        .await?
        .expect("session");
    assert_eq!(stale.state, SessionState::Timeout);
    let fresh = resources
        .store
        .get_session(&fresh.session_id)
        .await?
        .expect("session");
    assert_eq!(fresh.state, SessionState::Active);

    // Reaping again is a no-op
    assert_eq!(resources.sessions.reap(now).await?, 0);
    Ok(())
}

#[tokio::test]
async fn reaper_times_out_stuck_pending_sessions() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    // Created five minutes ago, never activated; grace is 60 seconds
    let stuck = seed_session(
        &resources,
        "t-1000-0",
        "shop-1",
        TaskType::AutoBargain,
        SessionState::Pending,
        now - Duration::minutes(5),
        now - Duration::minutes(5),
    )
    .await?;

    assert_eq!(resources.sessions.reap(now).await?, 1);
    let session = resources
        .store
        .get_session(&stuck.session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Timeout);
    Ok(())
}

#[tokio::test]
async fn touch_is_monotonic() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();
    let session = seed_session(
        &resources,
        "t-1000-0",
        "shop-1",
        TaskType::AutoBargain,
        SessionState::Active,
        now,
        now,
    )
    .await?;

    let later = now + Duration::minutes(5);
    resources.sessions.touch(&session.session_id, later).await?;
    let fetched = resources
        .store
        .get_session(&session.session_id)
        .await?
        .expect("session");
    assert_eq!(fetched.last_activity_at, later);

    // An older candidate never rewinds the clock
    resources
        .sessions
        .touch(&session.session_id, now - Duration::minutes(30))
        .await?;
    let fetched = resources
        .store
        .get_session(&session.session_id)
        .await?
        .expect("session");
    assert_eq!(fetched.last_activity_at, later);
    Ok(())
}
