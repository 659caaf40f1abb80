// ABOUTME: Integration tests for the admission controller and its preemption rules
// ABOUTME: Covers accept, bot-bot conflict, human preemption, urgency ties, and idempotent replay
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

mod common;

use anyhow::Result;
use common::{bot_request, create_test_resources, request_of, test_send_url};
use session_broker::admission::AdmissionOutcome;
use session_broker::database_plugins::StoreProvider;
use session_broker::models::{SessionState, TaskStatus, TaskType};

#[tokio::test]
async fn accept_creates_pending_session_with_task() -> Result<()> {
    let resources = create_test_resources().await?;
    let request = bot_request("t-1000-0", "shop-1", "ext-1");
    let send_url = test_send_url(&resources, "shop-1");

    let outcome = resources
        .admission
        .admit(&request, send_url.clone())
        .await?;

    let AdmissionOutcome::Accepted { session, task_id } = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(session.state, SessionState::Pending);
    assert_eq!(session.priority, 3);
    assert_eq!(session.external_task_id.as_deref(), Some("ext-1"));

    let task_id = task_id.expect("bot session must carry a send-task");
    let task = resources
        .store
        .get_task(task_id)
        .await?
        .expect("task record");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.session_id, session.session_id);
    assert_eq!(task.send_url, send_url);
    Ok(())
}

#[tokio::test]
async fn bots_conflict_with_any_occupant() -> Result<()> {
    let resources = create_test_resources().await?;
    let send_url = test_send_url(&resources, "shop-1");

    let first = resources
        .admission
        .admit(&bot_request("t-1000-0", "shop-1", "ext-1"), send_url.clone())
        .await?;
    let AdmissionOutcome::Accepted { session, .. } = first else {
        panic!("first create must be accepted");
    };

    let second = resources
        .admission
        .admit(
            &request_of("t-1000-0", "shop-1", "ext-2", TaskType::AutoFollowUp),
            send_url,
        )
        .await?;

    let AdmissionOutcome::Conflict {
        conflict_session_id,
        conflict_task_type,
    } = second
    else {
        panic!("expected conflict, got {second:?}");
    };
    assert_eq!(conflict_session_id, session.session_id);
    assert_eq!(conflict_task_type, TaskType::AutoBargain);
    Ok(())
}

#[tokio::test]
async fn different_pairs_do_not_conflict() -> Result<()> {
    let resources = create_test_resources().await?;
    let send_url = test_send_url(&resources, "shop-1");

    for (shop, ext) in [("shop-1", "ext-1"), ("shop-2", "ext-2")] {
        let outcome = resources
            .admission
            .admit(&bot_request("t-1000-0", shop, ext), send_url.clone())
            .await?;
        assert!(matches!(outcome, AdmissionOutcome::Accepted { .. }));
    }
    Ok(())
}

#[tokio::test]
async fn urgent_human_preempts_bot_session() -> Result<()> {
    let resources = create_test_resources().await?;
    let send_url = test_send_url(&resources, "shop-1");

    let first = resources
        .admission
        .admit(&bot_request("t-1000-0", "shop-1", "ext-1"), send_url.clone())
        .await?;
    let AdmissionOutcome::Accepted { session: bot, .. } = first else {
        panic!("bot create must be accepted");
    };

    let second = resources
        .admission
        .admit(
            &request_of("t-1000-0", "shop-1", "ext-3", TaskType::ManualUrgent),
            send_url,
        )
        .await?;
    let AdmissionOutcome::Accepted { session: human, task_id } = second else {
        panic!("urgent create must preempt, got {second:?}");
    };
    assert_eq!(human.state, SessionState::Pending);
    assert_eq!(human.priority, 1);
    assert!(task_id.is_none(), "human sessions carry no send-task");

    let paused = resources
        .store
        .get_session(&bot.session_id)
        .await?
        .expect("preempted session");
    assert_eq!(paused.state, SessionState::Paused);
    assert_eq!(
        paused.transfer_reason.as_deref(),
        Some("preempted_by:manual_urgent")
    );
    Ok(())
}

#[tokio::test]
async fn customer_service_preempts_bot_but_not_human() -> Result<()> {
    let resources = create_test_resources().await?;
    let send_url = test_send_url(&resources, "shop-1");

    let first = resources
        .admission
        .admit(&bot_request("t-1000-0", "shop-1", "ext-1"), send_url.clone())
        .await?;
    assert!(matches!(first, AdmissionOutcome::Accepted { .. }));

    let cs = resources
        .admission
        .admit(
            &request_of(
                "t-1000-0",
                "shop-1",
                "ext-2",
                TaskType::ManualCustomerService,
            ),
            send_url.clone(),
        )
        .await?;
    assert!(
        matches!(cs, AdmissionOutcome::Accepted { .. }),
        "customer service must preempt the bot"
    );

    // Equal-priority human occupant: reject
    let complaint = resources
        .admission
        .admit(
            &request_of("t-1000-0", "shop-1", "ext-3", TaskType::ManualComplaint),
            send_url,
        )
        .await?;
    assert!(matches!(complaint, AdmissionOutcome::Conflict { .. }));
    Ok(())
}

#[tokio::test]
async fn duplicate_external_task_id_replays_idempotently() -> Result<()> {
    let resources = create_test_resources().await?;
    let send_url = test_send_url(&resources, "shop-1");
    let request = bot_request("t-1000-0", "shop-1", "ext-1");

    let first = resources
        .admission
        .admit(&request, send_url.clone())
        .await?;
    let AdmissionOutcome::Accepted { session, .. } = first else {
        panic!("first create must be accepted");
    };

    let replay = resources
        .admission
        .admit(&request, send_url)
        .await?;
    let AdmissionOutcome::Duplicate { session: prior } = replay else {
        panic!("replay must return the prior session, got {replay:?}");
    };
    assert_eq!(prior.session_id, session.session_id);

    // No second send-task was created for the replay
    let task = resources
        .store
        .latest_task_for_session(&session.session_id)
        .await?
        .expect("task");
    assert_eq!(task.task_id, 1);
    Ok(())
}
