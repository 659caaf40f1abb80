// ABOUTME: Integration tests for the message-batch ingestion pipeline
// ABOUTME: Covers observer sessions, batch dedup, silence gaps, and human-takeover detection
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

mod common;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::{bot_request, create_test_resources, seed_session, test_send_url};
use session_broker::admission::AdmissionOutcome;
use session_broker::database_plugins::StoreProvider;
use session_broker::errors::ErrorCode;
use session_broker::ingest::{IngestBatch, RawBatchMessage};
use session_broker::models::{SessionState, TaskType};

const ACCOUNT: &str = "t-2217567810350-0";
const SHOP: &str = "shop-88";

fn message(id: &str, nick: &str, at: DateTime<Utc>, content: &str) -> RawBatchMessage {
    RawBatchMessage {
        id: id.to_owned(),
        nick: nick.to_owned(),
        time: at.format("%Y-%m-%d %H:%M:%S").to_string(),
        content: content.to_owned(),
    }
}

fn batch(messages: Vec<RawBatchMessage>) -> IngestBatch {
    IngestBatch {
        shop_id: SHOP.to_owned(),
        shop_name: "精品浴缸店".to_owned(),
        platform: "taotian".to_owned(),
        account_override: None,
        max_inactive_minutes: None,
        messages,
    }
}

#[tokio::test]
async fn unattributed_traffic_opens_observer_session() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    let summary = resources
        .ingestor
        .ingest(
            &batch(vec![
                message("m1", ACCOUNT, now - Duration::seconds(30), "您好"),
                message("m2", "tb5637469_2011", now, "可以的，今天发"),
            ]),
            now,
        )
        .await?;

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped, 0);
    assert!(summary.errors.is_empty());
    assert_eq!(summary.session_operations, vec!["created".to_owned()]);

    let session_id = summary.active_session_id.expect("session id");
    let session = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");
    assert_eq!(session.task_type, TaskType::ManualCustomerService);
    assert_eq!(session.state, SessionState::Transferred);
    assert_eq!(session.account_id, ACCOUNT);
    assert_eq!(session.message_count, 2);
    Ok(())
}

#[tokio::test]
async fn second_batch_attaches_to_existing_session() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    let first = resources
        .ingestor
        .ingest(
            &batch(vec![message("m1", "tb5637469_2011", now, "在吗")]),
            now,
        )
        .await;
    // No t- nick and no override: attribution is impossible
    assert_eq!(first.unwrap_err().code, ErrorCode::NoAccount);

    let first = resources
        .ingestor
        .ingest(
            &batch(vec![message("m1", ACCOUNT, now, "您好")]),
            now,
        )
        .await?;
    let second = resources
        .ingestor
        .ingest(
            &batch(vec![message(
                "m2",
                "tb5637469_2011",
                now + Duration::minutes(1),
                "可以的",
            )]),
            now + Duration::minutes(1),
        )
        .await?;

    assert_eq!(first.active_session_id, second.active_session_id);
    assert_eq!(second.session_operations, vec!["updated".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn batch_override_supplies_the_account() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    let mut request = batch(vec![message("m1", "tb5637469_2011", now, "发货了吗")]);
    request.account_override = Some(ACCOUNT.to_owned());

    let summary = resources.ingestor.ingest(&request, now).await?;
    assert_eq!(summary.processed, 1);
    let session_id = summary.active_session_id.expect("session id");
    let session = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");
    assert_eq!(session.account_id, ACCOUNT);
    Ok(())
}

#[tokio::test]
async fn replayed_batch_is_a_no_op() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();
    let request = batch(vec![
        message("m1", ACCOUNT, now - Duration::seconds(10), "您好"),
        message("m2", "tb5637469_2011", now, "在的"),
    ]);

    let first = resources.ingestor.ingest(&request, now).await?;
    assert_eq!(first.processed, 2);

    let session_id = first.active_session_id.expect("session id");
    let before = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");

    let second = resources.ingestor.ingest(&request, now).await?;
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.active_session_id.as_deref(), Some(session_id.as_str()));
    assert!(second.session_operations.is_empty());

    let after = resources
        .store
        .get_session(&session_id)
        .await?
        .expect("session");
    assert_eq!(after.last_activity_at, before.last_activity_at);
    assert_eq!(after.message_count, before.message_count);
    Ok(())
}

#[tokio::test]
async fn silence_gap_times_out_the_old_session_and_opens_a_new_one() -> Result<()> {
    let resources = create_test_resources().await?;
    let start = Utc::now() - Duration::minutes(45);

    let first = resources
        .ingestor
        .ingest(
            &batch(vec![message("m1", ACCOUNT, start, "您好")]),
            start,
        )
        .await?;
    let old_session_id = first.active_session_id.expect("session id");

    // 45 minutes of silence exceed the 30-minute gap
    let now = Utc::now();
    let second = resources
        .ingestor
        .ingest(
            &batch(vec![message("m2", "tb5637469_2011", now, "还在吗")]),
            now,
        )
        .await?;

    let new_session_id = second.active_session_id.expect("session id");
    assert_ne!(new_session_id, old_session_id);
    assert_eq!(second.session_operations, vec!["created".to_owned()]);

    let old = resources
        .store
        .get_session(&old_session_id)
        .await?
        .expect("session");
    assert_eq!(old.state, SessionState::Timeout);

    let new = resources
        .store
        .get_session(&new_session_id)
        .await?
        .expect("session");
    assert_eq!(new.task_type, TaskType::ManualCustomerService);
    assert_eq!(new.state, SessionState::Transferred);
    Ok(())
}

#[tokio::test]
async fn foreign_account_nick_transfers_an_active_bot_session() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    let session = seed_session(
        &resources,
        ACCOUNT,
        SHOP,
        TaskType::AutoBargain,
        SessionState::Active,
        now - Duration::minutes(5),
        now - Duration::minutes(5),
    )
    .await?;

    let summary = resources
        .ingestor
        .ingest(
            &batch(vec![
                message("m1", "tb5637469_2011", now - Duration::seconds(30), "太贵了"),
                message("m2", "t-9999999999999-0", now, "我是人工客服，我来处理"),
            ]),
            now,
        )
        .await?;

    assert!(summary
        .session_operations
        .contains(&"transferred".to_owned()));

    let session = resources
        .store
        .get_session(&session.session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Transferred);
    assert_eq!(
        session.transfer_reason.as_deref(),
        Some("human_intervention_detected")
    );
    Ok(())
}

#[tokio::test]
async fn expected_bot_send_does_not_transfer() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();
    let content = "您好，这个价格可以再优惠一点吗？";

    // Real bot session with its send-task on record
    let outcome = resources
        .admission
        .admit(
            &bot_request(ACCOUNT, SHOP, "ext-1"),
            test_send_url(&resources, SHOP),
        )
        .await?;
    let AdmissionOutcome::Accepted { session, task_id } = outcome else {
        panic!("create must be accepted");
    };
    let task_id = task_id.expect("task id");

    // Worker sends and confirms: the coupling moves the session to ACTIVE
    resources.dispatcher.get_send_info(task_id).await?;
    resources
        .store
        .complete_first_send(&session.session_id, true, now)
        .await?;

    let summary = resources
        .ingestor
        .ingest(
            &batch(vec![message("m1", ACCOUNT, now, content)]),
            now,
        )
        .await?;

    assert!(!summary
        .session_operations
        .contains(&"transferred".to_owned()));
    let session = resources
        .store
        .get_session(&session.session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Active);
    Ok(())
}

#[tokio::test]
async fn shop_messages_never_transfer_a_bot_session() -> Result<()> {
    let resources = create_test_resources().await?;
    let now = Utc::now();

    let session = seed_session(
        &resources,
        ACCOUNT,
        SHOP,
        TaskType::AutoBargain,
        SessionState::Active,
        now - Duration::minutes(1),
        now - Duration::minutes(1),
    )
    .await?;

    let summary = resources
        .ingestor
        .ingest(
            &batch(vec![message("m1", "tb5637469_2011", now, "最低多少钱")]),
            now,
        )
        .await?;

    assert_eq!(summary.session_operations, vec!["updated".to_owned()]);
    let session = resources
        .store
        .get_session(&session.session_id)
        .await?
        .expect("session");
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.last_activity_at.timestamp(), now.timestamp());
    Ok(())
}
