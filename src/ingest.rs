// ABOUTME: Inbound message-batch pipeline: dedup, attribution, and human-takeover detection
// ABOUTME: Opens observer sessions for unattributed traffic and requests transitions via SessionManager
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Message ingestor
//!
//! Processes one batch of inbound messages for a single `(account, shop)`
//! pair. The account identity rides on the `t-` nick prefix. Messages are
//! deduplicated on their platform id, sorted by send time, attributed to
//! the pair's live session (or a freshly opened observer session when the
//! silence gap is exceeded), and finally run through the intervention
//! classifier, which may hand a bot session over to a human.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::constants::platform::ACCOUNT_NICK_PREFIX;
use crate::database_plugins::{factory::Store, StoreProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{
    FromSource, InboundMessage, MessageRecord, SendTask, Session, SessionState, TaskType,
    UrgencyLevel,
};
use crate::session::SessionManager;

/// One raw message as posted by the RPA receiver
#[derive(Debug, Clone, Deserialize)]
pub struct RawBatchMessage {
    /// Platform message id
    pub id: String,
    /// Sender nick; `t-` prefix marks our own account
    pub nick: String,
    /// Send time, `%Y-%m-%d %H:%M:%S` or RFC 3339
    pub time: String,
    /// Message text
    #[serde(default)]
    pub content: String,
}

/// One batch addressed to a single `(account, shop)` pair
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    /// Overrides the nick-derived account when the batch has no `t-` nick
    pub account_override: Option<String>,
    pub max_inactive_minutes: Option<i64>,
    pub messages: Vec<RawBatchMessage>,
}

/// Ingest result summary
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchSummary {
    pub processed: u64,
    pub skipped: u64,
    pub active_session_id: Option<String>,
    pub session_operations: Vec<String>,
    pub errors: Vec<String>,
}

/// Context handed to the intervention classifier
pub struct SessionContext<'a> {
    pub session: &'a Session,
    pub account_id: &'a str,
    /// Send-tasks created within the match window, any status
    pub recent_tasks: &'a [SendTask],
}

/// Classifier verdict
#[derive(Debug, Clone)]
pub struct InterventionDecision {
    pub transfer: bool,
    pub reason: String,
}

/// Pluggable human-takeover detector.
///
/// The default heuristic flags account-sourced messages that the bot did
/// not produce; semantic implementations may replace it without touching
/// the rest of the pipeline.
pub trait InterventionClassifier: Send + Sync {
    fn classify(&self, messages: &[InboundMessage], ctx: &SessionContext<'_>)
        -> InterventionDecision;
}

/// Default heuristic: an account-sourced message is a human takeover when
/// its nick is not the session's bot identity, or its content matches no
/// outstanding send-task within the window.
pub struct HeuristicClassifier;

impl InterventionClassifier for HeuristicClassifier {
    fn classify(
        &self,
        messages: &[InboundMessage],
        ctx: &SessionContext<'_>,
    ) -> InterventionDecision {
        for message in messages {
            if message.from_source != FromSource::Account {
                continue;
            }
            if message.sender_nick != ctx.account_id {
                return InterventionDecision {
                    transfer: true,
                    reason: "human_intervention_detected".into(),
                };
            }
            let expected = ctx
                .recent_tasks
                .iter()
                .any(|task| task.send_content.trim() == message.content.trim());
            if !expected {
                return InterventionDecision {
                    transfer: true,
                    reason: "human_intervention_detected".into(),
                };
            }
        }
        InterventionDecision {
            transfer: false,
            reason: String::new(),
        }
    }
}

/// Message ingestor
#[derive(Clone)]
pub struct MessageIngestor {
    store: Store,
    sessions: SessionManager,
    classifier: std::sync::Arc<dyn InterventionClassifier>,
    session_gap_minutes: i64,
    intervention_match_minutes: i64,
    default_human_max_inactive_minutes: i64,
}

impl MessageIngestor {
    /// Create an ingestor with the default heuristic classifier
    #[must_use]
    pub fn new(
        store: Store,
        sessions: SessionManager,
        session_gap_minutes: i64,
        intervention_match_minutes: i64,
        default_human_max_inactive_minutes: i64,
    ) -> Self {
        Self {
            store,
            sessions,
            classifier: std::sync::Arc::new(HeuristicClassifier),
            session_gap_minutes,
            intervention_match_minutes,
            default_human_max_inactive_minutes,
        }
    }

    /// Swap in a different intervention classifier
    #[must_use]
    pub fn with_classifier(
        mut self,
        classifier: std::sync::Arc<dyn InterventionClassifier>,
    ) -> Self {
        self.classifier = classifier;
        self
    }

    /// Process one batch; see the module docs for the pipeline stages.
    ///
    /// # Errors
    ///
    /// `NO_ACCOUNT` when no account identity can be derived; store failures
    /// propagate. Per-message parse problems land in `errors` instead of
    /// failing the batch.
    pub async fn ingest(&self, batch: &IngestBatch, now: DateTime<Utc>) -> AppResult<BatchSummary> {
        // Attribution: t- nick, then the batch override, then the account
        // already holding the shop's conversation
        let account_id = match extract_account_id(&batch.messages)
            .or_else(|| batch.account_override.clone())
        {
            Some(account) => account,
            None => self
                .store
                .find_live_session_for_shop(&batch.shop_id)
                .await?
                .map(|s| s.account_id)
                .ok_or_else(AppError::no_account)?,
        };

        self.store
            .ensure_account(&account_id, &format!("account_{account_id}"), &batch.platform)
            .await?;
        self.store
            .ensure_shop(&batch.shop_id, &batch.shop_name)
            .await?;

        let mut summary = BatchSummary::default();

        // Normalize & classify
        let mut inbound = Vec::with_capacity(batch.messages.len());
        for raw in &batch.messages {
            let sent_at = match parse_message_time(&raw.time) {
                Ok(at) => at,
                Err(e) => {
                    summary.errors.push(format!("message {}: {e}", raw.id));
                    now
                }
            };
            let from_source = if raw.nick.starts_with(ACCOUNT_NICK_PREFIX) {
                FromSource::Account
            } else {
                FromSource::Shop
            };
            inbound.push(InboundMessage {
                message_id: raw.id.clone(),
                content: raw.content.clone(),
                sender_nick: raw.nick.clone(),
                from_source,
                sent_at,
            });
        }

        // Deduplicate against the store
        let ids: Vec<String> = inbound.iter().map(|m| m.message_id.clone()).collect();
        let known = self.store.known_message_ids(&ids).await?;
        summary.skipped = known.len() as u64;
        let mut fresh: Vec<InboundMessage> = inbound
            .into_iter()
            .filter(|m| !known.contains(&m.message_id))
            .collect();

        if fresh.is_empty() {
            // A fully replayed batch must not move any state
            summary.active_session_id = self
                .current_session(&account_id, &batch.shop_id)
                .await?
                .map(|s| s.session_id);
            return Ok(summary);
        }

        fresh.sort_by(|a, b| {
            a.sent_at
                .cmp(&b.sent_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        // Session resolution
        let session = self
            .resolve_session(&account_id, batch, &fresh, now, &mut summary)
            .await?;

        // Persist in one batch
        let records: Vec<MessageRecord> = fresh
            .iter()
            .map(|m| MessageRecord {
                message_id: m.message_id.clone(),
                session_id: session.session_id.clone(),
                content: m.content.clone(),
                sender_nick: m.sender_nick.clone(),
                from_source: m.from_source,
                sent_at: m.sent_at,
                created_at: now,
            })
            .collect();
        let inserted = self
            .store
            .append_messages(&session.session_id, &records)
            .await?;
        summary.processed = inserted;
        // Cross-batch races can swallow rows the pre-filter thought were new
        summary.skipped += records.len() as u64 - inserted;

        // Human-intervention detection on pre-existing bot sessions. The
        // bot identity is the session's own account, not the batch nick.
        if session.task_type.is_bot() && session.state == SessionState::Active {
            let since = now - Duration::minutes(self.intervention_match_minutes);
            let recent_tasks = self
                .store
                .tasks_for_session_since(&session.session_id, since)
                .await?;
            let ctx = SessionContext {
                session: &session,
                account_id: &session.account_id,
                recent_tasks: &recent_tasks,
            };
            let decision = self.classifier.classify(&fresh, &ctx);
            if decision.transfer {
                warn!(
                    session_id = %session.session_id,
                    reason = %decision.reason,
                    "human takeover detected in message batch"
                );
                self.sessions
                    .transfer(&session.session_id, &decision.reason, UrgencyLevel::High, now)
                    .await?;
                summary.session_operations.push("transferred".into());
            }
        }

        summary.active_session_id = Some(session.session_id);
        Ok(summary)
    }

    /// Live session for the pair, falling back to the shop's conversation
    /// when the batch nick names another account (a human operator logged
    /// into a different identity still belongs to the same conversation)
    async fn current_session(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<Session>> {
        if let Some(session) = self.store.find_live_session(account_id, shop_id).await? {
            return Ok(Some(session));
        }
        self.store.find_live_session_for_shop(shop_id).await
    }

    /// Find the session this batch belongs to, timing out a stale occupant
    /// and opening an observer session when needed.
    async fn resolve_session(
        &self,
        account_id: &str,
        batch: &IngestBatch,
        fresh: &[InboundMessage],
        now: DateTime<Utc>,
        summary: &mut BatchSummary,
    ) -> AppResult<Session> {
        let first_new_at = fresh[0].sent_at;
        let live = self.current_session(account_id, &batch.shop_id).await?;

        let gap_minutes = Duration::minutes(self.session_gap_minutes);

        if let Some(current) = live {
            let latest_stored = self
                .store
                .latest_message_at(&current.account_id, &batch.shop_id)
                .await?;
            let gap_exceeded =
                latest_stored.is_some_and(|latest| first_new_at - latest > gap_minutes);
            let inactivity_exceeded = now - current.last_activity_at
                > Duration::minutes(current.max_inactive_minutes);

            if !gap_exceeded && !inactivity_exceeded {
                summary.session_operations.push("updated".into());
                return Ok(current);
            }

            // Stale occupant: expire it before opening the replacement
            self.sessions.expire(&current.session_id, now).await?;
        }

        let session = self.open_observer_session(account_id, batch, now).await?;
        summary.session_operations.push("created".into());
        Ok(session)
    }

    /// Open a MANUAL_CUSTOMER_SERVICE session in TRANSFERRED state for
    /// observed human traffic that bypassed the bot pipeline, and notify.
    async fn open_observer_session(
        &self,
        account_id: &str,
        batch: &IngestBatch,
        now: DateTime<Utc>,
    ) -> AppResult<Session> {
        let session = Session {
            session_id: Session::generate_id(),
            account_id: account_id.to_owned(),
            shop_id: batch.shop_id.clone(),
            shop_name: batch.shop_name.clone(),
            platform: batch.platform.clone(),
            task_type: TaskType::ManualCustomerService,
            priority: TaskType::ManualCustomerService.priority(),
            state: SessionState::Transferred,
            external_task_id: None,
            max_inactive_minutes: batch
                .max_inactive_minutes
                .unwrap_or(self.default_human_max_inactive_minutes),
            message_count: 0,
            created_at: now,
            last_activity_at: now,
            transferred_at: Some(now),
            transfer_reason: Some("observed_human_activity".into()),
        };

        use crate::database_plugins::SlotAcquisition;
        match self.store.create_session_with_task(&session, None).await? {
            SlotAcquisition::Created { .. } => {
                info!(
                    session_id = %session.session_id,
                    account_id,
                    shop_id = %batch.shop_id,
                    "opened observer session for human traffic"
                );
                Ok(session)
            }
            // A concurrent creator got there first; attach to the winner
            SlotAcquisition::SlotTaken | SlotAcquisition::DuplicateExternal => self
                .current_session(account_id, &batch.shop_id)
                .await?
                .ok_or_else(|| {
                    AppError::internal("observer session slot vanished mid-ingest")
                }),
        }
    }
}

/// Extract the account identity from the first `t-` nick in the batch
#[must_use]
pub fn extract_account_id(messages: &[RawBatchMessage]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.nick.starts_with(ACCOUNT_NICK_PREFIX))
        .map(|m| m.nick.clone())
}

/// Parse a message timestamp; the platform sends `%Y-%m-%d %H:%M:%S`,
/// upstream relays occasionally normalize to RFC 3339.
///
/// # Errors
///
/// Returns a description of the unparseable value.
pub fn parse_message_time(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("unparseable time: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, nick: &str, time: &str) -> RawBatchMessage {
        RawBatchMessage {
            id: id.into(),
            nick: nick.into(),
            time: time.into(),
            content: String::new(),
        }
    }

    #[test]
    fn account_extraction_prefers_t_prefix() {
        let messages = vec![
            raw("1", "tb5637469_2011", "2025-07-03 10:45:34"),
            raw("2", "t-2217567810350-0", "2025-07-03 10:45:16"),
        ];
        assert_eq!(
            extract_account_id(&messages).as_deref(),
            Some("t-2217567810350-0")
        );
        assert_eq!(extract_account_id(&[raw("1", "tb1", "x")]), None);
    }

    #[test]
    fn time_parsing_accepts_both_formats() {
        assert!(parse_message_time("2025-07-03 10:45:16").is_ok());
        assert!(parse_message_time("2025-07-03T10:45:16+00:00").is_ok());
        assert!(parse_message_time("yesterday").is_err());
    }

    #[test]
    fn heuristic_flags_foreign_account_nick() {
        let session = observer_fixture(TaskType::AutoBargain, SessionState::Active);
        let messages = vec![InboundMessage {
            message_id: "m1".into(),
            content: "让我来处理".into(),
            sender_nick: "t-9999999999999-0".into(),
            from_source: FromSource::Account,
            sent_at: Utc::now(),
        }];
        let ctx = SessionContext {
            session: &session,
            account_id: "t-2217567810350-0",
            recent_tasks: &[],
        };
        let decision = HeuristicClassifier.classify(&messages, &ctx);
        assert!(decision.transfer);
        assert_eq!(decision.reason, "human_intervention_detected");
    }

    #[test]
    fn heuristic_accepts_expected_bot_send() {
        let session = observer_fixture(TaskType::AutoBargain, SessionState::Active);
        let task = SendTask {
            task_id: 1,
            session_id: session.session_id.clone(),
            external_task_id: "ext-1".into(),
            send_content: "您好，可以优惠一些吗？".into(),
            send_url: "https://example.com".into(),
            shop_name: "shop".into(),
            status: crate::models::TaskStatus::Sent,
            created_at: Utc::now(),
            finished_at: None,
        };
        let messages = vec![InboundMessage {
            message_id: "m1".into(),
            content: "您好，可以优惠一些吗？".into(),
            sender_nick: "t-2217567810350-0".into(),
            from_source: FromSource::Account,
            sent_at: Utc::now(),
        }];
        let tasks = vec![task];
        let ctx = SessionContext {
            session: &session,
            account_id: "t-2217567810350-0",
            recent_tasks: &tasks,
        };
        assert!(!HeuristicClassifier.classify(&messages, &ctx).transfer);
    }

    #[test]
    fn heuristic_ignores_shop_messages() {
        let session = observer_fixture(TaskType::AutoBargain, SessionState::Active);
        let messages = vec![InboundMessage {
            message_id: "m1".into(),
            content: "可以的，今天发".into(),
            sender_nick: "tb5637469_2011".into(),
            from_source: FromSource::Shop,
            sent_at: Utc::now(),
        }];
        let ctx = SessionContext {
            session: &session,
            account_id: "t-2217567810350-0",
            recent_tasks: &[],
        };
        assert!(!HeuristicClassifier.classify(&messages, &ctx).transfer);
    }

    fn observer_fixture(task_type: TaskType, state: SessionState) -> Session {
        let now = Utc::now();
        Session {
            session_id: Session::generate_id(),
            account_id: "t-2217567810350-0".into(),
            shop_id: "shop-1".into(),
            shop_name: "精品浴缸店".into(),
            platform: "taotian".into(),
            task_type,
            priority: task_type.priority(),
            state,
            external_task_id: None,
            max_inactive_minutes: 60,
            message_count: 0,
            created_at: now,
            last_activity_at: now,
            transferred_at: None,
            transfer_reason: None,
        }
    }
}
