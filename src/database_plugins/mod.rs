// ABOUTME: Store abstraction layer for session, task, message, and transfer persistence
// ABOUTME: Plugin architecture with SQLite and PostgreSQL backends behind one async trait
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Store abstraction
//!
//! All persisted state lives behind `StoreProvider`. Multi-row mutations
//! that must be atomic (admission, preemption, first-send coupling,
//! transfer, reaping) are single trait methods so each backend can wrap
//! them in one transaction. The single-active invariant is
//! enforced by a partial unique index over live states, never by an
//! in-process lock.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::AppResult;
use crate::models::{
    MessageRecord, OperationRecord, SendTask, Session, SessionState, TransferRecord, UrgencyLevel,
};

pub mod factory;
pub mod sqlite;

#[cfg(feature = "postgresql")]
pub mod postgres;

/// Outcome of an attempt to occupy the single-active slot for a pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAcquisition {
    /// Session (and task, if any) inserted; carries the new task id
    Created { task_id: Option<i64> },
    /// A live session already occupies the `(account, shop)` slot
    SlotTaken,
    /// The `external_task_id` was seen before
    DuplicateExternal,
}

/// Send-task fields known before insertion assigns `task_id`
#[derive(Debug, Clone)]
pub struct NewSendTask {
    pub external_task_id: String,
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
}

/// Core store abstraction trait
///
/// All backends must implement this trait to provide a consistent
/// interface for the broker components.
#[async_trait]
pub trait StoreProvider: Send + Sync + Clone {
    /// Create a new store connection
    async fn new(dsn: &str) -> AppResult<Self>
    where
        Self: Sized;

    /// Run schema migrations
    async fn migrate(&self) -> AppResult<()>;

    // ================================
    // Registry
    // ================================

    /// Upsert an account row; no-op if it exists
    async fn ensure_account(
        &self,
        account_id: &str,
        account_name: &str,
        platform: &str,
    ) -> AppResult<()>;

    /// Upsert a shop row; no-op if it exists
    async fn ensure_shop(&self, shop_id: &str, shop_name: &str) -> AppResult<()>;

    // ================================
    // Sessions
    // ================================

    /// Get a session by id
    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>>;

    /// Find the session previously admitted for a caller key
    async fn find_session_by_external_task_id(
        &self,
        external_task_id: &str,
    ) -> AppResult<Option<Session>>;

    /// Find the live (non-terminal) session occupying a pair's slot
    async fn find_live_session(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<Session>>;

    /// Find the most recently active live session for a shop across all
    /// accounts (ingest fallback when the batch nick names another account)
    async fn find_live_session_for_shop(&self, shop_id: &str) -> AppResult<Option<Session>>;

    /// Insert a session plus its optional send-task atomically.
    ///
    /// Acquisition of the pair slot rides on the partial unique index; a
    /// concurrent occupant surfaces as `SlotTaken`, a replayed caller key
    /// as `DuplicateExternal`. Appends a `created` operation row in the
    /// same transaction.
    async fn create_session_with_task(
        &self,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition>;

    /// Pause `current_session_id` (with the given reason) and insert the
    /// replacement session atomically. Fails with `SlotTaken` if the
    /// current session left its live state concurrently.
    async fn preempt_and_create(
        &self,
        current_session_id: &str,
        reason: &str,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition>;

    /// Guarded state transition: applies only while the current state is in
    /// `from`. Stamps `last_activity_at`, appends an operation row labeled
    /// `operation`, and returns whether a row changed.
    async fn transition_session(
        &self,
        session_id: &str,
        from: &[SessionState],
        to: SessionState,
        operation: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// ACTIVE → TRANSFERRED plus the transfer record and operation row in
    /// one transaction
    async fn transfer_session(
        &self,
        session_id: &str,
        reason: &str,
        urgency: UrgencyLevel,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Advance `last_activity_at` monotonically (no-op when `at` is older)
    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> AppResult<()>;

    /// Transition every session past its inactivity window (or stuck in
    /// PENDING past the grace window) to TIMEOUT, failing any PENDING
    /// send-task it owns. Idempotent. Returns the sessions reaped.
    async fn timeout_expired_sessions(
        &self,
        now: DateTime<Utc>,
        pending_grace_seconds: i64,
    ) -> AppResult<Vec<Session>>;

    // ================================
    // Send-tasks
    // ================================

    /// Get a send-task by id
    async fn get_task(&self, task_id: i64) -> AppResult<Option<SendTask>>;

    /// Most recent send-task for a session
    async fn latest_task_for_session(&self, session_id: &str) -> AppResult<Option<SendTask>>;

    /// Conditional PENDING → SENT flip; `false` when already flipped
    async fn mark_task_sent(&self, task_id: i64) -> AppResult<bool>;

    /// Flip the session's most recent SENT task to COMPLETED (success) or
    /// FAILED, and on success couple the owning session PENDING → ACTIVE in
    /// the same transaction. Returns the flipped task id.
    async fn complete_first_send(
        &self,
        session_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Option<i64>>;

    /// Explicit retry: FAILED → PENDING
    async fn retry_failed_task(&self, task_id: i64) -> AppResult<bool>;

    /// Fail every PENDING task a session still owns (cancel path). Returns
    /// how many flipped.
    async fn fail_pending_tasks(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<u64>;

    /// PENDING tasks joined with their sessions, oldest first
    async fn pending_tasks_with_sessions(
        &self,
        limit: i64,
    ) -> AppResult<Vec<(SendTask, Session)>>;

    /// Send-tasks for a session created at or after `since`, any status
    /// (human-intervention content matching)
    async fn tasks_for_session_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<SendTask>>;

    // ================================
    // Messages
    // ================================

    /// Subset of `ids` already persisted
    async fn known_message_ids(&self, ids: &[String]) -> AppResult<HashSet<String>>;

    /// Insert a batch for one session, skipping duplicates, bumping the
    /// session's message count and advancing `last_activity_at` to the
    /// newest `sent_at` — one transaction. Returns how many rows landed.
    async fn append_messages(
        &self,
        session_id: &str,
        records: &[MessageRecord],
    ) -> AppResult<u64>;

    /// Newest stored `sent_at` for a pair, across all of its sessions
    async fn latest_message_at(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<DateTime<Utc>>>;

    // ================================
    // Transfers & operations (outbox)
    // ================================

    /// Append an immutable transfer record
    async fn insert_transfer(&self, record: &TransferRecord) -> AppResult<()>;

    /// Append an operation/outbox row outside any composite transaction
    async fn append_operation(
        &self,
        session_id: &str,
        operation: &str,
        detail: &serde_json::Value,
    ) -> AppResult<()>;

    /// Oldest undelivered operation rows
    async fn undelivered_operations(&self, limit: i64) -> AppResult<Vec<OperationRecord>>;

    /// Mark an operation row delivered
    async fn mark_operation_delivered(&self, id: i64, now: DateTime<Utc>) -> AppResult<()>;
}
