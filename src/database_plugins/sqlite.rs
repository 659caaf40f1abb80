// ABOUTME: SQLite store implementation with inline schema migration
// ABOUTME: Enforces the single-active-session invariant through a partial unique index
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! SQLite store implementation.
//!
//! The default backend for development and tests; also serves small
//! single-node deployments. All composite operations run inside one
//! transaction. The `idx_sessions_live_pair` partial unique index is the
//! mutual exclusion for admission.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{NewSendTask, SlotAcquisition, StoreProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{
    MessageRecord, OperationRecord, SendTask, Session, SessionState, TaskStatus, TaskType,
    TransferRecord, UrgencyLevel,
};

/// SQLite store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Underlying pool, exposed for health checks
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn in_clause(states: &[SessionState]) -> String {
        states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn live_states_clause() -> String {
        Self::in_clause(&[
            SessionState::Pending,
            SessionState::Active,
            SessionState::Paused,
            SessionState::Transferred,
        ])
    }

    fn classify_unique_violation(err: &sqlx::Error) -> Option<SlotAcquisition> {
        if let sqlx::Error::Database(db) = err {
            let message = db.message();
            if message.contains("idx_sessions_live_pair") {
                return Some(SlotAcquisition::SlotTaken);
            }
            if message.contains("idx_sessions_external_task")
                || message.contains("session_tasks.external_task_id")
            {
                return Some(SlotAcquisition::DuplicateExternal);
            }
        }
        None
    }
}

fn row_to_session(row: &SqliteRow) -> AppResult<Session> {
    let task_type: String = row.try_get("task_type")?;
    let state: String = row.try_get("state")?;
    Ok(Session {
        session_id: row.try_get("session_id")?,
        account_id: row.try_get("account_id")?,
        shop_id: row.try_get("shop_id")?,
        shop_name: row.try_get("shop_name")?,
        platform: row.try_get("platform")?,
        task_type: TaskType::from_str(&task_type).map_err(AppError::internal)?,
        priority: u8::try_from(row.try_get::<i64, _>("priority")?)
            .map_err(|e| AppError::internal(format!("priority out of range: {e}")))?,
        state: SessionState::from_str(&state).map_err(AppError::internal)?,
        external_task_id: row.try_get("external_task_id")?,
        max_inactive_minutes: row.try_get("max_inactive_minutes")?,
        message_count: row.try_get("message_count")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        transferred_at: row.try_get("transferred_at")?,
        transfer_reason: row.try_get("transfer_reason")?,
    })
}

fn row_to_task(row: &SqliteRow) -> AppResult<SendTask> {
    let status: String = row.try_get("status")?;
    Ok(SendTask {
        task_id: row.try_get("task_id")?,
        session_id: row.try_get("session_id")?,
        external_task_id: row.try_get("external_task_id")?,
        send_content: row.try_get("send_content")?,
        send_url: row.try_get("send_url")?,
        shop_name: row.try_get("shop_name")?,
        status: TaskStatus::from_str(&status).map_err(AppError::internal)?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

const SESSION_COLUMNS: &str = "session_id, account_id, shop_id, shop_name, platform, task_type, \
     priority, state, external_task_id, max_inactive_minutes, message_count, created_at, \
     last_activity_at, transferred_at, transfer_reason";

const TASK_COLUMNS: &str = "task_id, session_id, external_task_id, send_content, send_url, \
     shop_name, status, created_at, finished_at";

#[async_trait]
impl StoreProvider for SqliteStore {
    async fn new(dsn: &str) -> AppResult<Self> {
        // An in-memory database exists per connection, so it must be pinned
        // to a single one; file databases are created if missing
        let pool = if dsn.contains(":memory:") {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .connect(dsn)
                .await
        } else {
            SqlitePool::connect(&format!("{dsn}?mode=rwc")).await
        }
        .map_err(|e| AppError::internal(format!("failed to open SQLite store: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT UNIQUE NOT NULL,
                account_name TEXT,
                platform TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS shops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_id TEXT UNIQUE NOT NULL,
                shop_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT UNIQUE NOT NULL,
                account_id TEXT NOT NULL,
                shop_id TEXT NOT NULL,
                shop_name TEXT NOT NULL,
                platform TEXT NOT NULL,
                task_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                state TEXT NOT NULL,
                external_task_id TEXT,
                max_inactive_minutes INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                transferred_at TEXT,
                transfer_reason TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // The single-active invariant: one live session per (account, shop)
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_pair
             ON sessions(account_id, shop_id)
             WHERE state IN ('pending', 'active', 'paused', 'transferred')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_external_task
             ON sessions(external_task_id)
             WHERE external_task_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
             ON sessions(last_activity_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS session_tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(session_id),
                external_task_id TEXT UNIQUE NOT NULL,
                send_content TEXT NOT NULL,
                send_url TEXT NOT NULL,
                shop_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                finished_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_tasks_session
             ON session_tasks(session_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_tasks_status
             ON session_tasks(status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT UNIQUE NOT NULL,
                session_id TEXT NOT NULL REFERENCES sessions(session_id),
                content TEXT NOT NULL,
                sender_nick TEXT NOT NULL,
                from_source TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session
             ON messages(session_id, sent_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS session_transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(session_id),
                from_type TEXT NOT NULL,
                to_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                urgency TEXT NOT NULL,
                transferred_at TEXT NOT NULL,
                accepted_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS session_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivered_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_operations_undelivered
             ON session_operations(delivered_at)
             WHERE delivered_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_account(
        &self,
        account_id: &str,
        account_name: &str,
        platform: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO accounts (account_id, account_name, platform, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(account_id)
        .bind(account_name)
        .bind(platform)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_shop(&self, shop_id: &str, shop_name: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO shops (shop_id, shop_name, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(shop_id)
        .bind(shop_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_session_by_external_task_id(
        &self,
        external_task_id: &str,
    ) -> AppResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE external_task_id = ?1"
        ))
        .bind(external_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_live_session(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE account_id = ?1 AND shop_id = ?2 AND state IN ({})
             ORDER BY last_activity_at DESC LIMIT 1",
            Self::live_states_clause()
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_live_session_for_shop(&self, shop_id: &str) -> AppResult<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE shop_id = ?1 AND state IN ({})
             ORDER BY last_activity_at DESC LIMIT 1",
            Self::live_states_clause()
        );
        let row = sqlx::query(&sql)
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn create_session_with_task(
        &self,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO sessions (session_id, account_id, shop_id, shop_name, platform,
                 task_type, priority, state, external_task_id, max_inactive_minutes,
                 message_count, created_at, last_activity_at, transferred_at, transfer_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&session.session_id)
        .bind(&session.account_id)
        .bind(&session.shop_id)
        .bind(&session.shop_name)
        .bind(&session.platform)
        .bind(session.task_type.as_str())
        .bind(i64::from(session.priority))
        .bind(session.state.as_str())
        .bind(&session.external_task_id)
        .bind(session.max_inactive_minutes)
        .bind(session.message_count)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.transferred_at)
        .bind(&session.transfer_reason)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if let Some(outcome) = Self::classify_unique_violation(&err) {
                tx.rollback().await?;
                return Ok(outcome);
            }
            return Err(err.into());
        }

        let task_id = if let Some(task) = task {
            let result = sqlx::query(
                "INSERT INTO session_tasks (session_id, external_task_id, send_content,
                     send_url, shop_name, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            )
            .bind(&session.session_id)
            .bind(&task.external_task_id)
            .bind(&task.send_content)
            .bind(&task.send_url)
            .bind(&task.shop_name)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) => Some(done.last_insert_rowid()),
                Err(err) => {
                    if let Some(outcome) = Self::classify_unique_violation(&err) {
                        tx.rollback().await?;
                        return Ok(outcome);
                    }
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let detail = serde_json::json!({
            "task_type": session.task_type.as_str(),
            "priority": session.priority,
            "task_id": task_id,
        });
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, 'created', ?2, ?3)",
        )
        .bind(&session.session_id)
        .bind(detail.to_string())
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SlotAcquisition::Created { task_id })
    }

    async fn preempt_and_create(
        &self,
        current_session_id: &str,
        reason: &str,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition> {
        let mut tx = self.pool.begin().await?;

        let paused = sqlx::query(&format!(
            "UPDATE sessions SET state = 'paused', transfer_reason = ?1, last_activity_at = ?2
             WHERE session_id = ?3 AND state IN ({})",
            Self::live_states_clause()
        ))
        .bind(reason)
        .bind(session.created_at)
        .bind(current_session_id)
        .execute(&mut *tx)
        .await?;

        if paused.rows_affected() == 0 {
            // The occupant moved concurrently; let the caller re-evaluate
            tx.rollback().await?;
            return Ok(SlotAcquisition::SlotTaken);
        }

        let preempt_detail = serde_json::json!({ "reason": reason });
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, 'preempted', ?2, ?3)",
        )
        .bind(current_session_id)
        .bind(preempt_detail.to_string())
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO sessions (session_id, account_id, shop_id, shop_name, platform,
                 task_type, priority, state, external_task_id, max_inactive_minutes,
                 message_count, created_at, last_activity_at, transferred_at, transfer_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&session.session_id)
        .bind(&session.account_id)
        .bind(&session.shop_id)
        .bind(&session.shop_name)
        .bind(&session.platform)
        .bind(session.task_type.as_str())
        .bind(i64::from(session.priority))
        .bind(session.state.as_str())
        .bind(&session.external_task_id)
        .bind(session.max_inactive_minutes)
        .bind(session.message_count)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.transferred_at)
        .bind(&session.transfer_reason)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if let Some(outcome) = Self::classify_unique_violation(&err) {
                tx.rollback().await?;
                return Ok(outcome);
            }
            return Err(err.into());
        }

        let task_id = if let Some(task) = task {
            let done = sqlx::query(
                "INSERT INTO session_tasks (session_id, external_task_id, send_content,
                     send_url, shop_name, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            )
            .bind(&session.session_id)
            .bind(&task.external_task_id)
            .bind(&task.send_content)
            .bind(&task.send_url)
            .bind(&task.shop_name)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
            Some(done.last_insert_rowid())
        } else {
            None
        };

        let detail = serde_json::json!({
            "task_type": session.task_type.as_str(),
            "priority": session.priority,
            "task_id": task_id,
            "preempted": current_session_id,
        });
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, 'created', ?2, ?3)",
        )
        .bind(&session.session_id)
        .bind(detail.to_string())
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SlotAcquisition::Created { task_id })
    }

    async fn transition_session(
        &self,
        session_id: &str,
        from: &[SessionState],
        to: SessionState,
        operation: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let transferred_at_sql = if to == SessionState::Transferred {
            ", transferred_at = ?2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE sessions SET state = '{}', last_activity_at = ?2{transferred_at_sql}
             WHERE session_id = ?1 AND state IN ({})",
            to.as_str(),
            Self::in_clause(from)
        );
        let updated = sqlx::query(&sql)
            .bind(session_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let detail = serde_json::json!({ "to": to.as_str() });
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(operation)
        .bind(detail.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn transfer_session(
        &self,
        session_id: &str,
        reason: &str,
        urgency: UrgencyLevel,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE sessions SET state = 'transferred', transferred_at = ?1,
                 transfer_reason = ?2, last_activity_at = ?1
             WHERE session_id = ?3 AND state = 'active'",
        )
        .bind(now)
        .bind(reason)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO session_transfers (session_id, from_type, to_type, reason, urgency,
                 transferred_at)
             VALUES (?1, 'robot', 'human', ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(reason)
        .bind(urgency.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let detail = serde_json::json!({ "reason": reason, "urgency": urgency.as_str() });
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, 'transferred', ?2, ?3)",
        )
        .bind(session_id)
        .bind(detail.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            "UPDATE sessions SET last_activity_at = ?1
             WHERE session_id = ?2 AND last_activity_at < ?1",
        )
        .bind(at)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn timeout_expired_sessions(
        &self,
        now: DateTime<Utc>,
        pending_grace_seconds: i64,
    ) -> AppResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE state IN ({})",
            Self::live_states_clause()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut reaped = Vec::new();
        for row in &rows {
            let session = row_to_session(row)?;

            let inactive_expired =
                now - session.last_activity_at > Duration::minutes(session.max_inactive_minutes);
            let pending_expired = session.state == SessionState::Pending
                && now - session.created_at > Duration::seconds(pending_grace_seconds);
            if !inactive_expired && !pending_expired {
                continue;
            }

            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query(&format!(
                "UPDATE sessions SET state = 'timeout', last_activity_at = ?1
                 WHERE session_id = ?2 AND state IN ({})",
                Self::live_states_clause()
            ))
            .bind(now)
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            sqlx::query(
                "UPDATE session_tasks SET status = 'failed', finished_at = ?1
                 WHERE session_id = ?2 AND status = 'pending'",
            )
            .bind(now)
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await?;

            let detail = serde_json::json!({ "from": session.state.as_str() });
            sqlx::query(
                "INSERT INTO session_operations (session_id, operation, detail, created_at)
                 VALUES (?1, 'timeout', ?2, ?3)",
            )
            .bind(&session.session_id)
            .bind(detail.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            reaped.push(session);
        }

        Ok(reaped)
    }

    async fn get_task(&self, task_id: i64) -> AppResult<Option<SendTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM session_tasks WHERE task_id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn latest_task_for_session(&self, session_id: &str) -> AppResult<Option<SendTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM session_tasks
             WHERE session_id = ?1 ORDER BY task_id DESC LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn mark_task_sent(&self, task_id: i64) -> AppResult<bool> {
        let updated = sqlx::query(
            "UPDATE session_tasks SET status = 'sent' WHERE task_id = ?1 AND status = 'pending'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn complete_first_send(
        &self,
        session_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT task_id FROM session_tasks
             WHERE session_id = ?1 AND status = 'sent'
             ORDER BY task_id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let task_id: i64 = row.try_get("task_id")?;

        let to_status = if success { "completed" } else { "failed" };
        sqlx::query(
            "UPDATE session_tasks SET status = ?1, finished_at = ?2
             WHERE task_id = ?3 AND status = 'sent'",
        )
        .bind(to_status)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if success {
            // First-send coupling: a completed send activates a pending session
            sqlx::query(
                "UPDATE sessions SET state = 'active', last_activity_at = ?1
                 WHERE session_id = ?2 AND state = 'pending'",
            )
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(task_id))
    }

    async fn retry_failed_task(&self, task_id: i64) -> AppResult<bool> {
        let updated = sqlx::query(
            "UPDATE session_tasks SET status = 'pending', finished_at = NULL
             WHERE task_id = ?1 AND status = 'failed'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn fail_pending_tasks(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        let updated = sqlx::query(
            "UPDATE session_tasks SET status = 'failed', finished_at = ?1
             WHERE session_id = ?2 AND status = 'pending'",
        )
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn pending_tasks_with_sessions(
        &self,
        limit: i64,
    ) -> AppResult<Vec<(SendTask, Session)>> {
        let rows = sqlx::query(
            "SELECT t.task_id, t.session_id, t.external_task_id, t.send_content, t.send_url,
                    t.shop_name, t.status, t.created_at, t.finished_at,
                    s.session_id AS s_session_id, s.account_id, s.shop_id,
                    s.shop_name AS s_shop_name, s.platform, s.task_type, s.priority, s.state,
                    s.external_task_id AS s_external_task_id, s.max_inactive_minutes,
                    s.message_count, s.created_at AS s_created_at, s.last_activity_at,
                    s.transferred_at, s.transfer_reason
             FROM session_tasks t JOIN sessions s ON s.session_id = t.session_id
             WHERE t.status = 'pending'
             ORDER BY t.task_id ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = row_to_task(row)?;
            let task_type: String = row.try_get("task_type")?;
            let state: String = row.try_get("state")?;
            let session = Session {
                session_id: row.try_get("s_session_id")?,
                account_id: row.try_get("account_id")?,
                shop_id: row.try_get("shop_id")?,
                shop_name: row.try_get("s_shop_name")?,
                platform: row.try_get("platform")?,
                task_type: TaskType::from_str(&task_type).map_err(AppError::internal)?,
                priority: u8::try_from(row.try_get::<i64, _>("priority")?)
                    .map_err(|e| AppError::internal(format!("priority out of range: {e}")))?,
                state: SessionState::from_str(&state).map_err(AppError::internal)?,
                external_task_id: row.try_get("s_external_task_id")?,
                max_inactive_minutes: row.try_get("max_inactive_minutes")?,
                message_count: row.try_get("message_count")?,
                created_at: row.try_get("s_created_at")?,
                last_activity_at: row.try_get("last_activity_at")?,
                transferred_at: row.try_get("transferred_at")?,
                transfer_reason: row.try_get("transfer_reason")?,
            };
            out.push((task, session));
        }
        Ok(out)
    }

    async fn tasks_for_session_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<SendTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM session_tasks
             WHERE session_id = ?1 AND created_at >= ?2
             ORDER BY task_id ASC"
        ))
        .bind(session_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn known_message_ids(&self, ids: &[String]) -> AppResult<HashSet<String>> {
        let mut known = HashSet::new();
        if ids.is_empty() {
            return Ok(known);
        }

        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT message_id FROM messages WHERE message_id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        for row in &rows {
            known.insert(row.try_get("message_id")?);
        }
        Ok(known)
    }

    async fn append_messages(
        &self,
        session_id: &str,
        records: &[MessageRecord],
    ) -> AppResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        let mut newest: Option<DateTime<Utc>> = None;

        for record in records {
            let done = sqlx::query(
                "INSERT OR IGNORE INTO messages
                     (message_id, session_id, content, sender_nick, from_source, sent_at,
                      created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&record.message_id)
            .bind(session_id)
            .bind(&record.content)
            .bind(&record.sender_nick)
            .bind(record.from_source.as_str())
            .bind(record.sent_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;

            if done.rows_affected() > 0 {
                inserted += done.rows_affected();
                newest = Some(newest.map_or(record.sent_at, |n| n.max(record.sent_at)));
            }
        }

        if let Some(newest) = newest {
            sqlx::query(
                "UPDATE sessions SET message_count = message_count + ?1,
                     last_activity_at = CASE
                         WHEN last_activity_at < ?2 THEN ?2 ELSE last_activity_at END
                 WHERE session_id = ?3",
            )
            .bind(i64::try_from(inserted).unwrap_or(i64::MAX))
            .bind(newest)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn latest_message_at(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT m.sent_at FROM messages m
             JOIN sessions s ON s.session_id = m.session_id
             WHERE s.account_id = ?1 AND s.shop_id = ?2
             ORDER BY m.sent_at DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("sent_at").map_err(AppError::from))
            .transpose()
    }

    async fn insert_transfer(&self, record: &TransferRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO session_transfers (session_id, from_type, to_type, reason, urgency,
                 transferred_at, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&record.session_id)
        .bind(&record.from_type)
        .bind(&record.to_type)
        .bind(&record.reason)
        .bind(record.urgency.as_str())
        .bind(record.transferred_at)
        .bind(record.accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_operation(
        &self,
        session_id: &str,
        operation: &str,
        detail: &serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO session_operations (session_id, operation, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(operation)
        .bind(detail.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn undelivered_operations(&self, limit: i64) -> AppResult<Vec<OperationRecord>> {
        let rows = sqlx::query(
            "SELECT id, session_id, operation, detail, created_at, delivered_at
             FROM session_operations
             WHERE delivered_at IS NULL
             ORDER BY id ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let detail_raw: String = row.try_get("detail")?;
            out.push(OperationRecord {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                operation: row.try_get("operation")?,
                detail: serde_json::from_str(&detail_raw)?,
                created_at: row.try_get("created_at")?,
                delivered_at: row.try_get("delivered_at")?,
            });
        }
        Ok(out)
    }

    async fn mark_operation_delivered(&self, id: i64, now: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE session_operations SET delivered_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
