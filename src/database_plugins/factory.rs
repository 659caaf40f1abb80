// ABOUTME: Store factory and provider abstraction for multi-database support
// ABOUTME: Provides a unified interface for SQLite and PostgreSQL with runtime selection by DSN
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Store factory selecting a backend from the connection string.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::sqlite::SqliteStore;
use super::{NewSendTask, SlotAcquisition, StoreProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{
    MessageRecord, OperationRecord, SendTask, Session, SessionState, TransferRecord, UrgencyLevel,
};

#[cfg(feature = "postgresql")]
use super::postgres::PostgresStore;

/// Supported store backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreType {
    Sqlite,
    PostgreSql,
}

/// Store instance wrapper that delegates to the selected implementation
#[derive(Clone)]
pub enum Store {
    Sqlite(SqliteStore),
    #[cfg(feature = "postgresql")]
    PostgreSql(PostgresStore),
}

impl Store {
    /// Descriptive string for the active backend
    #[must_use]
    pub const fn backend_info(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLite (single node)",
            #[cfg(feature = "postgresql")]
            Self::PostgreSql(_) => "PostgreSQL (multi node)",
        }
    }

    /// Create a store from a connection string
    ///
    /// # Errors
    ///
    /// Returns an error for unknown schemes, missing feature flags, or
    /// connection/migration failures.
    pub async fn from_dsn(dsn: &str) -> AppResult<Self> {
        debug!("Detecting store type from DSN");
        let store_type = detect_store_type(dsn)?;
        info!("Detected store type: {:?}", store_type);

        match store_type {
            StoreType::Sqlite => {
                let store = SqliteStore::new(dsn).await?;
                info!("SQLite store initialized");
                Ok(Self::Sqlite(store))
            }
            #[cfg(feature = "postgresql")]
            StoreType::PostgreSql => {
                let store = PostgresStore::new(dsn).await?;
                info!("PostgreSQL store initialized");
                Ok(Self::PostgreSql(store))
            }
            #[cfg(not(feature = "postgresql"))]
            StoreType::PostgreSql => Err(AppError::internal(
                "PostgreSQL DSN detected but the 'postgresql' feature is not enabled",
            )),
        }
    }
}

/// Detect the backend from a connection string scheme
///
/// # Errors
///
/// Returns an error for unrecognized schemes.
pub fn detect_store_type(dsn: &str) -> AppResult<StoreType> {
    if dsn.starts_with("sqlite:") {
        Ok(StoreType::Sqlite)
    } else if dsn.starts_with("postgresql://") || dsn.starts_with("postgres://") {
        Ok(StoreType::PostgreSql)
    } else {
        Err(AppError::internal(format!(
            "unsupported store DSN scheme: {dsn}"
        )))
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self {
            Self::Sqlite(store) => store.$method($($arg),*).await,
            #[cfg(feature = "postgresql")]
            Self::PostgreSql(store) => store.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl StoreProvider for Store {
    async fn new(dsn: &str) -> AppResult<Self> {
        Self::from_dsn(dsn).await
    }

    async fn migrate(&self) -> AppResult<()> {
        delegate!(self, migrate())
    }

    async fn ensure_account(
        &self,
        account_id: &str,
        account_name: &str,
        platform: &str,
    ) -> AppResult<()> {
        delegate!(self, ensure_account(account_id, account_name, platform))
    }

    async fn ensure_shop(&self, shop_id: &str, shop_name: &str) -> AppResult<()> {
        delegate!(self, ensure_shop(shop_id, shop_name))
    }

    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        delegate!(self, get_session(session_id))
    }

    async fn find_session_by_external_task_id(
        &self,
        external_task_id: &str,
    ) -> AppResult<Option<Session>> {
        delegate!(self, find_session_by_external_task_id(external_task_id))
    }

    async fn find_live_session(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<Session>> {
        delegate!(self, find_live_session(account_id, shop_id))
    }

    async fn find_live_session_for_shop(&self, shop_id: &str) -> AppResult<Option<Session>> {
        delegate!(self, find_live_session_for_shop(shop_id))
    }

    async fn create_session_with_task(
        &self,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition> {
        delegate!(self, create_session_with_task(session, task))
    }

    async fn preempt_and_create(
        &self,
        current_session_id: &str,
        reason: &str,
        session: &Session,
        task: Option<&NewSendTask>,
    ) -> AppResult<SlotAcquisition> {
        delegate!(
            self,
            preempt_and_create(current_session_id, reason, session, task)
        )
    }

    async fn transition_session(
        &self,
        session_id: &str,
        from: &[SessionState],
        to: SessionState,
        operation: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        delegate!(self, transition_session(session_id, from, to, operation, now))
    }

    async fn transfer_session(
        &self,
        session_id: &str,
        reason: &str,
        urgency: UrgencyLevel,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        delegate!(self, transfer_session(session_id, reason, urgency, now))
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        delegate!(self, touch_session(session_id, at))
    }

    async fn timeout_expired_sessions(
        &self,
        now: DateTime<Utc>,
        pending_grace_seconds: i64,
    ) -> AppResult<Vec<Session>> {
        delegate!(self, timeout_expired_sessions(now, pending_grace_seconds))
    }

    async fn get_task(&self, task_id: i64) -> AppResult<Option<SendTask>> {
        delegate!(self, get_task(task_id))
    }

    async fn latest_task_for_session(&self, session_id: &str) -> AppResult<Option<SendTask>> {
        delegate!(self, latest_task_for_session(session_id))
    }

    async fn mark_task_sent(&self, task_id: i64) -> AppResult<bool> {
        delegate!(self, mark_task_sent(task_id))
    }

    async fn complete_first_send(
        &self,
        session_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Option<i64>> {
        delegate!(self, complete_first_send(session_id, success, now))
    }

    async fn retry_failed_task(&self, task_id: i64) -> AppResult<bool> {
        delegate!(self, retry_failed_task(task_id))
    }

    async fn fail_pending_tasks(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        delegate!(self, fail_pending_tasks(session_id, now))
    }

    async fn pending_tasks_with_sessions(
        &self,
        limit: i64,
    ) -> AppResult<Vec<(SendTask, Session)>> {
        delegate!(self, pending_tasks_with_sessions(limit))
    }

    async fn tasks_for_session_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<SendTask>> {
        delegate!(self, tasks_for_session_since(session_id, since))
    }

    async fn known_message_ids(&self, ids: &[String]) -> AppResult<HashSet<String>> {
        delegate!(self, known_message_ids(ids))
    }

    async fn append_messages(
        &self,
        session_id: &str,
        records: &[MessageRecord],
    ) -> AppResult<u64> {
        delegate!(self, append_messages(session_id, records))
    }

    async fn latest_message_at(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> AppResult<Option<DateTime<Utc>>> {
        delegate!(self, latest_message_at(account_id, shop_id))
    }

    async fn insert_transfer(&self, record: &TransferRecord) -> AppResult<()> {
        delegate!(self, insert_transfer(record))
    }

    async fn append_operation(
        &self,
        session_id: &str,
        operation: &str,
        detail: &serde_json::Value,
    ) -> AppResult<()> {
        delegate!(self, append_operation(session_id, operation, detail))
    }

    async fn undelivered_operations(&self, limit: i64) -> AppResult<Vec<OperationRecord>> {
        delegate!(self, undelivered_operations(limit))
    }

    async fn mark_operation_delivered(&self, id: i64, now: DateTime<Utc>) -> AppResult<()> {
        delegate!(self, mark_operation_delivered(id, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert_eq!(
            detect_store_type("sqlite::memory:").unwrap(),
            StoreType::Sqlite
        );
        assert_eq!(
            detect_store_type("sqlite:broker.db").unwrap(),
            StoreType::Sqlite
        );
        assert_eq!(
            detect_store_type("postgresql://u:p@db/broker").unwrap(),
            StoreType::PostgreSql
        );
        assert!(detect_store_type("mysql://db/broker").is_err());
    }
}
