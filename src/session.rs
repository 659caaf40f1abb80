// ABOUTME: Session state machine owner handling completion, transfer, cancel, and reaping
// ABOUTME: Sole writer of session state and send-task status via guarded store transitions
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Session manager
//!
//! Owns the session state machine. Every transition goes through a guarded
//! conditional update in the store so concurrent writers cannot push a
//! session through an edge that is not in the graph:
//!
//! ```text
//! PENDING   → ACTIVE | CANCELLED | TIMEOUT
//! ACTIVE    → COMPLETED | TRANSFERRED | PAUSED | TIMEOUT
//! PAUSED    → ACTIVE | CANCELLED | TIMEOUT
//! TRANSFERRED → COMPLETED | TIMEOUT
//! ```

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::database_plugins::{factory::Store, StoreProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{Session, SessionState, UrgencyLevel};

/// Allowed edges of the session state machine
#[must_use]
pub const fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Active, Cancelled, Completed, Paused, Pending, Timeout, Transferred};
    matches!(
        (from, to),
        (Pending, Active | Cancelled | Timeout)
            | (Active, Completed | Transferred | Paused | Timeout)
            | (Paused, Active | Cancelled | Timeout)
            | (Transferred, Completed | Timeout)
    )
}

/// Session lifecycle manager
#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    pending_grace_seconds: i64,
}

impl SessionManager {
    /// Create a manager over the given store
    #[must_use]
    pub const fn new(store: Store, pending_grace_seconds: i64) -> Self {
        Self {
            store,
            pending_grace_seconds,
        }
    }

    /// Fetch a session or fail with `SESSION_NOT_FOUND`
    ///
    /// # Errors
    ///
    /// Returns `SESSION_NOT_FOUND` when no such session exists.
    pub async fn require_session(&self, session_id: &str) -> AppResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::session_not_found(session_id))
    }

    /// Complete a session.
    ///
    /// Flips the most recent SENT task first — on success that couples a
    /// PENDING session to ACTIVE in the same transaction — then moves the
    /// session to COMPLETED. A failed completion marks the task FAILED and
    /// leaves the session where it is so the send can be retried.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown ids; `INVALID_STATE` when the
    /// session is not in ACTIVE or TRANSFERRED after task coupling.
    pub async fn complete(
        &self,
        session_id: &str,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<SessionState> {
        let session = self.require_session(session_id).await?;
        if session.state.is_terminal() {
            return Err(AppError::invalid_state(format!(
                "session {session_id} is already {}",
                session.state
            )));
        }

        let flipped = self.store.complete_first_send(session_id, success, now).await?;

        if !success {
            let detail = serde_json::json!({
                "task_id": flipped,
                "error_message": error_message,
            });
            self.store
                .append_operation(session_id, "task_failed", &detail)
                .await?;
            info!(session_id, task_id = ?flipped, "send-task reported failed");
            return Ok(session.state);
        }

        let moved = self
            .store
            .transition_session(
                session_id,
                &[SessionState::Active, SessionState::Transferred],
                SessionState::Completed,
                "completed",
                now,
            )
            .await?;
        if !moved {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot complete from {}",
                session.state
            )));
        }

        info!(session_id, "session completed");
        Ok(SessionState::Completed)
    }

    /// Hand a session over to a human: ACTIVE → TRANSFERRED plus transfer
    /// record and outbox row.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown ids; `INVALID_STATE` when the
    /// session is not ACTIVE.
    pub async fn transfer(
        &self,
        session_id: &str,
        reason: &str,
        urgency: UrgencyLevel,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let session = self.require_session(session_id).await?;
        if !transition_allowed(session.state, SessionState::Transferred) {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot transfer from {}",
                session.state
            )));
        }

        let moved = self
            .store
            .transfer_session(session_id, reason, urgency, now)
            .await?;
        if !moved {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot transfer from {}",
                session.state
            )));
        }

        info!(session_id, reason, "session transferred to human");
        Ok(())
    }

    /// Abandon a PENDING or PAUSED session, failing any queued send-task
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown ids; `INVALID_STATE` otherwise.
    pub async fn cancel(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let session = self.require_session(session_id).await?;
        if !transition_allowed(session.state, SessionState::Cancelled) {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot cancel from {}",
                session.state
            )));
        }

        let moved = self
            .store
            .transition_session(
                session_id,
                &[SessionState::Pending, SessionState::Paused],
                SessionState::Cancelled,
                "cancelled",
                now,
            )
            .await?;
        if !moved {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot cancel from {}",
                session.state
            )));
        }

        let failed = self.store.fail_pending_tasks(session_id, now).await?;
        if failed > 0 {
            info!(session_id, failed, "cancelled session's queued tasks failed");
        }
        Ok(())
    }

    /// Release a preemption: PAUSED → ACTIVE
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown ids; `INVALID_STATE` otherwise.
    pub async fn resume(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let session = self.require_session(session_id).await?;

        let moved = self
            .store
            .transition_session(
                session_id,
                &[SessionState::Paused],
                SessionState::Active,
                "resumed",
                now,
            )
            .await?;
        if !moved {
            return Err(AppError::invalid_state(format!(
                "session {session_id} cannot resume from {}",
                session.state
            )));
        }
        Ok(())
    }

    /// Expire one live session to TIMEOUT regardless of which live state it
    /// is in (stale-session replacement during ingest)
    ///
    /// # Errors
    ///
    /// Propagates store failures; returns `Ok(false)` when the session
    /// already left its live state.
    pub async fn expire(&self, session_id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let moved = self
            .store
            .transition_session(
                session_id,
                &[
                    SessionState::Pending,
                    SessionState::Active,
                    SessionState::Paused,
                    SessionState::Transferred,
                ],
                SessionState::Timeout,
                "timeout",
                now,
            )
            .await?;
        if moved {
            self.store.fail_pending_tasks(session_id, now).await?;
            warn!(session_id, "session expired");
        }
        Ok(moved)
    }

    /// Advance `last_activity_at` monotonically
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.store.touch_session(session_id, at).await
    }

    /// Reap every session past its inactivity window (and PENDING sessions
    /// past the activation grace). Idempotent; safe to run concurrently.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reap(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let reaped = self
            .store
            .timeout_expired_sessions(now, self.pending_grace_seconds)
            .await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped inactive sessions");
        }
        Ok(reaped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_rejects_terminal_mutation() {
        assert!(!transition_allowed(
            SessionState::Completed,
            SessionState::Active
        ));
        assert!(!transition_allowed(
            SessionState::Cancelled,
            SessionState::Pending
        ));
        assert!(!transition_allowed(
            SessionState::Timeout,
            SessionState::Active
        ));
    }

    #[test]
    fn graph_allows_documented_edges() {
        assert!(transition_allowed(SessionState::Pending, SessionState::Active));
        assert!(transition_allowed(SessionState::Pending, SessionState::Timeout));
        assert!(transition_allowed(SessionState::Active, SessionState::Paused));
        assert!(transition_allowed(SessionState::Paused, SessionState::Active));
        assert!(transition_allowed(
            SessionState::Transferred,
            SessionState::Completed
        ));
    }

    #[test]
    fn graph_rejects_sideways_moves() {
        assert!(!transition_allowed(
            SessionState::Pending,
            SessionState::Transferred
        ));
        assert!(!transition_allowed(
            SessionState::Paused,
            SessionState::Completed
        ));
        assert!(!transition_allowed(
            SessionState::Transferred,
            SessionState::Active
        ));
    }
}
