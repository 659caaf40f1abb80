// ABOUTME: Admission controller enforcing the single-active-session invariant per (account, shop)
// ABOUTME: Decides accept, conflict, duplicate, or priority-based preemption for create requests
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Admission controller
//!
//! Decides whether a new session may occupy the `(account, shop)` slot.
//! Mutual exclusion is the store's partial unique index over live states;
//! this controller never holds an in-process lock. Preemption rules:
//! bots never preempt; a human request preempts a strictly lower-priority
//! occupant when the occupant is a bot, and `manual_urgent` additionally
//! preempts non-urgent human occupants.

use chrono::Utc;
use tracing::{info, warn};

use crate::database_plugins::{factory::Store, NewSendTask, SlotAcquisition, StoreProvider};
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{Session, SessionState, TaskType};

/// How many times the optimistic insert is retried after losing a race
const ADMISSION_RETRIES: u32 = 3;

/// A create-session request after validation
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    pub task_type: TaskType,
    pub external_task_id: String,
    pub send_content: String,
    pub max_inactive_minutes: i64,
}

/// Admission decision
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// Slot acquired; the task id is present for bot sessions
    Accepted {
        session: Session,
        task_id: Option<i64>,
    },
    /// `external_task_id` replay; the original session is returned
    Duplicate { session: Session },
    /// A session that may not be preempted occupies the slot
    Conflict {
        conflict_session_id: String,
        conflict_task_type: TaskType,
    },
}

/// Whether `incoming` may preempt the `occupant`
#[must_use]
pub fn may_preempt(incoming: TaskType, occupant: TaskType) -> bool {
    if incoming.is_bot() {
        return false;
    }
    if incoming.priority() >= occupant.priority() {
        return false;
    }
    occupant.is_bot() || incoming == TaskType::ManualUrgent
}

/// Admission controller
#[derive(Clone)]
pub struct AdmissionController {
    store: Store,
}

impl AdmissionController {
    /// Create a controller over the given store
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Evaluate a create-session request.
    ///
    /// The lookup-decide-insert cycle retries a bounded number of times:
    /// losing the insert race to a concurrent creator re-reads the slot and
    /// re-applies the decision rules against the new occupant.
    ///
    /// # Errors
    ///
    /// Propagates store failures; surfaces `UNAVAILABLE` when the race
    /// never settles within the retry budget.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        send_url: String,
    ) -> AppResult<AdmissionOutcome> {
        if let Some(prior) = self
            .store
            .find_session_by_external_task_id(&request.external_task_id)
            .await?
        {
            info!(
                external_task_id = %request.external_task_id,
                session_id = %prior.session_id,
                "duplicate create request replayed idempotently"
            );
            return Ok(AdmissionOutcome::Duplicate { session: prior });
        }

        self.store
            .ensure_account(
                &request.account_id,
                &format!("account_{}", request.account_id),
                &request.platform,
            )
            .await?;
        self.store
            .ensure_shop(&request.shop_id, &request.shop_name)
            .await?;

        for _ in 0..ADMISSION_RETRIES {
            let occupant = self
                .store
                .find_live_session(&request.account_id, &request.shop_id)
                .await?;

            let acquisition = match occupant {
                None => {
                    let (session, task) = Self::build_session(request, &send_url);
                    self.store
                        .create_session_with_task(&session, task.as_ref())
                        .await?
                        .into_outcome(session)
                }
                Some(current) => {
                    if !may_preempt(request.task_type, current.task_type) {
                        info!(
                            account_id = %request.account_id,
                            shop_id = %request.shop_id,
                            conflict = %current.session_id,
                            "create request rejected: slot occupied"
                        );
                        return Ok(AdmissionOutcome::Conflict {
                            conflict_session_id: current.session_id,
                            conflict_task_type: current.task_type,
                        });
                    }

                    let reason = format!("preempted_by:{}", request.task_type);
                    let (session, task) = Self::build_session(request, &send_url);
                    info!(
                        preempted = %current.session_id,
                        by = %request.task_type,
                        "preempting occupant session"
                    );
                    self.store
                        .preempt_and_create(&current.session_id, &reason, &session, task.as_ref())
                        .await?
                        .into_outcome(session)
                }
            };

            match acquisition {
                PendingOutcome::Settled(outcome) => return Ok(outcome),
                PendingOutcome::LostRace => {
                    warn!(
                        account_id = %request.account_id,
                        shop_id = %request.shop_id,
                        "admission lost the slot race, re-evaluating"
                    );
                }
                PendingOutcome::DuplicateExternal => {
                    let prior = self
                        .store
                        .find_session_by_external_task_id(&request.external_task_id)
                        .await?
                        .ok_or_else(|| {
                            AppError::internal("duplicate external_task_id vanished mid-admission")
                        })?;
                    return Ok(AdmissionOutcome::Duplicate { session: prior });
                }
            }
        }

        Err(AppError::new(
            ErrorCode::Unavailable,
            "admission did not settle under concurrent slot churn",
        ))
    }

    /// Build the PENDING session (and its send-task for bot types)
    fn build_session(
        request: &AdmissionRequest,
        send_url: &str,
    ) -> (Session, Option<NewSendTask>) {
        let now = Utc::now();
        let session = Session {
            session_id: Session::generate_id(),
            account_id: request.account_id.clone(),
            shop_id: request.shop_id.clone(),
            shop_name: request.shop_name.clone(),
            platform: request.platform.clone(),
            task_type: request.task_type,
            priority: request.task_type.priority(),
            state: SessionState::Pending,
            external_task_id: Some(request.external_task_id.clone()),
            max_inactive_minutes: request.max_inactive_minutes,
            message_count: 0,
            created_at: now,
            last_activity_at: now,
            transferred_at: None,
            transfer_reason: None,
        };

        let task = request.task_type.is_bot().then(|| NewSendTask {
            external_task_id: request.external_task_id.clone(),
            send_content: request.send_content.clone(),
            send_url: send_url.to_owned(),
            shop_name: request.shop_name.clone(),
        });

        (session, task)
    }
}

/// Intermediate result of one acquisition attempt
enum PendingOutcome {
    Settled(AdmissionOutcome),
    LostRace,
    DuplicateExternal,
}

impl SlotAcquisition {
    fn into_outcome(self, session: Session) -> PendingOutcome {
        match self {
            Self::Created { task_id } => {
                PendingOutcome::Settled(AdmissionOutcome::Accepted { session, task_id })
            }
            Self::SlotTaken => PendingOutcome::LostRace,
            Self::DuplicateExternal => PendingOutcome::DuplicateExternal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bots_never_preempt() {
        assert!(!may_preempt(TaskType::AutoBargain, TaskType::AutoFollowUp));
        assert!(!may_preempt(TaskType::AutoFollowUp, TaskType::AutoBargain));
        assert!(!may_preempt(TaskType::AutoBargain, TaskType::ManualUrgent));
    }

    #[test]
    fn humans_preempt_bots_on_strict_priority() {
        assert!(may_preempt(
            TaskType::ManualCustomerService,
            TaskType::AutoBargain
        ));
        assert!(may_preempt(TaskType::ManualComplaint, TaskType::AutoFollowUp));
        assert!(may_preempt(TaskType::ManualUrgent, TaskType::AutoBargain));
    }

    #[test]
    fn only_urgent_preempts_humans() {
        assert!(may_preempt(
            TaskType::ManualUrgent,
            TaskType::ManualCustomerService
        ));
        assert!(!may_preempt(
            TaskType::ManualCustomerService,
            TaskType::ManualComplaint
        ));
        assert!(!may_preempt(TaskType::ManualUrgent, TaskType::ManualUrgent));
    }
}
