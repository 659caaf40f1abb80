// ABOUTME: Core domain model for sessions, send-tasks, messages, and transfer records
// ABOUTME: Defines the task-type taxonomy, session state machine vocabulary, and priority rules
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Domain types shared by every component.
//!
//! The task-type taxonomy drives admission: priority is a pure function of
//! the type, and the bot/human split decides which side of the preemption
//! rules a request lands on.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a session was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Automated price negotiation
    AutoBargain,
    /// Automated order follow-up
    AutoFollowUp,
    /// Human customer-service takeover
    ManualCustomerService,
    /// Human complaint handling
    ManualComplaint,
    /// Human urgent escalation
    ManualUrgent,
}

impl TaskType {
    /// Admission priority; 1 is most urgent, 4 least
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::ManualUrgent => 1,
            Self::ManualCustomerService | Self::ManualComplaint => 2,
            Self::AutoBargain => 3,
            Self::AutoFollowUp => 4,
        }
    }

    /// Whether this type opens a bot session
    #[must_use]
    pub const fn is_bot(self) -> bool {
        matches!(self, Self::AutoBargain | Self::AutoFollowUp)
    }

    /// Wire and storage form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoBargain => "auto_bargain",
            Self::AutoFollowUp => "auto_follow_up",
            Self::ManualCustomerService => "manual_customer_service",
            Self::ManualComplaint => "manual_complaint",
            Self::ManualUrgent => "manual_urgent",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_bargain" => Ok(Self::AutoBargain),
            "auto_follow_up" => Ok(Self::AutoFollowUp),
            "manual_customer_service" => Ok(Self::ManualCustomerService),
            "manual_complaint" => Ok(Self::ManualComplaint),
            "manual_urgent" => Ok(Self::ManualUrgent),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, first send not yet confirmed
    Pending,
    /// First send confirmed, conversation in progress
    Active,
    /// Finished successfully
    Completed,
    /// Handed over to a human
    Transferred,
    /// Preempted by a higher-priority session
    Paused,
    /// Abandoned before completion
    Cancelled,
    /// Expired by inactivity
    Timeout,
}

impl SessionState {
    /// Terminal states are read-only except for message back-references
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Timeout)
    }

    /// States that occupy the single-active slot for an `(account, shop)` pair
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Active | Self::Paused | Self::Transferred
        )
    }

    /// Wire and storage form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Transferred => "transferred",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "transferred" => Ok(Self::Transferred),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send-task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet handed to a worker
    Pending,
    /// Payload handed to a worker
    Sent,
    /// Worker confirmed delivery
    Completed,
    /// Worker reported failure; may be retried back to Pending
    Failed,
}

impl TaskStatus {
    /// Wire and storage form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency attached to a transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
    Urgent,
}

impl UrgencyLevel {
    /// Wire and storage form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for UrgencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown urgency level: {other}")),
        }
    }
}

/// Which side of the conversation a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FromSource {
    /// Our bot/account side
    Account,
    /// The shop (counterparty) side
    Shop,
}

impl FromSource {
    /// Wire and storage form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Shop => "shop",
        }
    }
}

impl FromStr for FromSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Self::Account),
            "shop" => Ok(Self::Shop),
            other => Err(format!("unknown message source: {other}")),
        }
    }
}

/// Persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque stable identifier (`sess_<hex>`)
    pub session_id: String,
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    pub task_type: TaskType,
    /// Derived from `task_type` at admission, stored for query convenience
    pub priority: u8,
    pub state: SessionState,
    /// Caller key making admission idempotent; present on bot sessions
    pub external_task_id: Option<String>,
    /// Inactivity window before the reaper times the session out
    pub max_inactive_minutes: i64,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transfer_reason: Option<String>,
}

impl Session {
    /// Generate a fresh session identifier
    #[must_use]
    pub fn generate_id() -> String {
        format!("sess_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
    }
}

/// Persisted send-task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTask {
    /// Monotonically increasing row id; doubles as the queue key
    pub task_id: i64,
    pub session_id: String,
    pub external_task_id: String,
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Payload handed to an RPA worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInfo {
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
}

/// Persisted inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Platform-assigned id, globally unique
    pub message_id: String,
    pub session_id: String,
    pub content: String,
    pub sender_nick: String,
    pub from_source: FromSource,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A message as it arrives in a batch, before attribution
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub content: String,
    pub sender_nick: String,
    pub from_source: FromSource,
    pub sent_at: DateTime<Utc>,
}

/// Append-only record of a bot-to-human handover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub session_id: String,
    pub from_type: String,
    pub to_type: String,
    pub reason: String,
    pub urgency: UrgencyLevel,
    pub transferred_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Operation log row; doubles as the notification outbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub session_id: String,
    pub operation: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_follows_urgency() {
        assert_eq!(TaskType::ManualUrgent.priority(), 1);
        assert_eq!(TaskType::ManualCustomerService.priority(), 2);
        assert_eq!(TaskType::ManualComplaint.priority(), 2);
        assert_eq!(TaskType::AutoBargain.priority(), 3);
        assert_eq!(TaskType::AutoFollowUp.priority(), 4);
    }

    #[test]
    fn bot_split_matches_prefix() {
        assert!(TaskType::AutoBargain.is_bot());
        assert!(TaskType::AutoFollowUp.is_bot());
        assert!(!TaskType::ManualUrgent.is_bot());
        assert!(!TaskType::ManualComplaint.is_bot());
    }

    #[test]
    fn live_and_terminal_partition_states() {
        for state in [
            SessionState::Pending,
            SessionState::Active,
            SessionState::Paused,
            SessionState::Transferred,
        ] {
            assert!(state.is_live());
            assert!(!state.is_terminal());
        }
        for state in [
            SessionState::Completed,
            SessionState::Cancelled,
            SessionState::Timeout,
        ] {
            assert!(state.is_terminal());
            assert!(!state.is_live());
        }
    }

    #[test]
    fn enum_round_trips() {
        for t in [
            TaskType::AutoBargain,
            TaskType::AutoFollowUp,
            TaskType::ManualCustomerService,
            TaskType::ManualComplaint,
            TaskType::ManualUrgent,
        ] {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert_eq!("sent".parse::<TaskStatus>().unwrap(), TaskStatus::Sent);
        assert!("half_sent".parse::<TaskStatus>().is_err());
    }
}
