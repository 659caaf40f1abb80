// ABOUTME: System-wide constants and default configuration values for the session broker
// ABOUTME: Contains HTTP status codes, queue keys, platform markers, and timing defaults
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Application constants grouped by concern.

/// HTTP status codes used by the error mapping
pub mod http_status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const UNPROCESSABLE_ENTITY: u16 = 422;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// Service identity for logging and health reporting
pub mod service_names {
    pub const SESSION_BROKER: &str = "session-broker";
}

/// Queue naming
pub mod queue {
    /// Redis list key holding pending send-task ids
    pub const SEND_TASK_QUEUE_KEY: &str = "send_tasks:pending";

    /// Redis set key mirroring queue membership for idempotent pushes
    pub const SEND_TASK_MEMBER_KEY: &str = "send_tasks:queued";
}

/// Platform conventions
pub mod platform {
    /// Nick prefix that marks a message as sent by one of our bot accounts
    pub const ACCOUNT_NICK_PREFIX: &str = "t-";

    /// Default chat platform name when the caller omits one
    pub const DEFAULT_PLATFORM: &str = "taotian";
}

/// Session lifecycle defaults (all overridable via configuration)
pub mod session_defaults {
    /// Inactivity window for bot sessions, minutes
    pub const BOT_MAX_INACTIVE_MINUTES: i64 = 60;

    /// Inactivity window for human sessions, minutes
    pub const HUMAN_MAX_INACTIVE_MINUTES: i64 = 480;

    /// Grace window for a PENDING session to be activated, seconds
    pub const PENDING_GRACE_SECONDS: i64 = 60;

    /// Silence gap that splits message traffic into a new session, minutes
    pub const SESSION_GAP_MINUTES: i64 = 30;

    /// Window within which an account message may match an outstanding
    /// send-task's content, minutes
    pub const INTERVENTION_MATCH_MINUTES: i64 = 10;
}

/// Dispatch and reconciliation defaults
pub mod dispatch_defaults {
    /// How often the reconciler re-queues stuck PENDING tasks, seconds
    pub const RECONCILE_INTERVAL_SECONDS: u64 = 30;

    /// Age past which a PENDING task is considered stuck, seconds
    pub const PENDING_TASK_GRACE_SECONDS: i64 = 60;

    /// How often the reaper scans for expired sessions, seconds
    pub const REAP_INTERVAL_SECONDS: u64 = 60;

    /// How often the outbox dispatcher drains operations, seconds
    pub const OUTBOX_INTERVAL_SECONDS: u64 = 5;

    /// Per-request deadline for store and queue work, seconds
    pub const REQUEST_DEADLINE_SECONDS: u64 = 10;
}

/// Retry policy for downstream calls
pub mod retry_defaults {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY_MS: u64 = 200;
    pub const BACKOFF_FACTOR: u32 = 2;
}
