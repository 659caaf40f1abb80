// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Loads session, ingest, dispatch, store, queue, and notifier settings from env vars
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Environment-based configuration management.
//!
//! Every knob has a default; deployments override through environment
//! variables. `summary()` is logged once at startup.

use std::env;

use serde::{Deserialize, Serialize};

use crate::constants::{dispatch_defaults, session_defaults};
use crate::errors::AppResult;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// HTTP port
    pub http_port: u16,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// Message ingestion settings
    pub ingest: IngestConfig,
    /// Dispatch and reconciliation settings
    pub dispatch: DispatchConfig,
    /// Store backend settings
    pub store: StoreConfig,
    /// Queue backend settings
    pub queue: QueueSettings,
    /// Notification delivery settings
    pub notifier: NotifierConfig,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default inactivity window for bot sessions, minutes
    pub default_bot_max_inactive_minutes: i64,
    /// Default inactivity window for human sessions, minutes
    pub default_human_max_inactive_minutes: i64,
    /// Grace window for a PENDING session to be activated, seconds
    pub pending_grace_seconds: i64,
}

/// Message ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Silence gap that opens a new session, minutes
    pub session_gap_minutes: i64,
    /// Window for matching account messages against outstanding send-tasks, minutes
    pub intervention_match_minutes: i64,
}

/// Dispatch and reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Reconciler cadence, seconds
    pub reconcile_interval_seconds: u64,
    /// Age past which a PENDING task is re-queued, seconds
    pub pending_task_grace_seconds: i64,
    /// Reaper cadence, seconds
    pub reap_interval_seconds: u64,
    /// Outbox dispatcher cadence, seconds
    pub outbox_interval_seconds: u64,
    /// Per-request store/queue deadline, seconds
    pub request_deadline_seconds: u64,
    /// Template producing `send_url` from `{platform}` and `{shop_id}`
    pub send_url_template: String,
}

/// Store backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string; scheme selects the backend
    pub dsn: String,
}

/// Queue backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue URL; `memory:` or `redis://…`
    pub url: String,
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Endpoint receiving operation notifications; empty disables delivery
    pub endpoint: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match callers that layer
    /// validation on top.
    pub fn from_env() -> AppResult<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            http_port: env_parse("HTTP_PORT", 8000),
            session: SessionConfig {
                default_bot_max_inactive_minutes: env_parse(
                    "SESSION_BOT_MAX_INACTIVE_MINUTES",
                    session_defaults::BOT_MAX_INACTIVE_MINUTES,
                ),
                default_human_max_inactive_minutes: env_parse(
                    "SESSION_HUMAN_MAX_INACTIVE_MINUTES",
                    session_defaults::HUMAN_MAX_INACTIVE_MINUTES,
                ),
                pending_grace_seconds: env_parse(
                    "SESSION_PENDING_GRACE_SECONDS",
                    session_defaults::PENDING_GRACE_SECONDS,
                ),
            },
            ingest: IngestConfig {
                session_gap_minutes: env_parse(
                    "INGEST_SESSION_GAP_MINUTES",
                    session_defaults::SESSION_GAP_MINUTES,
                ),
                intervention_match_minutes: env_parse(
                    "INGEST_INTERVENTION_MATCH_MINUTES",
                    session_defaults::INTERVENTION_MATCH_MINUTES,
                ),
            },
            dispatch: DispatchConfig {
                reconcile_interval_seconds: env_parse(
                    "DISPATCH_RECONCILE_INTERVAL_SECONDS",
                    dispatch_defaults::RECONCILE_INTERVAL_SECONDS,
                ),
                pending_task_grace_seconds: env_parse(
                    "DISPATCH_PENDING_TASK_GRACE_SECONDS",
                    dispatch_defaults::PENDING_TASK_GRACE_SECONDS,
                ),
                reap_interval_seconds: env_parse(
                    "DISPATCH_REAP_INTERVAL_SECONDS",
                    dispatch_defaults::REAP_INTERVAL_SECONDS,
                ),
                outbox_interval_seconds: env_parse(
                    "DISPATCH_OUTBOX_INTERVAL_SECONDS",
                    dispatch_defaults::OUTBOX_INTERVAL_SECONDS,
                ),
                request_deadline_seconds: env_parse(
                    "REQUEST_DEADLINE_SECONDS",
                    dispatch_defaults::REQUEST_DEADLINE_SECONDS,
                ),
                send_url_template: env::var("SEND_URL_TEMPLATE").unwrap_or_else(|_| {
                    "https://chat.{platform}.example.com/shops/{shop_id}/im".into()
                }),
            },
            store: StoreConfig {
                dsn: env::var("STORE_DSN").unwrap_or_else(|_| "sqlite::memory:".into()),
            },
            queue: QueueSettings {
                url: env::var("QUEUE_URL").unwrap_or_else(|_| "memory:".into()),
            },
            notifier: NotifierConfig {
                endpoint: env::var("NOTIFIER_ENDPOINT").ok().filter(|s| !s.is_empty()),
            },
        })
    }

    /// One-line startup summary, safe to log (no credentials)
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "host={} port={} store={} queue={} notifier={} gap={}m reconcile={}s",
            self.host,
            self.http_port,
            redact_dsn(&self.store.dsn),
            redact_dsn(&self.queue.url),
            self.notifier.endpoint.as_deref().unwrap_or("disabled"),
            self.ingest.session_gap_minutes,
            self.dispatch.reconcile_interval_seconds,
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Strip userinfo from a connection string before logging
fn redact_dsn(dsn: &str) -> String {
    match (dsn.find("://"), dsn.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://…@{}", &dsn[..scheme_end], &dsn[at + 1..])
        }
        _ => dsn.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.ingest.session_gap_minutes, 30);
        assert_eq!(config.session.pending_grace_seconds, 60);
        assert_eq!(config.dispatch.reconcile_interval_seconds, 30);
    }

    #[test]
    fn dsn_redaction_hides_userinfo() {
        assert_eq!(
            redact_dsn("postgresql://user:pw@db:5432/broker"),
            "postgresql://…@db:5432/broker"
        );
        assert_eq!(redact_dsn("sqlite::memory:"), "sqlite::memory:");
    }
}
