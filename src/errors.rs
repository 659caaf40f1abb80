// ABOUTME: Centralized error handling and error types for the session broker API
// ABOUTME: Defines stable error codes, HTTP status mapping, and the shared response envelope
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! # Unified Error Handling
//!
//! Stable wire error codes, the `AppError` type carried through every
//! fallible path, and the JSON envelope all handlers respond with.

use std::fmt::{self, Display};

use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::warn;

use crate::constants::http_status::{
    BAD_REQUEST, CONFLICT, GATEWAY_TIMEOUT, INTERNAL_SERVER_ERROR, NOT_FOUND,
    UNPROCESSABLE_ENTITY,
};

/// Stable error codes exposed on the wire
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// An active session already occupies the `(account, shop)` slot, or a
    /// downstream dependency exhausted its retries
    Unavailable,
    /// No send-task record for the requested task id
    TaskNotFound,
    /// No session record for the requested session id
    SessionNotFound,
    /// The requested state transition is not in the allowed graph
    InvalidState,
    /// A message batch carried no bot-account nick and no override
    NoAccount,
    /// The request deadline elapsed during store or queue work
    DeadlineExceeded,
    /// Request failed schema or semantic validation
    Validation,
    /// Internal invariant violation or unexpected failure
    Internal,
}

impl ErrorCode {
    /// Stable string form used in the response envelope
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "UNAVAILABLE",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::NoAccount => "NO_ACCOUNT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Validation => "VALIDATION",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status accompanying this code
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Unavailable => CONFLICT,
            Self::TaskNotFound | Self::SessionNotFound => NOT_FOUND,
            Self::InvalidState => UNPROCESSABLE_ENTITY,
            Self::NoAccount | Self::Validation => BAD_REQUEST,
            Self::DeadlineExceeded => GATEWAY_TIMEOUT,
            Self::Internal => INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic description used when no specific message applies
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unavailable => "The session slot or a downstream dependency is unavailable",
            Self::TaskNotFound => "The requested send-task was not found",
            Self::SessionNotFound => "The requested session was not found",
            Self::InvalidState => "The requested state transition is not allowed",
            Self::NoAccount => "No bot account identity could be derived from the batch",
            Self::DeadlineExceeded => "The request deadline elapsed",
            Self::Validation => "The request failed validation",
            Self::Internal => "An internal error occurred",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "UNAVAILABLE" => Ok(Self::Unavailable),
            "TASK_NOT_FOUND" => Ok(Self::TaskNotFound),
            "SESSION_NOT_FOUND" => Ok(Self::SessionNotFound),
            "INVALID_STATE" => Ok(Self::InvalidState),
            "NO_ACCOUNT" => Ok(Self::NoAccount),
            "DEADLINE_EXCEEDED" => Ok(Self::DeadlineExceeded),
            "VALIDATION" => Ok(Self::Validation),
            "INTERNAL" => Ok(Self::Internal),
            _ => Err(serde::de::Error::unknown_variant(&s, &[])),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error carried through every fallible path
#[derive(Debug, Clone, ThisError)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Structured payload attached to the envelope (e.g. conflict details)
    pub data: Option<serde_json::Value>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload to the error envelope
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// HTTP status for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Session-slot conflict
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// Send-task lookup miss
    #[must_use]
    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("send-task {task_id} not found"),
        )
    }

    /// Session lookup miss
    #[must_use]
    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        )
    }

    /// Illegal state transition
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    /// Missing account identity in a message batch
    #[must_use]
    pub fn no_account() -> Self {
        Self::new(
            ErrorCode::NoAccount,
            "message batch carries no bot-account nick and no account override",
        )
    }

    /// Deadline elapsed
    #[must_use]
    pub fn deadline_exceeded(operation: &str) -> Self {
        Self::new(
            ErrorCode::DeadlineExceeded,
            format!("deadline exceeded during {operation}"),
        )
    }

    /// Input validation failure
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Internal failure
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::internal(format!("store error: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Shared response envelope for every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable outcome description
    pub message: String,
    /// Operation payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Stable error code on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ApiResponse {
    /// Successful envelope with payload
    #[must_use]
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error_code: None,
        }
    }

    /// Failure envelope that still travels on a 200 (e.g. empty queue poll)
    #[must_use]
    pub fn soft_failure(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Some(data),
            error_code: None,
        }
    }
}

impl From<AppError> for ApiResponse {
    fn from(error: AppError) -> Self {
        Self {
            success: false,
            message: error.message.clone(),
            data: error.data,
            error_code: Some(error.code),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::http::StatusCode;
        use axum::Json;

        warn!("API error: {}: {}", self.code, self.message);

        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ApiResponse::from(self);

        (status, Json(envelope)).into_response()
    }
}
