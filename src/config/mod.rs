// ABOUTME: Configuration module for deployment-specific settings
// ABOUTME: Re-exports the environment-based server configuration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

//! Configuration loading from environment variables.

pub mod environment;

pub use environment::{
    DispatchConfig, IngestConfig, NotifierConfig, QueueSettings, ServerConfig, SessionConfig,
    StoreConfig,
};
