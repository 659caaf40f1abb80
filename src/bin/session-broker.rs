// ABOUTME: Server binary wiring configuration, store, queue, and background tasks
// ABOUTME: Boots the HTTP surface for upstream producers and downstream RPA workers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Session Broker Contributors

#![forbid(unsafe_code)]

//! # Session Broker Server Binary
//!
//! Starts the session lifecycle and task-dispatch service: loads
//! configuration from the environment, opens the store and queue, spawns
//! the background loops, and serves the HTTP API.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use session_broker::config::ServerConfig;
use session_broker::database_plugins::factory::Store;
use session_broker::lifecycle::spawn_background_tasks;
use session_broker::logging;
use session_broker::queue::factory::Queue;
use session_broker::resources::ServerResources;
use session_broker::routes;

#[derive(Parser)]
#[command(name = "session-broker")]
#[command(about = "Session lifecycle and task-dispatch broker for RPA chat workers")]
pub struct Args {
    /// Override the HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Override the store DSN
    #[arg(long)]
    store_dsn: Option<String>,

    /// Override the queue URL
    #[arg(long)]
    queue_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = setup_configuration(&args)?;
    bootstrap_server(config).await
}

/// Load configuration from the environment and apply CLI overrides
fn setup_configuration(args: &Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::from_env()?;

    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }
    if let Some(store_dsn) = &args.store_dsn {
        config.store.dsn.clone_from(store_dsn);
    }
    if let Some(queue_url) = &args.queue_url {
        config.queue.url.clone_from(queue_url);
    }

    logging::init_from_env()?;
    info!("Starting session-broker");
    info!("{}", config.summary());

    Ok(config)
}

/// Open the store and queue, wire resources, spawn loops, and serve
async fn bootstrap_server(config: ServerConfig) -> Result<()> {
    let store = Store::from_dsn(&config.store.dsn)
        .await?;
    info!("Store initialized: {}", store.backend_info());

    let queue = Queue::from_url(&config.queue.url)
        .await?;
    info!("Queue initialized: {}", queue.backend_info());

    let bind_addr = format!("{}:{}", config.host, config.http_port);
    let resources = Arc::new(ServerResources::new(store, queue, Arc::new(config)));

    let background = spawn_background_tasks(&resources);
    info!(tasks = background.len(), "background tasks spawned");

    let app = routes::router(resources);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {bind_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
