// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chatflow Server entry point.
//!
//! Wires the store, engine, dispatcher, harness, and timer scheduler
//! together and serves the HTTP API until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use chatflow_core::action::ActionExecutor;
use chatflow_core::automations::AutomationService;
use chatflow_core::dispatcher::TriggerDispatcher;
use chatflow_core::engine::Engine;
use chatflow_core::harness::TestHarness;
use chatflow_core::scheduler::{TimerScheduler, TimerSchedulerConfig};
use chatflow_core::store::{SqliteStore, Store};

use chatflow_server::config::Config;
use chatflow_server::gateway::{LogGateway, WebhookGateway};
use chatflow_server::routes::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatflow_core=info".parse().unwrap())
                .add_directive("chatflow_server=info".parse().unwrap()),
        )
        .init();

    info!("Starting Chatflow Server");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        database = %config.database_path,
        gateway = config.gateway_url.as_deref().unwrap_or("(log only)"),
        "Configuration loaded"
    );

    // Open the database; this runs migrations
    let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&config.database_path).await?);
    store.health_check_db().await?;
    info!("Database ready");

    // Messaging gateway
    let actions = match &config.gateway_url {
        Some(url) => ActionExecutor::new(Arc::new(WebhookGateway::new(url.clone())?)),
        None => ActionExecutor::new(Arc::new(LogGateway)),
    };

    let engine = Engine::new(store.clone(), actions);

    // Background timer scheduler
    let scheduler = TimerScheduler::new(
        store.clone(),
        engine.clone(),
        TimerSchedulerConfig {
            poll_interval: config.timer_poll_interval,
            batch_size: config.timer_batch_size,
            reconcile_grace: config.timer_reconcile_grace,
        },
    );
    let scheduler_shutdown = scheduler.shutdown_handle();
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    let state = Arc::new(AppState {
        service: AutomationService::new(store.clone()),
        dispatcher: TriggerDispatcher::new(store.clone(), engine.clone()),
        harness: TestHarness::new(store.clone(), engine),
        store,
    });

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down...");
    scheduler_shutdown.notify_one();
    scheduler_handle.await?;
    info!("Shutdown complete");

    Ok(())
}
