// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable timer scheduler.
//!
//! Polls the timer table and wakes runs whose `time_gap` delay elapsed.
//! Claiming deletes the timer row in the same statement, so each entry is
//! delivered at most once even with several scheduler instances polling.
//!
//! A second, slower sweep backstops the timer table: a run can be left
//! suspended with no timer row if the process dies between persisting the
//! run and inserting the timer. Any production run whose wake deadline is
//! past the grace window gets a timer fired directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument};

use crate::engine::Engine;
use crate::error::Result;
use crate::model::RunEvent;
use crate::store::Store;

/// Timer scheduler settings.
#[derive(Debug, Clone)]
pub struct TimerSchedulerConfig {
    /// How often to poll for due timers.
    pub poll_interval: Duration,
    /// Maximum timers claimed per sweep.
    pub batch_size: i64,
    /// How far past its deadline a run must be before the reconciliation
    /// sweep assumes its timer row was lost.
    pub reconcile_grace: Duration,
}

impl Default for TimerSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 32,
            reconcile_grace: Duration::from_secs(60),
        }
    }
}

/// Background poller that fires due timers.
pub struct TimerScheduler {
    store: Arc<dyn Store>,
    engine: Engine,
    config: TimerSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl TimerScheduler {
    /// Create a scheduler over the given store and engine.
    pub fn new(store: Arc<dyn Store>, engine: Engine, config: TimerSchedulerConfig) -> Self {
        Self {
            store,
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops the polling loop when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run the polling loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.config.poll_interval,
            "timer scheduler started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "timer sweep failed");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("timer scheduler stopping");
                    break;
                }
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let fired = self.process_due().await?;
        let reconciled = self.reconcile_overdue().await?;
        if fired > 0 || reconciled > 0 {
            debug!(fired, reconciled, "timer sweep done");
        }
        Ok(())
    }

    /// Claim and fire due timers. Returns how many runs were woken.
    #[instrument(skip(self))]
    pub async fn process_due(&self) -> Result<usize> {
        let due = self
            .store
            .take_due_timers(Utc::now(), self.config.batch_size)
            .await?;

        let mut fired = 0;
        for entry in due {
            match self
                .engine
                .handle_event(&entry.run_id, RunEvent::TimerFired)
                .await
            {
                Ok(outcome) if outcome.applied => fired += 1,
                // Run moved on (or terminated) before the timer fired.
                Ok(_) => debug!(run_id = %entry.run_id, "stale timer dropped"),
                Err(e) => {
                    // The claimed entry is gone; the reconciliation sweep
                    // picks the run up again if it is still suspended.
                    error!(run_id = %entry.run_id, error = %e, "timer delivery failed");
                }
            }
        }
        Ok(fired)
    }

    /// Wake suspended runs whose timer row went missing. Returns how many
    /// runs were woken.
    #[instrument(skip(self))]
    pub async fn reconcile_overdue(&self) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.config.reconcile_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - grace;

        let overdue = self
            .store
            .overdue_time_gap_runs(cutoff, self.config.batch_size)
            .await?;

        let mut woken = 0;
        for run in overdue {
            // Drop any surviving timer row first so the next sweep doesn't
            // deliver a duplicate.
            self.store.delete_timer(&run.run_id).await?;
            match self
                .engine
                .handle_event(&run.run_id, RunEvent::TimerFired)
                .await
            {
                Ok(outcome) if outcome.applied => {
                    info!(run_id = %run.run_id, "reconciled lost timer");
                    woken += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "timer reconciliation failed");
                }
            }
        }
        Ok(woken)
    }
}
