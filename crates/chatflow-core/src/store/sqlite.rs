// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{EngineError, Result};
use crate::model::{
    Automation, AutomationStatus, FlowSnapshot, Run, RunOutcome, Step, StepConfig, TimerEntry,
    Trigger, WaitKind,
};

use super::Store;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing pool.
    ///
    /// The caller is responsible for running migrations; see
    /// [`SqliteStore::from_path`] for a constructor that handles setup.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create an in-memory store with migrations applied. Test use only.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct AutomationRow {
    automation_id: String,
    name: String,
    trigger: String,
    channel_id: Option<String>,
    status: String,
    snapshot_id: Option<String>,
    execution_count: i64,
    last_executed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AutomationRow {
    fn into_model(self) -> Result<Automation> {
        Ok(Automation {
            trigger: Trigger::from_str(&self.trigger).map_err(decode_error)?,
            status: AutomationStatus::from_str(&self.status).map_err(decode_error)?,
            automation_id: self.automation_id,
            name: self.name,
            channel_id: self.channel_id,
            snapshot_id: self.snapshot_id,
            execution_count: self.execution_count,
            last_executed_at: self.last_executed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    step_id: String,
    automation_id: String,
    position: i32,
    config: String,
    next_step_id: Option<String>,
}

impl StepRow {
    fn into_model(self) -> Result<Step> {
        let config: StepConfig = serde_json::from_str(&self.config)?;
        Ok(Step {
            step_id: self.step_id,
            automation_id: self.automation_id,
            position: self.position,
            config,
            next_step_id: self.next_step_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot_id: String,
    automation_id: String,
    entry_step_id: String,
    steps: String,
    created_at: DateTime<Utc>,
}

impl SnapshotRow {
    fn into_model(self) -> Result<FlowSnapshot> {
        let steps: HashMap<String, Step> = serde_json::from_str(&self.steps)?;
        Ok(FlowSnapshot {
            snapshot_id: self.snapshot_id,
            automation_id: self.automation_id,
            entry_step_id: self.entry_step_id,
            steps,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    automation_id: String,
    conversation_id: String,
    contact_id: String,
    snapshot_id: String,
    current_step_id: Option<String>,
    waiting_for: Option<String>,
    variables: String,
    outcome: String,
    last_error: Option<String>,
    is_test: bool,
    wake_at: Option<DateTime<Utc>>,
    version: i64,
    started_at: DateTime<Utc>,
    last_advanced_at: DateTime<Utc>,
}

impl RunRow {
    fn into_model(self) -> Result<Run> {
        let waiting_for = self
            .waiting_for
            .as_deref()
            .map(WaitKind::from_str)
            .transpose()
            .map_err(decode_error)?;
        let variables: BTreeMap<String, String> = serde_json::from_str(&self.variables)?;
        Ok(Run {
            outcome: RunOutcome::from_str(&self.outcome).map_err(decode_error)?,
            run_id: self.run_id,
            automation_id: self.automation_id,
            conversation_id: self.conversation_id,
            contact_id: self.contact_id,
            snapshot_id: self.snapshot_id,
            current_step_id: self.current_step_id,
            waiting_for,
            variables,
            last_error: self.last_error,
            is_test: self.is_test,
            wake_at: self.wake_at,
            version: self.version,
            started_at: self.started_at,
            last_advanced_at: self.last_advanced_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TimerRow {
    run_id: String,
    due_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

fn decode_error(details: String) -> EngineError {
    EngineError::DatabaseError {
        operation: "decode".to_string(),
        details,
    }
}

const RUN_COLUMNS: &str = "run_id, automation_id, conversation_id, contact_id, snapshot_id, \
     current_step_id, waiting_for, variables, outcome, last_error, is_test, \
     wake_at, version, started_at, last_advanced_at";

// ============================================================================
// Store Implementation
// ============================================================================

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn insert_automation(&self, automation: &Automation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO automations
                (automation_id, name, trigger, channel_id, status, snapshot_id,
                 execution_count, last_executed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&automation.automation_id)
        .bind(&automation.name)
        .bind(automation.trigger.as_str())
        .bind(&automation.channel_id)
        .bind(automation.status.as_str())
        .bind(&automation.snapshot_id)
        .bind(automation.execution_count)
        .bind(automation.last_executed_at)
        .bind(automation.created_at)
        .bind(automation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_automation(&self, automation: &Automation) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE automations
            SET name = ?, trigger = ?, channel_id = ?, updated_at = ?
            WHERE automation_id = ?
            "#,
        )
        .bind(&automation.name)
        .bind(automation.trigger.as_str())
        .bind(&automation.channel_id)
        .bind(Utc::now())
        .bind(&automation.automation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::AutomationNotFound {
                automation_id: automation.automation_id.clone(),
            });
        }
        Ok(())
    }

    async fn get_automation(&self, automation_id: &str) -> Result<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(
            r#"
            SELECT automation_id, name, trigger, channel_id, status, snapshot_id,
                   execution_count, last_executed_at, created_at, updated_at
            FROM automations
            WHERE automation_id = ?
            "#,
        )
        .bind(automation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AutomationRow::into_model).transpose()
    }

    async fn list_automations(&self) -> Result<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(
            r#"
            SELECT automation_id, name, trigger, channel_id, status, snapshot_id,
                   execution_count, last_executed_at, created_at, updated_at
            FROM automations
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AutomationRow::into_model).collect()
    }

    async fn delete_automation(&self, automation_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM steps WHERE automation_id = ?")
            .bind(automation_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM automations WHERE automation_id = ?")
            .bind(automation_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::AutomationNotFound {
                automation_id: automation_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_automation_status(
        &self,
        automation_id: &str,
        status: AutomationStatus,
        snapshot_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE automations
            SET status = ?, snapshot_id = ?, updated_at = ?
            WHERE automation_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(snapshot_id)
        .bind(Utc::now())
        .bind(automation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::AutomationNotFound {
                automation_id: automation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_execution(&self, automation_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE automations
            SET execution_count = execution_count + 1, last_executed_at = ?
            WHERE automation_id = ?
            "#,
        )
        .bind(at)
        .bind(automation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_automations_for_trigger(
        &self,
        trigger: Trigger,
        channel_id: &str,
    ) -> Result<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(
            r#"
            SELECT automation_id, name, trigger, channel_id, status, snapshot_id,
                   execution_count, last_executed_at, created_at, updated_at
            FROM automations
            WHERE status = 'active'
              AND trigger = ?
              AND (channel_id IS NULL OR channel_id = ?)
            ORDER BY created_at
            "#,
        )
        .bind(trigger.as_str())
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AutomationRow::into_model).collect()
    }

    async fn replace_steps(&self, automation_id: &str, steps: &[Step]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM steps WHERE automation_id = ?")
            .bind(automation_id)
            .execute(&mut *tx)
            .await?;

        for step in steps {
            let config = serde_json::to_string(&step.config)?;
            sqlx::query(
                r#"
                INSERT INTO steps (step_id, automation_id, position, config, next_step_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&step.step_id)
            .bind(automation_id)
            .bind(step.position)
            .bind(config)
            .bind(&step.next_step_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_steps(&self, automation_id: &str) -> Result<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT step_id, automation_id, position, config, next_step_id
            FROM steps
            WHERE automation_id = ?
            ORDER BY position
            "#,
        )
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_model).collect()
    }

    async fn save_snapshot(&self, snapshot: &FlowSnapshot) -> Result<()> {
        let steps = serde_json::to_string(&snapshot.steps)?;
        sqlx::query(
            r#"
            INSERT INTO flow_snapshots (snapshot_id, automation_id, entry_step_id, steps, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.snapshot_id)
        .bind(&snapshot.automation_id)
        .bind(&snapshot.entry_step_id)
        .bind(steps)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_snapshot(&self, snapshot_id: &str) -> Result<Option<FlowSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT snapshot_id, automation_id, entry_step_id, steps, created_at
            FROM flow_snapshots
            WHERE snapshot_id = ?
            "#,
        )
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SnapshotRow::into_model).transpose()
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        let variables = serde_json::to_string(&run.variables)?;
        let result = sqlx::query(
            r#"
            INSERT INTO runs
                (run_id, automation_id, conversation_id, contact_id, snapshot_id,
                 current_step_id, waiting_for, variables, outcome, last_error,
                 is_test, wake_at, version, started_at, last_advanced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.automation_id)
        .bind(&run.conversation_id)
        .bind(&run.contact_id)
        .bind(&run.snapshot_id)
        .bind(&run.current_step_id)
        .bind(run.waiting_for.map(|w| w.as_str()))
        .bind(variables)
        .bind(run.outcome.as_str())
        .bind(&run.last_error)
        .bind(run.is_test)
        .bind(run.wake_at)
        .bind(run.version)
        .bind(run.started_at)
        .bind(run.last_advanced_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(EngineError::RunAlreadyActive {
                    automation_id: run.automation_id.clone(),
                    conversation_id: run.conversation_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE run_id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRow::into_model).transpose()
    }

    async fn find_active_run(
        &self,
        automation_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs \
             WHERE automation_id = ? AND conversation_id = ? AND outcome = 'running'",
            RUN_COLUMNS
        ))
        .bind(automation_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRow::into_model).transpose()
    }

    async fn waiting_runs_for_conversation(&self, conversation_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs \
             WHERE conversation_id = ? AND outcome = 'running' \
               AND waiting_for IN ('user_reply', 'keyword_catch') \
             ORDER BY started_at",
            RUN_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_model).collect()
    }

    async fn update_run(&self, run: &Run) -> Result<bool> {
        let variables = serde_json::to_string(&run.variables)?;
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET current_step_id = ?, waiting_for = ?, variables = ?, outcome = ?,
                last_error = ?, wake_at = ?, last_advanced_at = ?,
                version = version + 1
            WHERE run_id = ? AND version = ?
            "#,
        )
        .bind(&run.current_step_id)
        .bind(run.waiting_for.map(|w| w.as_str()))
        .bind(variables)
        .bind(run.outcome.as_str())
        .bind(&run.last_error)
        .bind(run.wake_at)
        .bind(run.last_advanced_at)
        .bind(&run.run_id)
        .bind(run.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_runs_for_automation(&self, automation_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM timers
            WHERE run_id IN (
                SELECT run_id FROM runs
                WHERE automation_id = ? AND outcome = 'running'
            )
            "#,
        )
        .bind(automation_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET outcome = 'cancelled', waiting_for = NULL, wake_at = NULL,
                last_advanced_at = ?, version = version + 1
            WHERE automation_id = ? AND outcome = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(automation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn schedule_timer(&self, run_id: &str, due_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timers (run_id, due_at, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET due_at = excluded.due_at
            "#,
        )
        .bind(run_id)
        .bind(due_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_timer(&self, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM timers WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn take_due_timers(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TimerEntry>> {
        let rows = sqlx::query_as::<_, TimerRow>(
            r#"
            DELETE FROM timers
            WHERE run_id IN (
                SELECT run_id FROM timers
                WHERE due_at <= ?
                ORDER BY due_at
                LIMIT ?
            )
            RETURNING run_id, due_at, created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TimerEntry {
                run_id: r.run_id,
                due_at: r.due_at,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn overdue_time_gap_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs \
             WHERE outcome = 'running' AND waiting_for = 'time_gap' \
               AND is_test = 0 AND wake_at IS NOT NULL AND wake_at <= ? \
             ORDER BY wake_at \
             LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_model).collect()
    }

    async fn health_check_db(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeywordAction;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn sample_steps(automation_id: &str) -> Vec<Step> {
        vec![
            Step {
                step_id: "ask".to_string(),
                automation_id: automation_id.to_string(),
                position: 1,
                config: StepConfig::UserReply {
                    question: "Name?".to_string(),
                    save_as: "name".to_string(),
                },
                next_step_id: Some("gate".to_string()),
            },
            Step {
                step_id: "gate".to_string(),
                automation_id: automation_id.to_string(),
                position: 2,
                config: StepConfig::KeywordCatch {
                    keywords: vec!["yes".to_string()],
                    action: KeywordAction::Continue,
                    overrides: BTreeMap::new(),
                },
                next_step_id: None,
            },
        ]
    }

    async fn seeded_run(store: &SqliteStore) -> Run {
        let automation = Automation::new("welcome", Trigger::NewConversation, None);
        store.insert_automation(&automation).await.unwrap();
        let steps = sample_steps(&automation.automation_id);
        let snapshot = FlowSnapshot::capture(&automation.automation_id, &steps).unwrap();
        store.save_snapshot(&snapshot).await.unwrap();
        let run = Run::new(&automation.automation_id, "conv-1", "contact-1", &snapshot);
        store.insert_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_automation_round_trip() {
        let store = store().await;
        let automation = Automation::new("welcome", Trigger::NewConversation, Some("wa".into()));
        store.insert_automation(&automation).await.unwrap();

        let loaded = store
            .get_automation(&automation.automation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "welcome");
        assert_eq!(loaded.channel_id.as_deref(), Some("wa"));
        assert_eq!(loaded.status, AutomationStatus::Inactive);

        store
            .set_automation_status(&automation.automation_id, AutomationStatus::Active, None)
            .await
            .unwrap();
        let matches = store
            .active_automations_for_trigger(Trigger::NewConversation, "wa")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);

        // Channel-scoped automations don't match other channels.
        let matches = store
            .active_automations_for_trigger(Trigger::NewConversation, "sms")
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_unscoped_automation_matches_every_channel() {
        let store = store().await;
        let mut automation = Automation::new("global", Trigger::NewConversation, None);
        automation.status = AutomationStatus::Active;
        store.insert_automation(&automation).await.unwrap();

        let matches = store
            .active_automations_for_trigger(Trigger::NewConversation, "anything")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn test_steps_and_snapshot_round_trip() {
        let store = store().await;
        let automation = Automation::new("welcome", Trigger::NewConversation, None);
        store.insert_automation(&automation).await.unwrap();

        let steps = sample_steps(&automation.automation_id);
        store
            .replace_steps(&automation.automation_id, &steps)
            .await
            .unwrap();

        let loaded = store.list_steps(&automation.automation_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].step_id, "ask");
        assert!(matches!(loaded[0].config, StepConfig::UserReply { .. }));

        let snapshot = FlowSnapshot::capture(&automation.automation_id, &loaded).unwrap();
        store.save_snapshot(&snapshot).await.unwrap();
        let loaded_snapshot = store
            .load_snapshot(&snapshot.snapshot_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded_snapshot.entry_step_id, "ask");
        assert_eq!(loaded_snapshot.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_active_run_rejected() {
        let store = store().await;
        let run = seeded_run(&store).await;

        let snapshot = store
            .load_snapshot(&run.snapshot_id)
            .await
            .unwrap()
            .unwrap();
        let duplicate = Run::new(&run.automation_id, "conv-1", "contact-1", &snapshot);
        let err = store.insert_run(&duplicate).await.unwrap_err();
        assert!(matches!(err, EngineError::RunAlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_update_run_version_check() {
        let store = store().await;
        let mut run = seeded_run(&store).await;

        run.waiting_for = Some(WaitKind::UserReply);
        assert!(store.update_run(&run).await.unwrap());

        // Stale write: the stored version moved past ours.
        assert!(!store.update_run(&run).await.unwrap());

        let reloaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(reloaded.version, run.version + 1);
        assert_eq!(reloaded.waiting_for, Some(WaitKind::UserReply));
    }

    #[tokio::test]
    async fn test_take_due_timers_claims_once() {
        let store = store().await;
        let run = seeded_run(&store).await;

        let now = Utc::now();
        store
            .schedule_timer(&run.run_id, now - Duration::seconds(5))
            .await
            .unwrap();

        let claimed = store.take_due_timers(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].run_id, run.run_id);

        // Second sweep finds nothing.
        let claimed = store.take_due_timers(now, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_take_due_timers_skips_future() {
        let store = store().await;
        let run = seeded_run(&store).await;

        let now = Utc::now();
        store
            .schedule_timer(&run.run_id, now + Duration::seconds(60))
            .await
            .unwrap();

        let claimed = store.take_due_timers(now, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_runs_clears_timers() {
        let store = store().await;
        let mut run = seeded_run(&store).await;

        run.waiting_for = Some(WaitKind::TimeGap);
        run.wake_at = Some(Utc::now() + Duration::seconds(30));
        assert!(store.update_run(&run).await.unwrap());
        store
            .schedule_timer(&run.run_id, run.wake_at.unwrap())
            .await
            .unwrap();

        let cancelled = store
            .cancel_runs_for_automation(&run.automation_id)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let reloaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(reloaded.outcome, RunOutcome::Cancelled);
        assert!(reloaded.waiting_for.is_none());

        let claimed = store
            .take_due_timers(Utc::now() + Duration::seconds(120), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_overdue_time_gap_runs_excludes_tests() {
        let store = store().await;
        let mut run = seeded_run(&store).await;

        run.waiting_for = Some(WaitKind::TimeGap);
        run.wake_at = Some(Utc::now() - Duration::seconds(300));
        assert!(store.update_run(&run).await.unwrap());

        let overdue = store
            .overdue_time_gap_runs(Utc::now() - Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].run_id, run.run_id);

        // Not yet past the grace cutoff.
        let overdue = store
            .overdue_time_gap_runs(Utc::now() - Duration::seconds(600), 10)
            .await
            .unwrap();
        assert!(overdue.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_runs_for_conversation() {
        let store = store().await;
        let mut run = seeded_run(&store).await;

        // Not waiting yet.
        let waiting = store.waiting_runs_for_conversation("conv-1").await.unwrap();
        assert!(waiting.is_empty());

        run.waiting_for = Some(WaitKind::KeywordCatch);
        assert!(store.update_run(&run).await.unwrap());

        let waiting = store.waiting_runs_for_conversation("conv-1").await.unwrap();
        assert_eq!(waiting.len(), 1);

        let waiting = store.waiting_runs_for_conversation("conv-9").await.unwrap();
        assert!(waiting.is_empty());
    }
}
