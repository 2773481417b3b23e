// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core data model: automations, steps, flow snapshots, runs, and timers.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Automation
// ============================================================================

/// Event class that starts a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fire when a new conversation is opened on a channel.
    NewConversation,
}

impl Trigger {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::NewConversation => "new_conversation",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_conversation" => Ok(Trigger::NewConversation),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}

/// Lifecycle status of an automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    /// Eligible for triggering new runs.
    Active,
    /// Not triggering; existing runs were cancelled on deactivation.
    Inactive,
    /// Temporarily suspended by the operator; runs were cancelled.
    Paused,
}

impl AutomationStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationStatus::Active => "active",
            AutomationStatus::Inactive => "inactive",
            AutomationStatus::Paused => "paused",
        }
    }
}

impl FromStr for AutomationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AutomationStatus::Active),
            "inactive" => Ok(AutomationStatus::Inactive),
            "paused" => Ok(AutomationStatus::Paused),
            other => Err(format!("unknown automation status '{}'", other)),
        }
    }
}

/// An authored, reusable flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique identifier.
    pub automation_id: String,
    /// Human-readable name.
    pub name: String,
    /// Event class that starts runs of this automation.
    pub trigger: Trigger,
    /// Channel scope for the trigger; `None` matches every channel.
    pub channel_id: Option<String>,
    /// Current lifecycle status.
    pub status: AutomationStatus,
    /// Snapshot taken at the last activation; runs resolve steps through it.
    pub snapshot_id: Option<String>,
    /// Number of completed production runs.
    pub execution_count: i64,
    /// When a production run last completed.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// When the automation was created.
    pub created_at: DateTime<Utc>,
    /// When the automation was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    /// Create a new inactive automation.
    pub fn new(name: impl Into<String>, trigger: Trigger, channel_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            automation_id: Uuid::new_v4().to_string(),
            name: name.into(),
            trigger,
            channel_id,
            status: AutomationStatus::Inactive,
            snapshot_id: None,
            execution_count: 0,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

/// What to do when a keyword gate matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordAction {
    /// Advance to the next step (or the keyword's override edge).
    Continue,
    /// Terminate the run as completed.
    Stop,
}

/// Type-specific configuration of a step, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Send `question`, then suspend until the next inbound message;
    /// the message text is captured under the `save_as` variable.
    UserReply {
        /// Message sent before suspending.
        question: String,
        /// Variable name the inbound answer is stored under.
        save_as: String,
    },
    /// Suspend for `delay_seconds`, then resume via a durable timer.
    TimeGap {
        /// Wait duration in seconds; zero means "next scheduler sweep".
        delay_seconds: i64,
    },
    /// Resolve the referenced template, fill it with captured variables,
    /// send it, and continue immediately.
    SendTemplate {
        /// Template identifier resolved through the messaging gateway.
        template_id: String,
        /// Extra slot values; each value may itself reference `{{vars}}`.
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
    /// Send literal (interpolated) text and continue immediately.
    CustomReply {
        /// Message body; `{{name}}` placeholders are substituted.
        message: String,
    },
    /// Pure gate: suspend until an inbound message matches a keyword.
    KeywordCatch {
        /// Keywords compared case-insensitively as substrings.
        keywords: Vec<String>,
        /// Action applied on the first matching keyword.
        action: KeywordAction,
        /// Optional per-keyword branch edges (`keyword -> step_id`);
        /// absent keys fall back to `next_step_id`.
        #[serde(default)]
        overrides: BTreeMap<String, String>,
    },
}

impl StepConfig {
    /// Short name of the step type, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::UserReply { .. } => "user_reply",
            StepConfig::TimeGap { .. } => "time_gap",
            StepConfig::SendTemplate { .. } => "send_template",
            StepConfig::CustomReply { .. } => "custom_reply",
            StepConfig::KeywordCatch { .. } => "keyword_catch",
        }
    }
}

/// One typed unit of work in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within the automation.
    pub step_id: String,
    /// Owning automation.
    pub automation_id: String,
    /// Editor ordering; the lowest position is the entry step.
    pub position: i32,
    /// Type-specific configuration.
    pub config: StepConfig,
    /// Default edge; `None` means end of flow.
    pub next_step_id: Option<String>,
}

/// Return the entry step: the one with the lowest position.
pub fn entry_step(steps: &[Step]) -> Option<&Step> {
    steps.iter().min_by_key(|s| s.position)
}

// ============================================================================
// Flow snapshots
// ============================================================================

/// Immutable copy of a flow's step graph taken at activation time.
///
/// Runs reference a snapshot, never the live (editable) step table, so edits
/// made while runs are in flight cannot corrupt them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Unique identifier.
    pub snapshot_id: String,
    /// Automation this snapshot was taken from.
    pub automation_id: String,
    /// Entry step at capture time.
    pub entry_step_id: String,
    /// Step graph keyed by step id.
    pub steps: HashMap<String, Step>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Capture a snapshot from the live steps of an automation.
    ///
    /// Returns `None` when the flow has no steps (a flow without steps
    /// cannot be activated).
    pub fn capture(automation_id: &str, steps: &[Step]) -> Option<Self> {
        let entry = entry_step(steps)?;
        Some(Self {
            snapshot_id: Uuid::new_v4().to_string(),
            automation_id: automation_id.to_string(),
            entry_step_id: entry.step_id.clone(),
            steps: steps
                .iter()
                .map(|s| (s.step_id.clone(), s.clone()))
                .collect(),
            created_at: Utc::now(),
        })
    }

    /// Look up a step by id within the snapshot.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Why a run is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Waiting for the next inbound message to capture as an answer.
    UserReply,
    /// Waiting for a durable timer to fire.
    TimeGap,
    /// Waiting for an inbound message matching a keyword.
    KeywordCatch,
}

impl WaitKind {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitKind::UserReply => "user_reply",
            WaitKind::TimeGap => "time_gap",
            WaitKind::KeywordCatch => "keyword_catch",
        }
    }
}

impl FromStr for WaitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_reply" => Ok(WaitKind::UserReply),
            "time_gap" => Ok(WaitKind::TimeGap),
            "keyword_catch" => Ok(WaitKind::KeywordCatch),
            other => Err(format!("unknown wait kind '{}'", other)),
        }
    }
}

/// Terminal/non-terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// In flight (possibly suspended).
    Running,
    /// Reached the end of the flow.
    Completed,
    /// A send failed non-retryably.
    Failed,
    /// The automation was paused or deleted while the run was in flight.
    Cancelled,
}

impl RunOutcome {
    /// Whether this outcome is terminal; terminal runs ignore all events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }

    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunOutcome::Running),
            "completed" => Ok(RunOutcome::Completed),
            "failed" => Ok(RunOutcome::Failed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            other => Err(format!("unknown run outcome '{}'", other)),
        }
    }
}

/// One live execution of an automation against one conversation.
///
/// At most one non-terminal run exists per (automation, conversation) pair;
/// the store enforces this with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier.
    pub run_id: String,
    /// Automation being executed.
    pub automation_id: String,
    /// Conversation the run is attached to.
    pub conversation_id: String,
    /// Contact on the other end of the conversation.
    pub contact_id: String,
    /// Step-graph snapshot the run resolves steps through.
    pub snapshot_id: String,
    /// Step the run is at; `None` only in terminal states.
    pub current_step_id: Option<String>,
    /// Suspension reason, if suspended.
    pub waiting_for: Option<WaitKind>,
    /// Variables captured so far (`save_as` answers).
    pub variables: BTreeMap<String, String>,
    /// Terminal/non-terminal state.
    pub outcome: RunOutcome,
    /// Last error recorded on the run, for operator visibility.
    pub last_error: Option<String>,
    /// Test runs are excluded from execution counters and sweeps.
    pub is_test: bool,
    /// When a `time_gap` wait is due; mirrors the timer entry so a lost
    /// timer can be re-derived by the reconciliation sweep.
    pub wake_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped on every persisted advance.
    pub version: i64,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run last advanced.
    pub last_advanced_at: DateTime<Utc>,
}

impl Run {
    /// Create a new run positioned at the snapshot's entry step.
    pub fn new(
        automation_id: &str,
        conversation_id: &str,
        contact_id: &str,
        snapshot: &FlowSnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            automation_id: automation_id.to_string(),
            conversation_id: conversation_id.to_string(),
            contact_id: contact_id.to_string(),
            snapshot_id: snapshot.snapshot_id.clone(),
            current_step_id: Some(snapshot.entry_step_id.clone()),
            waiting_for: None,
            variables: BTreeMap::new(),
            outcome: RunOutcome::Running,
            last_error: None,
            is_test: false,
            wake_at: None,
            version: 0,
            started_at: now,
            last_advanced_at: now,
        }
    }

    /// Mark this run as a test run (excluded from counters and sweeps).
    pub fn as_test(mut self) -> Self {
        self.is_test = true;
        self
    }
}

/// Incoming event the engine reacts to.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Begin executing from the entry step.
    Start,
    /// An inbound message arrived on the run's conversation.
    InboundMessage {
        /// Message text.
        text: String,
        /// When the message was received.
        received_at: DateTime<Utc>,
    },
    /// A durable timer for this run fired.
    TimerFired,
}

// ============================================================================
// Timers
// ============================================================================

/// Durable delayed-wake record owned by the timer scheduler.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    /// Run to wake.
    pub run_id: String,
    /// When to wake it.
    pub due_at: DateTime<Utc>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}
