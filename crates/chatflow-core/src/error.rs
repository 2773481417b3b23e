// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the automation engine.
//!
//! Provides a unified error type with a stable machine-readable code per
//! variant, used by the HTTP layer for status mapping.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while managing or executing automations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Automation was not found.
    AutomationNotFound {
        /// The automation ID that was not found.
        automation_id: String,
    },

    /// Run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// A run's step-graph snapshot is missing.
    SnapshotNotFound {
        /// The snapshot ID that was not found.
        snapshot_id: String,
    },

    /// A run points at a step that does not exist in its snapshot.
    StepNotFound {
        /// The snapshot the step was resolved against.
        snapshot_id: String,
        /// The missing step ID.
        step_id: String,
    },

    /// A non-terminal run already exists for this (automation, conversation) pair.
    RunAlreadyActive {
        /// The automation ID.
        automation_id: String,
        /// The conversation ID.
        conversation_id: String,
    },

    /// The flow graph failed validation; never reaches the engine.
    ValidationFailed {
        /// The automation being validated.
        automation_id: String,
        /// Rendered validation errors, one per offending step.
        errors: Vec<String>,
    },

    /// A send was rejected by the messaging gateway.
    SendFailed {
        /// The conversation the send targeted.
        conversation_id: String,
        /// Whether the failure was classified retryable before giving up.
        retryable: bool,
        /// Gateway-reported reason.
        reason: String,
    },

    /// Optimistic concurrency retries were exhausted for a run.
    ConcurrencyConflict {
        /// The contended run.
        run_id: String,
        /// Number of read-compute-write attempts made.
        attempts: u32,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AutomationNotFound { .. } => "AUTOMATION_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::RunAlreadyActive { .. } => "RUN_ALREADY_ACTIVE",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::SendFailed { .. } => "SEND_FAILED",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutomationNotFound { automation_id } => {
                write!(f, "Automation '{}' not found", automation_id)
            }
            Self::RunNotFound { run_id } => {
                write!(f, "Run '{}' not found", run_id)
            }
            Self::SnapshotNotFound { snapshot_id } => {
                write!(f, "Flow snapshot '{}' not found", snapshot_id)
            }
            Self::StepNotFound {
                snapshot_id,
                step_id,
            } => {
                write!(
                    f,
                    "Step '{}' not found in snapshot '{}'",
                    step_id, snapshot_id
                )
            }
            Self::RunAlreadyActive {
                automation_id,
                conversation_id,
            } => {
                write!(
                    f,
                    "Automation '{}' already has an active run on conversation '{}'",
                    automation_id, conversation_id
                )
            }
            Self::ValidationFailed {
                automation_id,
                errors,
            } => {
                write!(
                    f,
                    "Flow of automation '{}' failed validation: {}",
                    automation_id,
                    errors.join("; ")
                )
            }
            Self::SendFailed {
                conversation_id,
                retryable,
                reason,
            } => {
                write!(
                    f,
                    "Send to conversation '{}' failed ({}): {}",
                    conversation_id,
                    if *retryable { "retryable" } else { "terminal" },
                    reason
                )
            }
            Self::ConcurrencyConflict { run_id, attempts } => {
                write!(
                    f,
                    "Run '{}' still contended after {} advance attempts",
                    run_id, attempts
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
