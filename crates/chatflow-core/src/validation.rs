// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow-graph validation.
//!
//! Validates a flow before it can be activated (or test-run):
//! - Graph structure is valid: an entry step exists, following `next_step_id`
//!   (and keyword override edges) always terminates, no dangling references
//! - Per-type step configuration is well-formed
//!
//! Validation runs at author time; a flow that fails validation never
//! reaches the execution engine.

use std::collections::{HashMap, HashSet};

use crate::model::{Step, StepConfig, entry_step};

// ============================================================================
// Validation Result Types
// ============================================================================

/// Result of flow validation containing errors and warnings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Hard errors that prevent activation.
    pub errors: Vec<ValidationError>,
    /// Soft warnings that don't prevent activation.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true if there are any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Rendered error messages, one per error.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// Errors that can occur during flow validation.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum ValidationError {
    /// Flow has no steps defined.
    EmptyFlow,
    /// A step's `next_step_id` points at a step outside the flow.
    DanglingNextStep { step_id: String, next_step_id: String },
    /// A keyword override edge points at a step outside the flow.
    DanglingOverride {
        step_id: String,
        keyword: String,
        target_step_id: String,
    },
    /// A keyword override names a keyword not in the step's keyword list.
    UnknownOverrideKeyword { step_id: String, keyword: String },
    /// Following edges from the entry step revisits a step.
    CycleDetected { step_id: String },
    /// A `time_gap` step has a negative delay.
    NegativeDelay { step_id: String, delay_seconds: i64 },
    /// A `user_reply` step has an empty question or `save_as` name.
    IncompleteUserReply { step_id: String },
    /// A `custom_reply` step has an empty message.
    EmptyMessage { step_id: String },
    /// A `send_template` step has an empty template reference.
    EmptyTemplateId { step_id: String },
    /// A `keyword_catch` step has no keywords, or a blank keyword.
    BadKeywords { step_id: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyFlow => {
                write!(f, "[E001] Flow has no steps defined")
            }
            ValidationError::DanglingNextStep {
                step_id,
                next_step_id,
            } => {
                write!(
                    f,
                    "[E002] Step '{}' links to '{}' which does not exist in this flow",
                    step_id, next_step_id
                )
            }
            ValidationError::DanglingOverride {
                step_id,
                keyword,
                target_step_id,
            } => {
                write!(
                    f,
                    "[E003] Step '{}' routes keyword '{}' to '{}' which does not exist in this flow",
                    step_id, keyword, target_step_id
                )
            }
            ValidationError::UnknownOverrideKeyword { step_id, keyword } => {
                write!(
                    f,
                    "[E004] Step '{}' has an override for '{}' which is not in its keyword list",
                    step_id, keyword
                )
            }
            ValidationError::CycleDetected { step_id } => {
                write!(
                    f,
                    "[E005] Step '{}' is part of a cycle; flows must terminate",
                    step_id
                )
            }
            ValidationError::NegativeDelay {
                step_id,
                delay_seconds,
            } => {
                write!(
                    f,
                    "[E010] Step '{}' has negative delay {}s; delays must be >= 0",
                    step_id, delay_seconds
                )
            }
            ValidationError::IncompleteUserReply { step_id } => {
                write!(
                    f,
                    "[E011] Step '{}' needs a non-empty question and save_as name",
                    step_id
                )
            }
            ValidationError::EmptyMessage { step_id } => {
                write!(f, "[E012] Step '{}' has an empty message", step_id)
            }
            ValidationError::EmptyTemplateId { step_id } => {
                write!(f, "[E013] Step '{}' has an empty template reference", step_id)
            }
            ValidationError::BadKeywords { step_id } => {
                write!(
                    f,
                    "[E014] Step '{}' needs at least one non-blank keyword",
                    step_id
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Warnings that indicate potential issues but don't prevent activation.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum ValidationWarning {
    /// A step is not reachable from the entry step and will never run.
    UnreachableStep { step_id: String },
    /// A very long `time_gap` delay, likely an authoring mistake.
    LongDelay {
        step_id: String,
        delay_seconds: i64,
        recommended_max: i64,
    },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::UnreachableStep { step_id } => {
                write!(
                    f,
                    "[W001] Step '{}' is unreachable from the entry step",
                    step_id
                )
            }
            ValidationWarning::LongDelay {
                step_id,
                delay_seconds,
                recommended_max,
            } => {
                write!(
                    f,
                    "[W002] Step '{}' waits {}s; consider {}s or less",
                    step_id, delay_seconds, recommended_max
                )
            }
        }
    }
}

// ============================================================================
// Main Validation Function
// ============================================================================

/// Delays beyond 30 days are almost always an authoring mistake.
const MAX_DELAY_RECOMMENDED: i64 = 30 * 24 * 3600;

/// Validate a flow's step graph and per-step configuration.
///
/// Activation should fail if the result has any errors.
pub fn validate_flow(steps: &[Step]) -> ValidationResult {
    let mut result = ValidationResult::default();

    if steps.is_empty() {
        result.errors.push(ValidationError::EmptyFlow);
        return result;
    }

    validate_graph(steps, &mut result);
    for step in steps {
        validate_step_config(step, &mut result);
    }

    result
}

// ============================================================================
// Graph Structure
// ============================================================================

fn validate_graph(steps: &[Step], result: &mut ValidationResult) {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

    // Edge targets must exist within the flow.
    for step in steps {
        if let Some(next) = &step.next_step_id
            && !by_id.contains_key(next.as_str())
        {
            result.errors.push(ValidationError::DanglingNextStep {
                step_id: step.step_id.clone(),
                next_step_id: next.clone(),
            });
        }

        if let StepConfig::KeywordCatch {
            keywords,
            overrides,
            ..
        } = &step.config
        {
            let known: HashSet<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
            for (keyword, target) in overrides {
                if !known.contains(&keyword.to_lowercase()) {
                    result.errors.push(ValidationError::UnknownOverrideKeyword {
                        step_id: step.step_id.clone(),
                        keyword: keyword.clone(),
                    });
                }
                if !by_id.contains_key(target.as_str()) {
                    result.errors.push(ValidationError::DanglingOverride {
                        step_id: step.step_id.clone(),
                        keyword: keyword.clone(),
                        target_step_id: target.clone(),
                    });
                }
            }
        }
    }

    // Don't attempt the walk over a broken edge set.
    if result.has_errors() {
        return;
    }

    let Some(entry) = entry_step(steps) else {
        return;
    };

    // Walk every edge from the entry step; a revisit on the current path is
    // a cycle. The graph fans out only at keyword overrides, so a DFS with
    // an explicit path set stays tiny.
    let reachable = walk_for_cycles(entry.step_id.as_str(), &by_id, result);

    for step in steps {
        if !reachable.contains(step.step_id.as_str()) {
            result.warnings.push(ValidationWarning::UnreachableStep {
                step_id: step.step_id.clone(),
            });
        }
    }
}

fn walk_for_cycles<'a>(
    entry: &'a str,
    by_id: &HashMap<&'a str, &'a Step>,
    result: &mut ValidationResult,
) -> HashSet<&'a str> {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();

    fn dfs<'a>(
        step_id: &'a str,
        by_id: &HashMap<&'a str, &'a Step>,
        path: &mut HashSet<&'a str>,
        reachable: &mut HashSet<&'a str>,
        reported: &mut HashSet<&'a str>,
        result: &mut ValidationResult,
    ) {
        if path.contains(step_id) {
            if reported.insert(step_id) {
                result.errors.push(ValidationError::CycleDetected {
                    step_id: step_id.to_string(),
                });
            }
            return;
        }
        let Some(step) = by_id.get(step_id) else {
            return;
        };
        reachable.insert(step_id);
        path.insert(step_id);

        if let Some(next) = &step.next_step_id {
            dfs(next.as_str(), by_id, path, reachable, reported, result);
        }
        if let StepConfig::KeywordCatch { overrides, .. } = &step.config {
            for target in overrides.values() {
                dfs(target.as_str(), by_id, path, reachable, reported, result);
            }
        }

        path.remove(step_id);
    }

    let mut path = HashSet::new();
    dfs(
        entry,
        by_id,
        &mut path,
        &mut reachable,
        &mut reported,
        result,
    );
    reachable
}

// ============================================================================
// Per-type Configuration
// ============================================================================

fn validate_step_config(step: &Step, result: &mut ValidationResult) {
    match &step.config {
        StepConfig::UserReply { question, save_as } => {
            if question.trim().is_empty() || save_as.trim().is_empty() {
                result.errors.push(ValidationError::IncompleteUserReply {
                    step_id: step.step_id.clone(),
                });
            }
        }
        StepConfig::TimeGap { delay_seconds } => {
            if *delay_seconds < 0 {
                result.errors.push(ValidationError::NegativeDelay {
                    step_id: step.step_id.clone(),
                    delay_seconds: *delay_seconds,
                });
            } else if *delay_seconds > MAX_DELAY_RECOMMENDED {
                result.warnings.push(ValidationWarning::LongDelay {
                    step_id: step.step_id.clone(),
                    delay_seconds: *delay_seconds,
                    recommended_max: MAX_DELAY_RECOMMENDED,
                });
            }
        }
        StepConfig::SendTemplate { template_id, .. } => {
            if template_id.trim().is_empty() {
                result.errors.push(ValidationError::EmptyTemplateId {
                    step_id: step.step_id.clone(),
                });
            }
        }
        StepConfig::CustomReply { message } => {
            if message.trim().is_empty() {
                result.errors.push(ValidationError::EmptyMessage {
                    step_id: step.step_id.clone(),
                });
            }
        }
        StepConfig::KeywordCatch { keywords, .. } => {
            if keywords.is_empty() || keywords.iter().any(|k| k.trim().is_empty()) {
                result.errors.push(ValidationError::BadKeywords {
                    step_id: step.step_id.clone(),
                });
            }
        }
    }
}
