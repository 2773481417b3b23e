// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chatflow Core - Automation Execution Engine
//!
//! This crate executes chat automations: multi-step flows that run against
//! business-chat conversations, surviving process restarts between steps.
//! All state is persisted to SQLite, so a run suspended on a question or a
//! delay picks up exactly where it left off.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    chatflow-server                           │
//! │        (HTTP API: automations CRUD, event webhooks)          │
//! └─────────────────────────────────────────────────────────────┘
//!            │                  │                   │
//!            ▼                  ▼                   ▼
//! ┌──────────────────┐ ┌─────────────────┐ ┌──────────────────┐
//! │ AutomationService│ │TriggerDispatcher│ │  TimerScheduler   │
//! │ (lifecycle,      │ │ (event → run    │ │ (durable wakes,   │
//! │  snapshots)      │ │  routing)       │ │  reconciliation)  │
//! └──────────────────┘ └─────────────────┘ └──────────────────┘
//!            │                  │                   │
//!            │                  ▼                   │
//!            │          ┌─────────────────┐         │
//!            └─────────►│     Engine      │◄────────┘
//!                       │ (advance runs,  │
//!                       │  send actions)  │
//!                       └─────────────────┘
//!                          │           │
//!                          ▼           ▼
//!                 ┌──────────────┐ ┌──────────────────┐
//!                 │    SQLite    │ │ MessagingGateway │
//!                 │ (runs, steps,│ │ (provider seam)  │
//!                 │  timers)     │ │                  │
//!                 └──────────────┘ └──────────────────┘
//! ```
//!
//! # Step Types
//!
//! | Type | Behavior |
//! |------|----------|
//! | `user_reply` | Send a question, suspend until the next inbound message, capture it as a variable |
//! | `time_gap` | Suspend for a duration via a durable timer |
//! | `send_template` | Resolve a template, fill `{{slots}}`, send, continue |
//! | `custom_reply` | Send literal (interpolated) text, continue |
//! | `keyword_catch` | Suspend until an inbound message matches a keyword, then branch or stop |
//!
//! # Run State Machine
//!
//! ```text
//!                  ┌─────────┐
//!        ┌─────────│ RUNNING │────────────┐
//!        │         └────┬────┘            │
//!        │              │                 │
//!   end of flow    terminal send    automation paused
//!   or stop gate      failure         or deleted
//!        │              │                 │
//!        ▼              ▼                 ▼
//!  ┌───────────┐   ┌────────┐      ┌───────────┐
//!  │ COMPLETED │   │ FAILED │      │ CANCELLED │
//!  └───────────┘   └────────┘      └───────────┘
//! ```
//!
//! A running run may be suspended (`waiting_for` set) on a message or a
//! timer; suspension is not a separate state. Terminal runs ignore every
//! event, which makes duplicate webhook and timer deliveries harmless.
//!
//! # Concurrency Model
//!
//! Every advance is a read-compute-write cycle guarded by a version column.
//! Two deliveries racing on the same run (an inbound message and a timer,
//! say) serialize: one write wins, the loser retries against fresh state
//! and usually turns into a no-op.
//!
//! # Modules
//!
//! - [`model`]: Automations, steps, flow snapshots, runs, timers
//! - [`validation`]: Flow-graph validation run before activation
//! - [`store`]: Storage abstraction and the SQLite backend
//! - [`engine`]: The run execution engine
//! - [`action`]: Messaging gateway seam, retries, interpolation
//! - [`dispatcher`]: Routes conversation events to automations and runs
//! - [`scheduler`]: Durable timer polling and reconciliation
//! - [`automations`]: Automation lifecycle (create, activate, delete)
//! - [`harness`]: Test-execute draft flows without activating them
//! - [`error`]: Error types with stable machine-readable codes

#![deny(missing_docs)]

/// Outbound send actions, retry policy, and `{{variable}}` interpolation.
pub mod action;

/// Automation lifecycle management.
pub mod automations;

/// Trigger dispatch from conversation events to runs.
pub mod dispatcher;

/// The run execution engine.
pub mod engine;

/// Error types with stable machine-readable codes.
pub mod error;

/// Test harness for draft flows.
pub mod harness;

/// Core data model.
pub mod model;

/// Durable timer scheduler.
pub mod scheduler;

/// Storage abstraction and backends.
pub mod store;

/// Flow-graph validation.
pub mod validation;
