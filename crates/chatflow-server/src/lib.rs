// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chatflow Server - HTTP API for the automation engine
//!
//! Hosts the automation CRUD/lifecycle API, the event webhooks that drive
//! runs, and the background timer scheduler, over a single SQLite database.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/automations` | Create an automation with its steps |
//! | `GET` | `/automations` | List automations |
//! | `GET` | `/automations/{id}` | Fetch an automation and its steps |
//! | `PUT` | `/automations/{id}` | Update definition and steps |
//! | `GET` | `/automations/{id}/steps` | Fetch just the steps, ordered |
//! | `DELETE` | `/automations/{id}` | Delete (cancels in-flight runs) |
//! | `POST` | `/automations/{id}/toggle` | Flip between active and paused |
//! | `POST` | `/automations/{id}/test` | Test-run the current draft |
//! | `POST` | `/events/conversation-started` | Conversation-opened webhook |
//! | `POST` | `/events/message-received` | Inbound-message webhook |
//! | `GET` | `/health` | Liveness and database connectivity |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CHATFLOW_DATABASE_PATH` | Yes | - | SQLite database file path |
//! | `CHATFLOW_HTTP_PORT` | No | `8080` | HTTP listen port |
//! | `CHATFLOW_GATEWAY_URL` | No | - | Messaging gateway base URL (log-only sends when unset) |
//! | `CHATFLOW_TIMER_POLL_SECS` | No | `5` | Timer scheduler poll interval |
//! | `CHATFLOW_TIMER_BATCH_SIZE` | No | `32` | Timers claimed per sweep |
//! | `CHATFLOW_TIMER_GRACE_SECS` | No | `60` | Timer reconciliation grace window |

#![deny(missing_docs)]

/// Server configuration from environment variables.
pub mod config;

/// Messaging gateway implementations (HTTP webhook, log-only fallback).
pub mod gateway;

/// HTTP routes, handlers, and error mapping.
pub mod routes;
