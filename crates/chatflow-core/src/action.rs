// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound send actions: the messaging gateway seam, retry policy, and
//! `{{variable}}` interpolation.
//!
//! The engine never talks to a messaging provider directly. Every send goes
//! through [`MessagingGateway`], and the [`ActionExecutor`] wraps it with
//! retry handling: transient failures are retried with capped exponential
//! backoff, terminal failures surface immediately and fail the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

// ============================================================================
// Gateway Seam
// ============================================================================

/// Message content handed to the gateway for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    /// Rendered message text.
    pub text: String,
    /// Template the text was rendered from, when applicable.
    pub template_id: Option<String>,
}

impl OutboundPayload {
    /// Plain text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            template_id: None,
        }
    }
}

/// A message template resolved through the gateway.
#[derive(Debug, Clone)]
pub struct Template {
    /// Template identifier.
    pub id: String,
    /// Template body with `{{slot}}` placeholders.
    pub body: String,
}

/// Failure classification reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClass {
    /// Worth retrying (rate limit, timeout, 5xx).
    Transient,
    /// Retrying cannot help (invalid recipient, unapproved template, 4xx).
    Terminal,
}

/// Error returned by a messaging gateway operation.
#[derive(Debug, Clone)]
pub struct GatewayError {
    /// Whether retrying can help.
    pub class: SendErrorClass,
    /// Provider-reported reason.
    pub message: String,
}

impl GatewayError {
    /// A retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: SendErrorClass::Transient,
            message: message.into(),
        }
    }

    /// A non-retryable failure.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: SendErrorClass::Terminal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Outbound messaging seam.
///
/// Implementations deliver messages to the business-chat provider and
/// resolve message templates. All engine sends go through this trait, so
/// tests can substitute a recording double.
#[async_trait::async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Deliver a message to a conversation.
    async fn send_message(
        &self,
        conversation_id: &str,
        payload: &OutboundPayload,
    ) -> std::result::Result<(), GatewayError>;

    /// Resolve a template by id. `Ok(None)` means the template does not
    /// exist, which is a terminal condition for the step using it.
    async fn fetch_template(
        &self,
        template_id: &str,
    ) -> std::result::Result<Option<Template>, GatewayError>;
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff settings for transient send failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based), capped exponential.
    fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ============================================================================
// Action Executor
// ============================================================================

/// Executes send actions against the gateway with retry handling.
#[derive(Clone)]
pub struct ActionExecutor {
    gateway: Arc<dyn MessagingGateway>,
    retry: RetryPolicy,
}

impl ActionExecutor {
    /// Create an executor with the default retry policy.
    pub fn new(gateway: Arc<dyn MessagingGateway>) -> Self {
        Self {
            gateway,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send literal text after `{{variable}}` interpolation.
    pub async fn send_text(
        &self,
        conversation_id: &str,
        message: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let payload = OutboundPayload::text(render(message, variables));
        self.send_with_retry(conversation_id, &payload).await
    }

    /// Resolve a template, fill its slots, and send it.
    ///
    /// Slot values come from the run's captured variables merged with the
    /// step's own `variables` map; step values win and may themselves
    /// reference `{{vars}}`. A missing template is terminal.
    pub async fn send_template(
        &self,
        conversation_id: &str,
        template_id: &str,
        step_variables: &BTreeMap<String, String>,
        run_variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let template = self
            .fetch_template(conversation_id, template_id)
            .await?
            .ok_or_else(|| EngineError::SendFailed {
                conversation_id: conversation_id.to_string(),
                retryable: false,
                reason: format!("template '{}' not found", template_id),
            })?;

        let mut slots = run_variables.clone();
        for (key, value) in step_variables {
            slots.insert(key.clone(), render(value, run_variables));
        }

        let payload = OutboundPayload {
            text: render(&template.body, &slots),
            template_id: Some(template.id),
        };
        self.send_with_retry(conversation_id, &payload).await
    }

    async fn fetch_template(
        &self,
        conversation_id: &str,
        template_id: &str,
    ) -> Result<Option<Template>> {
        let mut attempt = 0;
        loop {
            match self.gateway.fetch_template(template_id).await {
                Ok(template) => return Ok(template),
                Err(err) => {
                    attempt += 1;
                    if err.class == SendErrorClass::Terminal || attempt >= self.retry.max_attempts {
                        return Err(EngineError::SendFailed {
                            conversation_id: conversation_id.to_string(),
                            retryable: err.class == SendErrorClass::Transient,
                            reason: err.message,
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(template_id, attempt, ?delay, "retrying template fetch");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_with_retry(
        &self,
        conversation_id: &str,
        payload: &OutboundPayload,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.gateway.send_message(conversation_id, payload).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if err.class == SendErrorClass::Terminal {
                        warn!(conversation_id, reason = %err.message, "send rejected");
                        return Err(EngineError::SendFailed {
                            conversation_id: conversation_id.to_string(),
                            retryable: false,
                            reason: err.message,
                        });
                    }
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            conversation_id,
                            attempts = attempt,
                            reason = %err.message,
                            "send retries exhausted"
                        );
                        return Err(EngineError::SendFailed {
                            conversation_id: conversation_id.to_string(),
                            retryable: true,
                            reason: err.message,
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(conversation_id, attempt, ?delay, "retrying send");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ============================================================================
// Interpolation
// ============================================================================

/// Substitute `{{name}}` placeholders from the variable map.
///
/// Inner whitespace is tolerated (`{{ name }}`); unknown names render as an
/// empty string. Unterminated braces pass through literally.
pub fn render(text: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = variables.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
