// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging gateway implementations.
//!
//! [`WebhookGateway`] forwards sends to an HTTP gateway service that fronts
//! the actual business-chat provider. [`LogGateway`] is the fallback when no
//! gateway URL is configured: it logs every send, which is enough for local
//! development against the API.

use chatflow_core::action::{GatewayError, MessagingGateway, OutboundPayload, Template};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Gateway that POSTs sends to an HTTP endpoint.
///
/// Wire contract:
/// - `POST {base}/conversations/{id}/messages` with a JSON body
/// - `GET {base}/templates/{id}` returning `{ "id": ..., "body": ... }`,
///   404 when the template doesn't exist
///
/// Failure classification: timeouts, connection errors, 429 and 5xx are
/// transient; any other non-success status is terminal.
pub struct WebhookGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct TemplateResponse {
    id: String,
    body: String,
}

impl WebhookGateway {
    /// Create a gateway client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::terminal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn classify(status: StatusCode) -> GatewayError {
        let message = format!("gateway returned {}", status);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            GatewayError::transient(message)
        } else {
            GatewayError::terminal(message)
        }
    }

    fn transport_error(err: reqwest::Error) -> GatewayError {
        // Network-level failures are worth retrying.
        GatewayError::transient(format!("gateway request failed: {}", err))
    }
}

#[async_trait::async_trait]
impl MessagingGateway for WebhookGateway {
    async fn send_message(
        &self,
        conversation_id: &str,
        payload: &OutboundPayload,
    ) -> Result<(), GatewayError> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.base_url, conversation_id
        );
        let response = self
            .client
            .post(&url)
            .json(&SendRequest {
                text: &payload.text,
                template_id: payload.template_id.as_deref(),
            })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if response.status().is_success() {
            debug!(conversation_id, "message delivered");
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }

    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, GatewayError> {
        let url = format!("{}/templates/{}", self.base_url, template_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let template: TemplateResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::terminal(format!("bad template payload: {}", e)))?;
                Ok(Some(Template {
                    id: template.id,
                    body: template.body,
                }))
            }
            status => Err(Self::classify(status)),
        }
    }
}

/// Log-only gateway used when no gateway URL is configured.
pub struct LogGateway;

#[async_trait::async_trait]
impl MessagingGateway for LogGateway {
    async fn send_message(
        &self,
        conversation_id: &str,
        payload: &OutboundPayload,
    ) -> Result<(), GatewayError> {
        info!(
            conversation_id,
            template_id = payload.template_id.as_deref(),
            text = %payload.text,
            "send (no gateway configured)"
        );
        Ok(())
    }

    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, GatewayError> {
        // Echo templates so flows remain testable without a gateway.
        Ok(Some(Template {
            id: template_id.to_string(),
            body: format!("[template {}]", template_id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::action::SendErrorClass;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            WebhookGateway::classify(StatusCode::TOO_MANY_REQUESTS).class,
            SendErrorClass::Transient
        );
        assert_eq!(
            WebhookGateway::classify(StatusCode::BAD_GATEWAY).class,
            SendErrorClass::Transient
        );
        assert_eq!(
            WebhookGateway::classify(StatusCode::BAD_REQUEST).class,
            SendErrorClass::Terminal
        );
        assert_eq!(
            WebhookGateway::classify(StatusCode::FORBIDDEN).class,
            SendErrorClass::Terminal
        );
    }

    #[tokio::test]
    async fn test_log_gateway_accepts_everything() {
        let gateway = LogGateway;
        gateway
            .send_message("conv-1", &OutboundPayload::text("hi"))
            .await
            .unwrap();
        let template = gateway.fetch_template("welcome").await.unwrap().unwrap();
        assert_eq!(template.id, "welcome");
    }
}
