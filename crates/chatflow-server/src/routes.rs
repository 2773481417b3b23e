// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API: automation CRUD, lifecycle, test execution, and event webhooks.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;

use chatflow_core::automations::AutomationService;
use chatflow_core::dispatcher::{ConversationStarted, MessageReceived, TriggerDispatcher};
use chatflow_core::error::EngineError;
use chatflow_core::harness::{TestHarness, TestReport};
use chatflow_core::model::{Automation, Step, StepConfig, Trigger};
use chatflow_core::store::Store;
use chatflow_core::validation::ValidationResult;

/// Shared state handed to every handler.
pub struct AppState {
    /// Automation lifecycle service.
    pub service: AutomationService,
    /// Event-to-run dispatcher.
    pub dispatcher: TriggerDispatcher,
    /// Draft test harness.
    pub harness: TestHarness,
    /// Store, for health checks.
    pub store: Arc<dyn Store>,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/automations", post(create_automation).get(list_automations))
        .route(
            "/automations/{id}",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
        .route("/automations/{id}/steps", get(get_steps))
        .route("/automations/{id}/toggle", post(toggle_automation))
        .route("/automations/{id}/test", post(test_automation))
        .route("/events/conversation-started", post(conversation_started))
        .route("/events/message-received", post(message_received))
        .with_state(state)
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// A step as it travels over the API: the typed config is flattened so the
/// JSON carries `type` next to `step_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    /// Step id, unique within the flow.
    pub step_id: String,
    /// Editor ordering; lowest is the entry step.
    pub position: i32,
    /// Typed configuration (`type` plus per-type fields).
    #[serde(flatten)]
    pub config: StepConfig,
    /// Default edge.
    #[serde(default)]
    pub next_step_id: Option<String>,
}

impl StepPayload {
    fn into_step(self) -> Step {
        Step {
            step_id: self.step_id,
            automation_id: String::new(),
            position: self.position,
            config: self.config,
            next_step_id: self.next_step_id,
        }
    }

    fn from_step(step: Step) -> Self {
        Self {
            step_id: step.step_id,
            position: step.position,
            config: step.config,
            next_step_id: step.next_step_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AutomationPayload {
    name: String,
    trigger: Trigger,
    #[serde(default)]
    channel_id: Option<String>,
    steps: Vec<StepPayload>,
}

#[derive(Debug, Serialize)]
struct AutomationResponse {
    #[serde(flatten)]
    automation: Automation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl AutomationResponse {
    fn new(automation: Automation, validation: Option<&ValidationResult>) -> Self {
        Self {
            automation,
            warnings: validation
                .map(|v| v.warnings.iter().map(|w| w.to_string()).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AutomationDetail {
    #[serde(flatten)]
    automation: Automation,
    steps: Vec<StepPayload>,
}

#[derive(Debug, Deserialize)]
struct TestRequest {
    conversation_id: String,
    contact_id: String,
}

#[derive(Debug, Serialize)]
struct SkippedEntry {
    id: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    dispatched: Vec<String>,
    skipped: Vec<SkippedEntry>,
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Engine error wrapped for HTTP status mapping.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::AutomationNotFound { .. }
            | EngineError::RunNotFound { .. }
            | EngineError::SnapshotNotFound { .. }
            | EngineError::StepNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::RunAlreadyActive { .. } | EngineError::ConcurrencyConflict { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::SendFailed { .. } | EngineError::DatabaseError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = match &self.0 {
            EngineError::ValidationFailed { errors, .. } => Some(errors.clone()),
            _ => None,
        };
        let body = json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
                "details": details,
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    state.store.health_check_db().await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<(StatusCode, Json<AutomationResponse>)> {
    let steps = payload.steps.into_iter().map(StepPayload::into_step).collect();
    let (automation, validation) = state
        .service
        .create(&payload.name, payload.trigger, payload.channel_id, steps)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AutomationResponse::new(automation, Some(&validation))),
    ))
}

async fn list_automations(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Automation>>> {
    Ok(Json(state.service.list().await?))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AutomationDetail>> {
    let automation = state.service.get(&id).await?;
    let steps = state.service.steps(&id).await?;
    Ok(Json(AutomationDetail {
        automation,
        steps: steps.into_iter().map(StepPayload::from_step).collect(),
    }))
}

async fn get_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StepPayload>>> {
    let steps = state.service.steps(&id).await?;
    Ok(Json(steps.into_iter().map(StepPayload::from_step).collect()))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<Json<AutomationResponse>> {
    let steps = payload.steps.into_iter().map(StepPayload::into_step).collect();
    let (automation, validation) = state
        .service
        .update(&id, &payload.name, payload.trigger, payload.channel_id, steps)
        .await?;
    Ok(Json(AutomationResponse::new(automation, Some(&validation))))
}

async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AutomationResponse>> {
    let (automation, validation) = state.service.toggle(&id).await?;
    Ok(Json(AutomationResponse::new(
        automation,
        validation.as_ref(),
    )))
}

async fn test_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TestRequest>,
) -> ApiResult<Json<TestReport>> {
    let report = state
        .harness
        .run_automation(&id, &request.conversation_id, &request.contact_id)
        .await?;
    Ok(Json(report))
}

async fn conversation_started(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ConversationStarted>,
) -> ApiResult<Json<EventResponse>> {
    let report = state.dispatcher.on_conversation_started(&event).await?;
    Ok(Json(EventResponse {
        dispatched: report.dispatched,
        skipped: report
            .skipped
            .into_iter()
            .map(|(id, reason)| SkippedEntry { id, reason })
            .collect(),
    }))
}

async fn message_received(
    State(state): State<Arc<AppState>>,
    Json(event): Json<MessageReceived>,
) -> ApiResult<Json<EventResponse>> {
    let report = state.dispatcher.on_message_received(&event).await?;
    Ok(Json(EventResponse {
        dispatched: report.dispatched,
        skipped: report
            .skipped
            .into_iter()
            .map(|(id, reason)| SkippedEntry { id, reason })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases: Vec<(EngineError, StatusCode)> = vec![
            (
                EngineError::AutomationNotFound {
                    automation_id: "a".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                EngineError::ValidationFailed {
                    automation_id: "a".into(),
                    errors: vec!["bad".into()],
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EngineError::RunAlreadyActive {
                    automation_id: "a".into(),
                    conversation_id: "c".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::ConcurrencyConflict {
                    run_id: "r".into(),
                    attempts: 5,
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::DatabaseError {
                    operation: "query".into(),
                    details: "oops".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_step_payload_round_trip() {
        let json = serde_json::json!({
            "step_id": "ask",
            "position": 1,
            "type": "user_reply",
            "question": "Name?",
            "save_as": "name",
            "next_step_id": "bye"
        });
        let payload: StepPayload = serde_json::from_value(json.clone()).unwrap();
        assert!(matches!(payload.config, StepConfig::UserReply { .. }));

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back, json);
    }
}
