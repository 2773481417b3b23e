// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixtures: an in-memory store, a recording gateway, and
//! step builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatflow_core::action::{
    ActionExecutor, GatewayError, MessagingGateway, OutboundPayload, RetryPolicy, SendErrorClass,
    Template,
};
use chatflow_core::automations::AutomationService;
use chatflow_core::dispatcher::TriggerDispatcher;
use chatflow_core::engine::Engine;
use chatflow_core::harness::TestHarness;
use chatflow_core::model::{KeywordAction, Step, StepConfig};
use chatflow_core::scheduler::{TimerScheduler, TimerSchedulerConfig};
use chatflow_core::store::{SqliteStore, Store};

/// Recording gateway double with configurable failure injection.
pub struct MockGateway {
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    templates: Mutex<HashMap<String, String>>,
    fail: Mutex<Option<(SendErrorClass, u32)>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            templates: Mutex::new(HashMap::new()),
            fail: Mutex::new(None),
        })
    }

    /// Register a template body under an id.
    pub fn add_template(&self, id: &str, body: &str) {
        self.templates
            .lock()
            .unwrap()
            .insert(id.to_string(), body.to_string());
    }

    /// Fail the next `count` sends with the given class.
    pub fn fail_next(&self, class: SendErrorClass, count: u32) {
        *self.fail.lock().unwrap() = Some((class, count));
    }

    /// Everything sent so far, as (conversation_id, payload) pairs.
    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().unwrap().clone()
    }

    /// Just the message texts, in send order.
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.text.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl MessagingGateway for MockGateway {
    async fn send_message(
        &self,
        conversation_id: &str,
        payload: &OutboundPayload,
    ) -> Result<(), GatewayError> {
        let mut fail = self.fail.lock().unwrap();
        if let Some((class, remaining)) = fail.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError {
                    class: *class,
                    message: "injected failure".to_string(),
                });
            }
            *fail = None;
        }
        drop(fail);

        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, GatewayError> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .get(template_id)
            .map(|body| Template {
                id: template_id.to_string(),
                body: body.clone(),
            }))
    }
}

/// Everything a test needs, wired over one in-memory database.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<MockGateway>,
    pub engine: Engine,
    pub service: AutomationService,
    pub dispatcher: TriggerDispatcher,
    pub harness: TestHarness,
}

impl TestContext {
    pub fn store_dyn(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// A scheduler sharing this context's store and engine.
    pub fn scheduler(&self, config: TimerSchedulerConfig) -> TimerScheduler {
        TimerScheduler::new(self.store.clone(), self.engine.clone(), config)
    }
}

pub async fn setup() -> TestContext {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let gateway = MockGateway::new();
    let actions = ActionExecutor::new(gateway.clone()).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    });
    let engine = Engine::new(store.clone(), actions);
    TestContext {
        service: AutomationService::new(store.clone()),
        dispatcher: TriggerDispatcher::new(store.clone(), engine.clone()),
        harness: TestHarness::new(store.clone(), engine.clone()),
        store,
        gateway,
        engine,
    }
}

// ----------------------------------------------------------------------
// Step builders
// ----------------------------------------------------------------------

fn step(id: &str, position: i32, config: StepConfig, next: Option<&str>) -> Step {
    Step {
        step_id: id.to_string(),
        automation_id: String::new(),
        position,
        config,
        next_step_id: next.map(str::to_string),
    }
}

pub fn custom_reply(id: &str, position: i32, message: &str, next: Option<&str>) -> Step {
    step(
        id,
        position,
        StepConfig::CustomReply {
            message: message.to_string(),
        },
        next,
    )
}

pub fn user_reply(id: &str, position: i32, question: &str, save_as: &str, next: Option<&str>) -> Step {
    step(
        id,
        position,
        StepConfig::UserReply {
            question: question.to_string(),
            save_as: save_as.to_string(),
        },
        next,
    )
}

pub fn time_gap(id: &str, position: i32, delay_seconds: i64, next: Option<&str>) -> Step {
    step(id, position, StepConfig::TimeGap { delay_seconds }, next)
}

pub fn send_template(
    id: &str,
    position: i32,
    template_id: &str,
    variables: &[(&str, &str)],
    next: Option<&str>,
) -> Step {
    step(
        id,
        position,
        StepConfig::SendTemplate {
            template_id: template_id.to_string(),
            variables: variables
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
        next,
    )
}

pub fn keyword_catch(
    id: &str,
    position: i32,
    keywords: &[&str],
    action: KeywordAction,
    overrides: &[(&str, &str)],
    next: Option<&str>,
) -> Step {
    step(
        id,
        position,
        StepConfig::KeywordCatch {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            action,
            overrides: overrides
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        },
        next,
    )
}
