// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end flow execution tests against the in-memory store.

mod common;

use chatflow_core::action::SendErrorClass;
use chatflow_core::dispatcher::{ConversationStarted, MessageReceived};
use chatflow_core::error::EngineError;
use chatflow_core::model::{KeywordAction, RunEvent, RunOutcome, Step, Trigger, WaitKind};
use chatflow_core::store::Store;
use chrono::Utc;
use common::*;

/// Welcome flow used across tests:
/// greet -> ask name -> wait 60s -> send order template -> stop gate
fn welcome_flow() -> Vec<Step> {
    vec![
        custom_reply("greet", 1, "Welcome to the shop!", Some("ask")),
        user_reply("ask", 2, "What's your name?", "name", Some("wait")),
        time_gap("wait", 3, 60, Some("offer")),
        send_template(
            "offer",
            4,
            "discount",
            &[("customer", "{{name}}")],
            Some("gate"),
        ),
        keyword_catch("gate", 5, &["stop", "unsubscribe"], KeywordAction::Stop, &[], None),
    ]
}

async fn activated(ctx: &TestContext, steps: Vec<Step>) -> String {
    let (automation, _) = ctx
        .service
        .create("welcome", Trigger::NewConversation, None, steps)
        .await
        .unwrap();
    ctx.service.activate(&automation.automation_id).await.unwrap();
    automation.automation_id
}

async fn started(ctx: &TestContext, automation_id: &str) -> String {
    let report = ctx
        .dispatcher
        .on_conversation_started(&ConversationStarted {
            conversation_id: "conv-1".to_string(),
            contact_id: "contact-1".to_string(),
            channel_id: "whatsapp".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(report.dispatched.len(), 1, "skipped: {:?}", report.skipped);
    let run = ctx
        .store
        .find_active_run(automation_id, "conv-1")
        .await
        .unwrap()
        .unwrap();
    run.run_id
}

fn message(text: &str) -> MessageReceived {
    MessageReceived {
        conversation_id: "conv-1".to_string(),
        text: text.to_string(),
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_full_flow_to_completion() {
    let ctx = setup().await;
    ctx.gateway
        .add_template("discount", "Hi {{customer}}, here's 10% off!");
    let automation_id = activated(&ctx, welcome_flow()).await;
    let run_id = started(&ctx, &automation_id).await;

    // Started: greeting sent, question sent, suspended on the answer.
    assert_eq!(
        ctx.gateway.texts(),
        vec!["Welcome to the shop!", "What's your name?"]
    );
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.waiting_for, Some(WaitKind::UserReply));
    assert_eq!(run.current_step_id.as_deref(), Some("ask"));

    // Answer captured, run suspends on the durable delay.
    ctx.dispatcher.on_message_received(&message("Ada")).await.unwrap();
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.variables.get("name").map(String::as_str), Some("Ada"));
    assert_eq!(run.waiting_for, Some(WaitKind::TimeGap));
    assert!(run.wake_at.is_some());

    // Timer fires: template sent with the captured variable, gate armed.
    let outcome = ctx
        .engine
        .handle_event(&run_id, RunEvent::TimerFired)
        .await
        .unwrap();
    assert!(outcome.applied);
    assert_eq!(
        ctx.gateway.texts().last().map(String::as_str),
        Some("Hi Ada, here's 10% off!")
    );
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.waiting_for, Some(WaitKind::KeywordCatch));

    // Stop keyword terminates the run as completed.
    ctx.dispatcher
        .on_message_received(&message("please STOP these"))
        .await
        .unwrap();
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.outcome, RunOutcome::Completed);

    // Completion counted on the automation.
    let automation = ctx.service.get(&automation_id).await.unwrap();
    assert_eq!(automation.execution_count, 1);
    assert!(automation.last_executed_at.is_some());
}

#[tokio::test]
async fn test_unmatched_keyword_keeps_waiting() {
    let ctx = setup().await;
    let steps = vec![keyword_catch(
        "gate",
        1,
        &["yes"],
        KeywordAction::Continue,
        &[],
        None,
    )];
    let automation_id = activated(&ctx, steps).await;
    let run_id = started(&ctx, &automation_id).await;

    let report = ctx
        .dispatcher
        .on_message_received(&message("maybe later"))
        .await
        .unwrap();
    assert!(report.dispatched.is_empty());

    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.outcome, RunOutcome::Running);
    assert_eq!(run.waiting_for, Some(WaitKind::KeywordCatch));

    // A match (case-insensitive, substring) releases the gate; with no
    // next step the run completes.
    ctx.dispatcher
        .on_message_received(&message("YES please"))
        .await
        .unwrap();
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_keyword_override_branches() {
    let ctx = setup().await;
    let steps = vec![
        keyword_catch(
            "gate",
            1,
            &["human", "faq"],
            KeywordAction::Continue,
            &[("human", "handoff")],
            Some("answer"),
        ),
        custom_reply("answer", 2, "See our FAQ", None),
        custom_reply("handoff", 3, "Connecting you to a person", None),
    ];
    let automation_id = activated(&ctx, steps).await;
    started(&ctx, &automation_id).await;

    ctx.dispatcher
        .on_message_received(&message("I want a HUMAN"))
        .await
        .unwrap();
    assert_eq!(ctx.gateway.texts(), vec!["Connecting you to a person"]);
}

#[tokio::test]
async fn test_duplicate_timer_is_noop() {
    let ctx = setup().await;
    let steps = vec![
        time_gap("wait", 1, 30, Some("bye")),
        custom_reply("bye", 2, "Done waiting", None),
    ];
    let automation_id = activated(&ctx, steps).await;
    let run_id = started(&ctx, &automation_id).await;

    let first = ctx
        .engine
        .handle_event(&run_id, RunEvent::TimerFired)
        .await
        .unwrap();
    assert!(first.applied);
    assert_eq!(first.run.outcome, RunOutcome::Completed);

    let second = ctx
        .engine
        .handle_event(&run_id, RunEvent::TimerFired)
        .await
        .unwrap();
    assert!(!second.applied);
    assert_eq!(ctx.gateway.texts(), vec!["Done waiting"]);
}

#[tokio::test]
async fn test_message_while_waiting_on_timer_is_noop() {
    let ctx = setup().await;
    let steps = vec![
        time_gap("wait", 1, 300, Some("bye")),
        custom_reply("bye", 2, "Done", None),
    ];
    let automation_id = activated(&ctx, steps).await;
    let run_id = started(&ctx, &automation_id).await;

    let report = ctx
        .dispatcher
        .on_message_received(&message("hello?"))
        .await
        .unwrap();
    assert!(report.dispatched.is_empty());

    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.waiting_for, Some(WaitKind::TimeGap));
}

#[tokio::test]
async fn test_terminal_send_failure_fails_run() {
    let ctx = setup().await;
    let steps = vec![
        custom_reply("greet", 1, "Hello", Some("bye")),
        custom_reply("bye", 2, "Goodbye", None),
    ];
    let automation_id = activated(&ctx, steps).await;

    ctx.gateway.fail_next(SendErrorClass::Terminal, 1);
    let report = ctx
        .dispatcher
        .on_conversation_started(&ConversationStarted {
            conversation_id: "conv-1".to_string(),
            contact_id: "contact-1".to_string(),
            channel_id: "whatsapp".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(report.dispatched.len(), 1);

    let run = ctx
        .store
        .get_run(&report.dispatched[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.outcome, RunOutcome::Failed);
    assert!(run.last_error.as_deref().unwrap().contains("greet"));

    // Terminal runs are invisible to the active-run lookup.
    let active = ctx
        .store
        .find_active_run(&automation_id, "conv-1")
        .await
        .unwrap();
    assert!(active.is_none());

    // Nothing was delivered and the failure didn't count as an execution.
    assert!(ctx.gateway.texts().is_empty());
    let automation = ctx.service.get(&automation_id).await.unwrap();
    assert_eq!(automation.execution_count, 0);
}

#[tokio::test]
async fn test_transient_send_failure_recovers() {
    let ctx = setup().await;
    let steps = vec![custom_reply("greet", 1, "Hello", None)];
    let automation_id = activated(&ctx, steps).await;

    // One transient failure, retry succeeds within the policy. The
    // single-step flow completes in the same advance.
    ctx.gateway.fail_next(SendErrorClass::Transient, 1);
    let report = ctx
        .dispatcher
        .on_conversation_started(&ConversationStarted {
            conversation_id: "conv-1".to_string(),
            contact_id: "contact-1".to_string(),
            channel_id: "whatsapp".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(report.dispatched.len(), 1);

    assert_eq!(ctx.gateway.texts(), vec!["Hello"]);
    let automation = ctx.service.get(&automation_id).await.unwrap();
    assert_eq!(automation.execution_count, 1);
}

#[tokio::test]
async fn test_harness_collapses_delays_and_skips_counters() {
    let ctx = setup().await;
    ctx.gateway.add_template("discount", "Deal for {{customer}}");
    let steps = welcome_flow();
    let (automation, _) = ctx
        .service
        .create("welcome", Trigger::NewConversation, None, steps)
        .await
        .unwrap();

    // Draft automation, never activated: the harness still runs it.
    let report = ctx
        .harness
        .run_automation(&automation.automation_id, "conv-test", "contact-test")
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Running);
    assert_eq!(report.waiting_for, Some(WaitKind::UserReply));
    assert_eq!(report.steps_executed, vec!["greet", "ask"]);

    // Answering drives it through the collapsed delay to the gate.
    ctx.dispatcher
        .on_message_received(&MessageReceived {
            conversation_id: "conv-test".to_string(),
            text: "Ada".to_string(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let run = ctx.store.get_run(&report.run_id).await.unwrap().unwrap();
    assert!(run.is_test);
    assert_eq!(run.waiting_for, Some(WaitKind::KeywordCatch));
    assert_eq!(
        ctx.gateway.texts().last().map(String::as_str),
        Some("Deal for Ada")
    );

    // Stop gate completes the test run without touching the counter.
    ctx.dispatcher
        .on_message_received(&MessageReceived {
            conversation_id: "conv-test".to_string(),
            text: "stop".to_string(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();
    let automation = ctx.service.get(&automation.automation_id).await.unwrap();
    assert_eq!(automation.execution_count, 0);
}

#[tokio::test]
async fn test_harness_rejects_invalid_flow() {
    let ctx = setup().await;
    let (automation, _) = ctx
        .service
        .create(
            "ok",
            Trigger::NewConversation,
            None,
            vec![custom_reply("a", 1, "hi", None)],
        )
        .await
        .unwrap();

    // Corrupt the draft after creation: dangling edge.
    ctx.store
        .replace_steps(
            &automation.automation_id,
            &[custom_reply("a", 1, "hi", Some("ghost"))],
        )
        .await
        .unwrap();

    let err = ctx
        .harness
        .run_automation(&automation.automation_id, "conv-test", "contact-test")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationFailed { .. }));
}

#[tokio::test]
async fn test_edits_do_not_affect_inflight_runs() {
    let ctx = setup().await;
    let steps = vec![
        user_reply("ask", 1, "Question A?", "answer", Some("thanks")),
        custom_reply("thanks", 2, "Thanks: {{answer}}", None),
    ];
    let automation_id = activated(&ctx, steps).await;
    let run_id = started(&ctx, &automation_id).await;

    // Rewrite the live flow while the run is suspended.
    ctx.service
        .update(
            &automation_id,
            "welcome",
            Trigger::NewConversation,
            None,
            vec![custom_reply("other", 1, "Completely different", None)],
        )
        .await
        .unwrap();

    // The run still resolves through its activation snapshot.
    ctx.dispatcher.on_message_received(&message("blue")).await.unwrap();
    let run = ctx.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.outcome, RunOutcome::Completed);
    assert_eq!(
        ctx.gateway.texts().last().map(String::as_str),
        Some("Thanks: blue")
    );
}
