//! End-to-end turns through the step processor.

mod common;

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

use buddy_core::agent::{base_rules, AgentCatalog, AgentInfo, AgentMode};
use buddy_core::bus::{subscribe_stream, BusEvent, SessionStatus};
use buddy_core::config::BuddyConfig;
use buddy_core::llm::{StreamEvent, MAX_STEPS_PROMPT};
use buddy_core::permission::PermissionReply;
use buddy_core::types::{FinishReason, Part, ToolState};

use common::*;

fn statuses(fixture: &Fixture) -> Vec<SessionStatus> {
    fixture
        .log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BusEvent::SessionStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn text_reply_finishes_in_one_step() {
    let fixture = fixture().events(text_reply("Hello there")).build();
    let session = fixture.session();

    let message = fixture.run(&session, "hi").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(message.error, None);
    assert!(message.time.completed.is_some());
    assert_eq!(message.tokens.input, 10);
    assert_eq!(message.tokens.output, 20);

    let parts = fixture.last_assistant_parts(&session);
    assert!(matches!(parts.first(), Some(Part::StepStart(_))));
    let text = parts.iter().find_map(Part::as_text).unwrap();
    assert_eq!(text.text, "Hello there");
    assert!(matches!(parts.last(), Some(Part::StepFinish(finish)) if finish.reason.as_deref() == Some("stop")));

    assert_eq!(fixture.model.turn_requests().len(), 1);
    assert_eq!(statuses(&fixture), vec![SessionStatus::Busy, SessionStatus::Idle]);
    assert!(!fixture.runtime.sessions().is_busy(&fixture.project, &session));
}

#[tokio::test]
async fn deltas_are_published_and_stored() {
    let fixture = fixture()
        .events(vec![
            StreamEvent::ReasoningStart {
                id: "r1".into(),
                metadata: None,
            },
            StreamEvent::ReasoningDelta {
                id: "r1".into(),
                text: "think".into(),
            },
            StreamEvent::ReasoningEnd {
                id: "r1".into(),
                metadata: None,
            },
            StreamEvent::TextStart { metadata: None },
            StreamEvent::TextDelta { text: "Hel".into() },
            StreamEvent::TextDelta { text: "lo".into() },
            StreamEvent::TextEnd { metadata: None },
            StreamEvent::FinishStep {
                finish_reason: FinishReason::Stop,
                usage: usage(1, 1),
            },
        ])
        .build();
    let session = fixture.session();
    fixture.run(&session, "hi").await;

    assert_eq!(fixture.log.count("message.part.delta"), 3);
    let parts = fixture.last_assistant_parts(&session);
    let reasoning = parts
        .iter()
        .find_map(|part| match part {
            Part::Reasoning(reasoning) => Some(reasoning),
            _ => None,
        })
        .unwrap();
    assert_eq!(reasoning.text, "think");
    assert!(reasoning.time.end.is_some());
    assert_eq!(parts.iter().find_map(Part::as_text).unwrap().text, "Hello");
}

#[tokio::test]
async fn tool_call_executes_then_loops_for_the_answer() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let fixture = fixture()
        .tool(echo_tool(calls.clone()))
        .events(tool_step("call_1", "echo", json!({ "text": "ping" })))
        .events(text_reply("done"))
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "echo ping").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(*calls.lock().unwrap(), vec![json!({ "text": "ping" })]);
    let tools = fixture.tool_parts(&session);
    assert_eq!(tools.len(), 1);
    match &tools[0].state {
        ToolState::Completed { output, metadata, .. } => {
            assert_eq!(output, "ping");
            assert_eq!(metadata.as_ref().unwrap()["truncated"], json!(false));
        }
        other => panic!("unexpected state {other:?}"),
    }

    let requests = fixture.model.turn_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools.iter().any(|tool| tool.name == "echo"));
    let results: Vec<_> = requests[1]
        .messages
        .iter()
        .flat_map(|message| message.tool_results())
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_call_id, "call_1");
    assert!(!results[0].is_error);
    assert_eq!(message.tokens.input, 20);
}

#[tokio::test]
async fn fully_denied_tools_are_not_offered() {
    let config = BuddyConfig::from_toml_str(
        r#"
        [permission]
        "*" = "deny"
        "#,
    )
    .unwrap();
    let fixture = fixture()
        .config(config)
        .tool(echo_tool(Arc::default()))
        .events(text_reply("I cannot use tools"))
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "hi").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    let requests = fixture.model.turn_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools.is_empty());
    assert!(fixture.tool_parts(&session).is_empty());
}

#[tokio::test]
async fn tool_failure_is_reported_and_the_loop_continues() {
    let fixture = fixture()
        .tool(failing_tool())
        .events(tool_step("call_1", "fail", json!({})))
        .events(text_reply("that failed"))
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "go").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(message.error, None);
    let tools = fixture.tool_parts(&session);
    match &tools[0].state {
        ToolState::Error { error, .. } => assert!(error.contains("disk on fire")),
        other => panic!("unexpected state {other:?}"),
    }
    let requests = fixture.model.turn_requests();
    assert_eq!(requests.len(), 2);
    let result = requests[1]
        .messages
        .iter()
        .flat_map(|message| message.tool_results())
        .next()
        .unwrap()
        .clone();
    assert!(result.is_error);
}

#[tokio::test]
async fn invalid_tool_input_is_fed_back() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let fixture = fixture()
        .tool(echo_tool(calls.clone()))
        .events(tool_step("call_1", "echo", json!({ "wrong": 1 })))
        .events(text_reply("retrying later"))
        .build();
    let session = fixture.session();

    fixture.run(&session, "go").await;

    assert!(calls.lock().unwrap().is_empty());
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => {
            assert!(error.starts_with("The echo tool was called with invalid arguments"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_becomes_an_error_part() {
    let fixture = fixture()
        .events(tool_step("call_1", "nope", json!({})))
        .events(text_reply("ok"))
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "go").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => assert_eq!(error, "Unknown tool: nope"),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn step_limit_forces_a_text_only_last_step() {
    let agent = AgentInfo::builder()
        .name("build")
        .mode(AgentMode::Primary)
        .permission(base_rules())
        .steps(2)
        .build();
    let fixture = fixture()
        .agents(AgentCatalog::new(vec![agent]))
        .tool(echo_tool(Arc::default()))
        .events(tool_step("call_1", "echo", json!({ "text": "a" })))
        .events(tool_step("call_2", "echo", json!({ "text": "b" })))
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "loop forever").await;

    assert_eq!(message.finish, Some(FinishReason::MaxSteps));
    let requests = fixture.model.turn_requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].force_text_only);
    assert!(requests[1].force_text_only);
    assert!(requests[1].tools.is_empty());
    assert_eq!(requests[1].system.last().map(String::as_str), Some(MAX_STEPS_PROMPT));

    let tools = fixture.tool_parts(&session);
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().all(|tool| !tool.state.is_in_flight()));
    match &tools[1].state {
        ToolState::Error { error, .. } => assert!(error.contains("not available")),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn repeated_identical_calls_ask_doom_loop_once() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let input = json!({ "text": "same" });
    let mut builder = fixture().tool(echo_tool(calls.clone()));
    for n in 0..4 {
        builder = builder.events(tool_step(&format!("call_{n}"), "echo", input.clone()));
    }
    let fixture = builder.events(text_reply("stopping")).build();
    let session = fixture.session();

    let (_sub, mut asked) = subscribe_stream(fixture.runtime.bus().as_ref(), "permission.asked");
    let turn = fixture.prompt(&session, "repeat").await;

    let message = tokio::time::timeout(WAIT, asked.next()).await.unwrap().unwrap();
    let BusEvent::PermissionAsked(request) = message.event else {
        panic!("expected permission.asked");
    };
    assert_eq!(request.permission, "doom_loop");
    assert_eq!(request.patterns, vec!["echo".to_string()]);
    assert_eq!(request.metadata["input"], input);
    assert_eq!(calls.lock().unwrap().len(), 3);
    let finished = fixture
        .tool_parts(&session)
        .iter()
        .filter(|tool| matches!(tool.state, ToolState::Completed { .. }))
        .count();
    assert_eq!(finished, 3);
    fixture
        .runtime
        .permissions()
        .reply(&fixture.project, &request.id, PermissionReply::Once, None)
        .unwrap();

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(fixture.log.count("permission.asked"), 1);
    assert_eq!(calls.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn abort_finalizes_running_tools() {
    let started = Arc::new(Notify::new());
    let fixture = fixture()
        .tool(slow_tool(started.clone()))
        .events(tool_step("call_1", "slow", json!({})))
        .build();
    let session = fixture.session();

    let turn = fixture.prompt(&session, "take your time").await;
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    assert!(fixture.runtime.abort(&fixture.project, &session));

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(message.finish, Some(FinishReason::Aborted));
    assert_eq!(message.error, None);
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => assert_eq!(error, "Tool execution aborted"),
        other => panic!("unexpected state {other:?}"),
    }
    assert!(!fixture.runtime.sessions().is_busy(&fixture.project, &session));
    assert_eq!(statuses(&fixture).last(), Some(&SessionStatus::Idle));
    assert!(!fixture.runtime.abort(&fixture.project, &session));
}

#[tokio::test]
async fn abort_while_streaming_ends_the_turn() {
    let fixture = fixture()
        .script(Script::Hang(vec![
            StreamEvent::TextStart { metadata: None },
            StreamEvent::TextDelta {
                text: "partial".into(),
            },
        ]))
        .build();
    let session = fixture.session();

    let turn = fixture.prompt(&session, "hi").await;
    let (_sub, mut deltas) = subscribe_stream(fixture.runtime.bus().as_ref(), "message.part.delta");
    if fixture.log.count("message.part.delta") == 0 {
        tokio::time::timeout(WAIT, deltas.next()).await.unwrap();
    }
    turn.cancel();

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(message.finish, Some(FinishReason::Aborted));
    let text = fixture
        .last_assistant_parts(&session)
        .iter()
        .find_map(Part::as_text)
        .cloned()
        .unwrap();
    assert_eq!(text.text, "partial");
}

#[tokio::test]
async fn rejection_stops_the_loop() {
    let config = BuddyConfig::from_toml_str(
        r#"
        [permission]
        guarded = "ask"
        "#,
    )
    .unwrap();
    let fixture = fixture()
        .config(config)
        .tool(guarded_tool())
        .events(tool_step("call_1", "guarded", json!({})))
        .events(text_reply("never requested"))
        .build();
    let session = fixture.session();

    let (_sub, mut asked) = subscribe_stream(fixture.runtime.bus().as_ref(), "permission.asked");
    let turn = fixture.prompt(&session, "do it").await;
    let message = tokio::time::timeout(WAIT, asked.next()).await.unwrap().unwrap();
    let BusEvent::PermissionAsked(request) = message.event else {
        panic!("expected permission.asked");
    };
    fixture
        .runtime
        .permissions()
        .reply(&fixture.project, &request.id, PermissionReply::Reject, None)
        .unwrap();

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(fixture.model.turn_requests().len(), 1);
    // The provider still reported tool-calls, so the turn counts as cut short.
    assert_eq!(message.finish, Some(FinishReason::MaxSteps));
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => {
            assert_eq!(error, "The user rejected permission to use this specific tool call.");
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn rejection_with_feedback_keeps_the_loop_going() {
    let config = BuddyConfig::from_toml_str("[permission]\nguarded = \"ask\"\n").unwrap();
    let fixture = fixture()
        .config(config)
        .tool(guarded_tool())
        .events(tool_step("call_1", "guarded", json!({})))
        .events(text_reply("Using the staging target instead."))
        .build();
    let session = fixture.session();

    let (_sub, mut asked) = subscribe_stream(fixture.runtime.bus().as_ref(), "permission.asked");
    let turn = fixture.prompt(&session, "do it").await;
    let message = tokio::time::timeout(WAIT, asked.next()).await.unwrap().unwrap();
    let BusEvent::PermissionAsked(request) = message.event else {
        panic!("expected permission.asked");
    };
    fixture
        .runtime
        .permissions()
        .reply(
            &fixture.project,
            &request.id,
            PermissionReply::Reject,
            Some("use staging".into()),
        )
        .unwrap();

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(fixture.model.turn_requests().len(), 2);
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => {
            assert_eq!(error, "The user rejected permission with this feedback: use staging");
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn rejection_can_be_configured_to_continue() {
    let config = BuddyConfig::from_toml_str(
        r#"
        [processor]
        continue_loop_on_deny = true

        [permission]
        guarded = "ask"
        "#,
    )
    .unwrap();
    let fixture = fixture()
        .config(config)
        .tool(guarded_tool())
        .events(tool_step("call_1", "guarded", json!({})))
        .events(text_reply("understood"))
        .build();
    let session = fixture.session();

    let (_sub, mut asked) = subscribe_stream(fixture.runtime.bus().as_ref(), "permission.asked");
    let turn = fixture.prompt(&session, "do it").await;
    let message = tokio::time::timeout(WAIT, asked.next()).await.unwrap().unwrap();
    let BusEvent::PermissionAsked(request) = message.event else {
        panic!("expected permission.asked");
    };
    fixture
        .runtime
        .permissions()
        .reply(&fixture.project, &request.id, PermissionReply::Reject, None)
        .unwrap();

    let message = tokio::time::timeout(WAIT, turn.wait()).await.unwrap().unwrap();
    assert_eq!(message.finish, Some(FinishReason::Stop));
    assert_eq!(fixture.model.turn_requests().len(), 2);
}

#[tokio::test]
async fn stream_error_records_the_message_error() {
    let fixture = fixture()
        .events(vec![StreamEvent::Error {
            message: "upstream exploded".into(),
        }])
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "hi").await;

    assert_eq!(message.finish, Some(FinishReason::Error));
    assert_eq!(message.error.as_deref(), Some("Stream error: upstream exploded"));
    assert!(!fixture.runtime.sessions().is_busy(&fixture.project, &session));
}

#[tokio::test]
async fn provider_executed_tools_wait_for_their_result() {
    let fixture = fixture()
        .events(vec![
            StreamEvent::ToolCall {
                tool_call_id: "remote_1".into(),
                tool_name: "web_search".into(),
                input: json!({ "q": "rust" }),
                provider_executed: true,
            },
            StreamEvent::ToolResult {
                tool_call_id: "remote_1".into(),
                output: buddy_core::tools::ToolOutput::text("results"),
            },
            StreamEvent::TextStart { metadata: None },
            StreamEvent::TextDelta {
                text: "found it".into(),
            },
            StreamEvent::TextEnd { metadata: None },
            StreamEvent::FinishStep {
                finish_reason: FinishReason::Stop,
                usage: usage(1, 1),
            },
        ])
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "search").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Completed { output, .. } => assert_eq!(output, "results"),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn unfinished_tool_parts_are_closed_at_the_end() {
    let fixture = fixture()
        .events(vec![
            StreamEvent::ToolInputStart {
                id: "call_1".into(),
                tool_name: "echo".into(),
            },
            StreamEvent::TextStart { metadata: None },
            StreamEvent::TextDelta { text: "ok".into() },
            StreamEvent::TextEnd { metadata: None },
            StreamEvent::FinishStep {
                finish_reason: FinishReason::Stop,
                usage: usage(1, 1),
            },
        ])
        .build();
    let session = fixture.session();

    let message = fixture.run(&session, "hi").await;

    assert_eq!(message.finish, Some(FinishReason::Stop));
    match &fixture.tool_parts(&session)[0].state {
        ToolState::Error { error, .. } => assert_eq!(error, "Tool call was not completed"),
        other => panic!("unexpected state {other:?}"),
    }
}
