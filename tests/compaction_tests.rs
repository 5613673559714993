//! Pruning of old tool outputs after a turn.

mod common;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;

use buddy_core::compaction;
use buddy_core::config::{BuddyConfig, CompactionConfig};
use buddy_core::llm::COMPACTED_PLACEHOLDER;
use buddy_core::session::SessionStore;
use buddy_core::types::{
    AssistantMessage, CompletedTime, MessageId, MessageTime, Part, PartId, ProjectId, SessionId,
    TextPart, ToolPart, ToolState, UserMessage,
};

use common::*;

fn user(sessions: &SessionStore, project: &ProjectId, session: &SessionId, text: &str) {
    let info = UserMessage {
        id: MessageId::new(),
        session_id: session.clone(),
        agent: Some("build".into()),
        model: None,
        system: None,
        time: MessageTime::now(),
    };
    sessions.update_message(project, info.clone().into()).unwrap();
    sessions
        .update_part(
            project,
            Part::Text(TextPart {
                id: PartId::new(),
                session_id: session.clone(),
                message_id: info.id,
                text: text.into(),
                synthetic: false,
                ignored: false,
                time: None,
                metadata: None,
            }),
        )
        .unwrap();
}

/// Assistant message with one completed `tool` call per output size.
fn assistant(
    sessions: &SessionStore,
    project: &ProjectId,
    session: &SessionId,
    tool: &str,
    sizes: &[usize],
) -> Vec<PartId> {
    let mut info = AssistantMessage::empty(session.clone(), "build");
    info.time.completed = Some(Utc::now());
    sessions.update_message(project, info.clone().into()).unwrap();
    sizes
        .iter()
        .enumerate()
        .map(|(n, size)| {
            let now = Utc::now();
            let part = ToolPart {
                id: PartId::new(),
                session_id: session.clone(),
                message_id: info.id.clone(),
                tool: tool.into(),
                call_id: format!("call_{n}"),
                state: ToolState::Completed {
                    input: json!({}),
                    output: "x".repeat(*size),
                    metadata: None,
                    title: None,
                    time: CompletedTime {
                        start: now,
                        end: now,
                        compacted: None,
                    },
                },
                metadata: None,
            };
            sessions.update_part(project, Part::Tool(part.clone())).unwrap();
            part.id
        })
        .collect()
}

fn compacted(fixture: &Fixture, session: &SessionId) -> Vec<bool> {
    fixture
        .tool_parts(session)
        .iter()
        .map(|tool| match &tool.state {
            ToolState::Completed { time, .. } => time.compacted.is_some(),
            _ => false,
        })
        .collect()
}

#[tokio::test]
async fn oldest_outputs_beyond_the_protected_window_are_compacted() {
    let fixture = fixture().build();
    let sessions = fixture.runtime.sessions();
    let session = fixture.session();
    user(sessions, &fixture.project, &session, "one");
    assistant(sessions, &fixture.project, &session, "read", &[40_000; 6]);
    user(sessions, &fixture.project, &session, "two");
    user(sessions, &fixture.project, &session, "three");

    let pruned = compaction::prune(sessions, &CompactionConfig::default(), &fixture.project, &session).unwrap();

    assert_eq!(pruned, 2);
    assert_eq!(compacted(&fixture, &session), vec![true, true, false, false, false, false]);
    for tool in fixture.tool_parts(&session) {
        let ToolState::Completed { output, .. } = &tool.state else {
            panic!("expected completed");
        };
        assert_eq!(output.len(), 40_000);
    }
}

#[tokio::test]
async fn small_histories_are_left_alone() {
    let fixture = fixture().build();
    let sessions = fixture.runtime.sessions();
    let session = fixture.session();
    user(sessions, &fixture.project, &session, "one");
    assistant(sessions, &fixture.project, &session, "read", &[20_000; 5]);
    user(sessions, &fixture.project, &session, "two");
    user(sessions, &fixture.project, &session, "three");

    let pruned = compaction::prune(sessions, &CompactionConfig::default(), &fixture.project, &session).unwrap();

    assert_eq!(pruned, 0);
    assert!(compacted(&fixture, &session).iter().all(|c| !c));
}

#[tokio::test]
async fn recent_turns_and_protected_tools_are_never_pruned() {
    let fixture = fixture().build();
    let sessions = fixture.runtime.sessions();
    let session = fixture.session();
    user(sessions, &fixture.project, &session, "one");
    assistant(sessions, &fixture.project, &session, "skill", &[80_000; 4]);
    user(sessions, &fixture.project, &session, "two");
    assistant(sessions, &fixture.project, &session, "read", &[80_000; 4]);
    user(sessions, &fixture.project, &session, "three");

    let pruned = compaction::prune(sessions, &CompactionConfig::default(), &fixture.project, &session).unwrap();

    assert_eq!(pruned, 0);
}

#[tokio::test]
async fn turn_end_prunes_and_the_next_step_sees_placeholders() {
    let fixture = fixture()
        .events(text_reply("first"))
        .events(text_reply("second"))
        .build();
    let sessions = fixture.runtime.sessions();
    let session = fixture.session();
    user(sessions, &fixture.project, &session, "one");
    let parts = assistant(sessions, &fixture.project, &session, "read", &[40_000; 6]);
    user(sessions, &fixture.project, &session, "two");

    fixture.run(&session, "three").await;
    assert_eq!(compacted(&fixture, &session), vec![true, true, false, false, false, false]);

    fixture.run(&session, "four").await;
    let request = &fixture.model.turn_requests()[1];
    let results: Vec<_> = request
        .messages
        .iter()
        .flat_map(|message| message.tool_results())
        .collect();
    assert_eq!(results.len(), parts.len());
    assert_eq!(results[0].result, json!(COMPACTED_PLACEHOLDER));
    assert_ne!(results[5].result, json!(COMPACTED_PLACEHOLDER));
}

#[tokio::test]
async fn pruning_can_be_disabled() {
    let config = BuddyConfig::from_toml_str("[compaction]\nprune = false\n").unwrap();
    let fixture = fixture().config(config).events(text_reply("ok")).build();
    let sessions = fixture.runtime.sessions();
    let session = fixture.session();
    user(sessions, &fixture.project, &session, "one");
    assistant(sessions, &fixture.project, &session, "read", &[40_000; 6]);
    user(sessions, &fixture.project, &session, "two");

    fixture.run(&session, "three").await;

    assert!(compacted(&fixture, &session).iter().all(|c| !c));
}
