//! Shared test helpers: scripted model stream, recording tools, runtime fixture.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use buddy_core::agent::AgentCatalog;
use buddy_core::bus::{BusEvent, BusMessage, Subscription, WILDCARD};
use buddy_core::config::BuddyConfig;
use buddy_core::error::{BuddyError, Result};
use buddy_core::llm::{EventStream, ModelStream, StreamEvent, StreamRequest};
use buddy_core::runtime::{PromptInput, Runtime, RuntimeOptions, TurnHandle};
use buddy_core::session::CreateSession;
use buddy_core::store::DurableStore;
use buddy_core::tools::{AgentTool, Tool, ToolOutput, ToolParameters};
use buddy_core::types::{
    AssistantMessage, FinishReason, MessageWithParts, Part, ProjectId, SessionId, TokenUsage,
    ToolPart,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// One scripted model response.
pub enum Script {
    /// Emit the events, then end the stream.
    Events(Vec<StreamEvent>),
    /// Emit the events, then stay open until cancelled.
    Hang(Vec<StreamEvent>),
}

/// A model that replays queued scripts and records every request.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    /// Answers for title requests, kept apart so they never race a turn.
    titles: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Script>, titles: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            titles: Mutex::new(titles.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queue another script after construction.
    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests made for turns, excluding title generation.
    pub fn turn_requests(&self) -> Vec<StreamRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.agent != "title")
            .collect()
    }
}

#[async_trait]
impl ModelStream for ScriptedModel {
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken) -> Result<EventStream> {
        let is_title = request.agent == "title";
        self.requests.lock().unwrap().push(request);
        if is_title {
            let title = self.titles.lock().unwrap().pop_front().unwrap_or_default();
            return Ok(futures::stream::iter(text_reply(&title)).boxed());
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Events(text_reply("Mock response")));
        match script {
            Script::Events(events) => Ok(futures::stream::iter(events).boxed()),
            Script::Hang(events) => Ok(async_stream::stream! {
                for event in events {
                    yield event;
                }
                cancel.cancelled().await;
            }
            .boxed()),
        }
    }
}

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input,
        output,
        ..Default::default()
    }
}

/// A complete text step ending with `stop`.
pub fn text_reply(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextStart { metadata: None },
        StreamEvent::TextDelta {
            text: text.to_string(),
        },
        StreamEvent::TextEnd { metadata: None },
        StreamEvent::FinishStep {
            finish_reason: FinishReason::Stop,
            usage: usage(10, 20),
        },
    ]
}

/// A step that calls one tool and ends with `tool-calls`.
pub fn tool_step(call_id: &str, tool: &str, input: Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolInputStart {
            id: call_id.to_string(),
            tool_name: tool.to_string(),
        },
        StreamEvent::ToolCall {
            tool_call_id: call_id.to_string(),
            tool_name: tool.to_string(),
            input,
            provider_executed: false,
        },
        StreamEvent::FinishStep {
            finish_reason: FinishReason::ToolCalls,
            usage: usage(10, 5),
        },
    ]
}

/// `echo` tool recording every input it receives.
pub fn echo_tool(calls: Arc<Mutex<Vec<Value>>>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "echo",
        "Echo the text back",
        ToolParameters::object()
            .string("text", "Text to echo", true)
            .build(),
        move |args, _ctx| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(args.raw().clone());
                let text = args.get_str("text")?.to_string();
                Ok(ToolOutput::text(text))
            }
        },
    ))
}

/// `fail` tool that always errors.
pub fn failing_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "fail",
        "Always fails",
        ToolParameters::empty(),
        |_args, _ctx| async move {
            Err(BuddyError::ToolExecution {
                tool_name: "fail".into(),
                message: "disk on fire".into(),
            })
        },
    ))
}

/// `slow` tool that signals `started` and then never finishes on its own.
pub fn slow_tool(started: Arc<Notify>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "slow",
        "Runs for a long time",
        ToolParameters::empty(),
        move |_args, _ctx| {
            let started = started.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ToolOutput::text("late"))
            }
        },
    ))
}

/// `guarded` tool that asks permission `guarded` for pattern `target`.
pub fn guarded_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "guarded",
        "Needs approval",
        ToolParameters::empty(),
        |_args, ctx| async move {
            ctx.ask(buddy_core::tools::ToolAsk {
                permission: "guarded".into(),
                patterns: vec!["target".into()],
                always: vec!["target".into()],
                ..Default::default()
            })
            .await?;
            Ok(ToolOutput::text("approved"))
        },
    ))
}

/// Every bus message published while the fixture lives.
#[derive(Clone, Default)]
pub struct EventLog {
    messages: Arc<Mutex<Vec<BusMessage>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<BusEvent> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.event.clone())
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }
}

pub struct Fixture {
    pub runtime: Arc<Runtime>,
    pub model: Arc<ScriptedModel>,
    pub project: ProjectId,
    pub log: EventLog,
    _subscription: Subscription,
}

pub struct FixtureBuilder {
    scripts: Vec<Script>,
    titles: Vec<String>,
    config: BuddyConfig,
    tools: Vec<Arc<dyn Tool>>,
    agents: Option<AgentCatalog>,
    store: Option<Arc<dyn DurableStore>>,
}

impl FixtureBuilder {
    pub fn script(mut self, script: Script) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn events(self, events: Vec<StreamEvent>) -> Self {
        self.script(Script::Events(events))
    }

    pub fn title(mut self, text: &str) -> Self {
        self.titles.push(text.to_string());
        self
    }

    pub fn config(mut self, config: BuddyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn agents(mut self, agents: AgentCatalog) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn build(self) -> Fixture {
        let model = ScriptedModel::new(self.scripts, self.titles);
        let runtime = Runtime::new(
            RuntimeOptions::builder()
                .model(model.clone() as Arc<dyn ModelStream>)
                .config(self.config)
                .maybe_agents(self.agents)
                .maybe_store(self.store)
                .tools(self.tools)
                .build(),
        );
        let log = EventLog::default();
        let sink = log.messages.clone();
        let subscription = runtime.bus().subscribe(
            WILDCARD,
            Arc::new(move |message: &BusMessage| sink.lock().unwrap().push(message.clone())),
        );
        Fixture {
            runtime,
            model,
            project: ProjectId::new("project_test"),
            log,
            _subscription: subscription,
        }
    }
}

pub fn fixture() -> FixtureBuilder {
    FixtureBuilder {
        scripts: Vec::new(),
        titles: Vec::new(),
        config: BuddyConfig::default(),
        tools: Vec::new(),
        agents: None,
        store: None,
    }
}

impl Fixture {
    pub fn session(&self) -> SessionId {
        self.runtime
            .sessions()
            .create_session(&self.project, CreateSession::default())
            .unwrap()
            .id
    }

    /// Prompt `session` and return the spawned turn.
    pub async fn prompt(&self, session: &SessionId, text: &str) -> TurnHandle {
        self.runtime
            .prompt(
                &self.project,
                PromptInput::builder()
                    .session_id(session.clone())
                    .text(text)
                    .build(),
            )
            .await
            .unwrap()
            .turn
            .unwrap()
    }

    /// Prompt and wait for the finalized assistant message.
    pub async fn run(&self, session: &SessionId, text: &str) -> AssistantMessage {
        let turn = self.prompt(session, text).await;
        tokio::time::timeout(WAIT, turn.wait())
            .await
            .expect("turn did not finish")
            .unwrap()
    }

    pub fn messages(&self, session: &SessionId) -> Vec<MessageWithParts> {
        self.runtime
            .sessions()
            .list_messages(&self.project, session)
            .unwrap()
    }

    /// Parts of the newest assistant message.
    pub fn last_assistant_parts(&self, session: &SessionId) -> Vec<Part> {
        self.messages(session)
            .into_iter()
            .rev()
            .find(|message| !message.info.is_user())
            .map(|message| message.parts)
            .unwrap_or_default()
    }

    pub fn tool_parts(&self, session: &SessionId) -> Vec<ToolPart> {
        self.messages(session)
            .iter()
            .flat_map(|message| message.parts.iter())
            .filter_map(Part::as_tool)
            .cloned()
            .collect()
    }
}
