//! Runtime: the object that owns stores, engine, bus, registry, and model,
//! and drives the prompt flow that starts turns.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCatalog, AgentInfo};
use crate::bus::{BusEvent, EventBus, InProcessBus, SessionStatus};
use crate::config::BuddyConfig;
use crate::error::{BuddyError, Result};
use crate::llm::{EventStream, ModelMessage, ModelStream, StreamEvent, StreamRequest};
use crate::permission::{from_config, PermissionEngine, PermissionRule};
use crate::processor::{self, Turn};
use crate::session::{Session, SessionStore, TurnId};
use crate::store::{DurableStore, InMemoryStore};
use crate::tools::{Registry, TaskTool, Tool};
use crate::types::{
    AssistantMessage, MessageId, MessageTime, ModelRef, Part, PartId, ProjectId, SessionId,
    TextPart, TimeRange, UserMessage,
};

const TITLE_PROMPT: &str = "Generate a concise title for this conversation.
Rules:
- 4 to 8 words.
- No quotes.
- Prefer action-oriented wording.";
const TITLE_MAX_CHARS: usize = 100;
const TITLE_AGENT: &str = "title";

/// Collaborators a [`Runtime`] is assembled from. Everything but the model
/// has an in-process default.
#[derive(Builder)]
pub struct RuntimeOptions {
    model: Arc<dyn ModelStream>,
    #[builder(default)]
    config: BuddyConfig,
    store: Option<Arc<dyn DurableStore>>,
    bus: Option<Arc<dyn EventBus>>,
    agents: Option<AgentCatalog>,
    #[builder(default)]
    tools: Vec<Arc<dyn Tool>>,
}

/// Input of [`Runtime::prompt`].
#[derive(Debug, Clone, Builder)]
pub struct PromptInput {
    pub session_id: SessionId,
    #[builder(into)]
    pub text: String,
    #[builder(into)]
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    /// Extra system prompt for this message.
    #[builder(into)]
    pub system: Option<String>,
    /// Store the user message without starting a turn.
    #[builder(default)]
    pub no_reply: bool,
    /// Per-prompt tool toggles written to the session overrides.
    #[builder(default)]
    pub tools: Vec<(String, bool)>,
    /// Token of a parent turn; the new turn is cancelled with it.
    pub parent_cancel: Option<CancellationToken>,
}

/// Result of [`Runtime::prompt`].
#[derive(Debug)]
pub struct PromptOutcome {
    pub user: UserMessage,
    /// The empty assistant message the turn fills in.
    pub assistant: Option<AssistantMessage>,
    pub turn: Option<TurnHandle>,
}

/// Handle to a spawned turn.
#[derive(Debug)]
pub struct TurnHandle {
    session_id: SessionId,
    message_id: MessageId,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<AssistantMessage>,
}

impl TurnHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Cancel the turn. It still finalizes; [`wait`](Self::wait) returns the
    /// aborted message.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the finalized assistant message.
    pub async fn wait(self) -> Result<AssistantMessage> {
        self.result_rx.await.map_err(|_| BuddyError::Aborted)
    }
}

pub struct Runtime {
    config: BuddyConfig,
    sessions: SessionStore,
    permissions: PermissionEngine,
    bus: Arc<dyn EventBus>,
    registry: Registry,
    model: Arc<dyn ModelStream>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("tools", &self.registry.ids())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Assemble a runtime. The `task` tool is always registered.
    pub fn new(options: RuntimeOptions) -> Arc<Self> {
        let RuntimeOptions {
            model,
            config,
            store,
            bus,
            agents,
            tools,
        } = options;
        let store = store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let bus = bus.unwrap_or_else(|| Arc::new(InProcessBus::new()));
        let agents =
            agents.unwrap_or_else(|| AgentCatalog::with_defaults(&from_config(&config.permission)));

        let mut registry = Registry::new(tools, agents);
        let task = TaskTool::new(registry.agents());
        registry.register(Arc::new(task));

        Arc::new(Self {
            sessions: SessionStore::new(store.clone(), bus.clone()),
            permissions: PermissionEngine::new(store, bus.clone()),
            config,
            bus,
            registry,
            model,
        })
    }

    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn model(&self) -> &Arc<dyn ModelStream> {
        &self.model
    }

    /// Append a user message and, unless `no_reply`, start a turn answering it.
    pub async fn prompt(self: &Arc<Self>, project: &ProjectId, input: PromptInput) -> Result<PromptOutcome> {
        let session = self.sessions.require_session(project, &input.session_id)?;
        if self.sessions.is_busy(project, &session.id) {
            return Err(BuddyError::SessionBusy {
                session_id: session.id.to_string(),
            });
        }
        let agents = self.registry.agents();
        let agent_name = match &input.agent {
            Some(name) => name.clone(),
            None => agents.default_agent()?.to_string(),
        };
        let agent = agents.require(&agent_name)?.clone();
        tracing::debug!(
            project_id = %project,
            session_id = %session.id,
            agent = %agent.name,
            content_len = input.text.len(),
            "prompt received"
        );

        if input.no_reply {
            let user = self.append_user(project, &session, &agent.name, &input)?;
            return Ok(PromptOutcome {
                user,
                assistant: None,
                turn: None,
            });
        }

        let cancel = input
            .parent_cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let turn_id = self.sessions.begin_turn(project, &session.id, cancel.clone())?;
        let prepared = self.open_turn(project, &session, &agent.name, &input);
        let (user, assistant) = match prepared {
            Ok(messages) => messages,
            Err(err) => {
                self.sessions.release_turn(project, &session.id, turn_id);
                return Err(err);
            }
        };

        self.bus.publish(
            project,
            BusEvent::SessionStatus {
                session_id: session.id.clone(),
                status: SessionStatus::Busy,
            },
        );
        let handle = self.spawn_turn(project, &session.id, assistant.clone(), agent, turn_id, cancel);

        if self.config.session.auto_title
            && session.parent_id.is_none()
            && matches!(self.sessions.user_message_count(project, &session.id), Ok(1))
        {
            self.spawn_title(project.clone(), session.id.clone(), input.text.clone());
        }

        Ok(PromptOutcome {
            user,
            assistant: Some(assistant),
            turn: Some(handle),
        })
    }

    fn open_turn(
        &self,
        project: &ProjectId,
        session: &Session,
        agent: &str,
        input: &PromptInput,
    ) -> Result<(UserMessage, AssistantMessage)> {
        let user = self.append_user(project, session, agent, input)?;
        let assistant = AssistantMessage::empty(session.id.clone(), agent);
        let info = self.sessions.append_message(project, assistant.clone().into())?;
        self.bus.publish(project, BusEvent::MessageUpdated { info });
        tracing::debug!(
            session_id = %session.id,
            message_id = %assistant.id,
            "assistant message created"
        );
        Ok((user, assistant))
    }

    fn append_user(
        &self,
        project: &ProjectId,
        session: &Session,
        agent: &str,
        input: &PromptInput,
    ) -> Result<UserMessage> {
        if !input.tools.is_empty() {
            let mut overrides = session.permission.clone();
            overrides.extend(input.tools.iter().map(|(tool, enabled)| {
                if *enabled {
                    PermissionRule::allow(tool.as_str(), "*")
                } else {
                    PermissionRule::deny(tool.as_str(), "*")
                }
            }));
            self.sessions.set_permission(project, &session.id, overrides)?;
        }

        let user = UserMessage {
            id: MessageId::new(),
            session_id: session.id.clone(),
            agent: Some(agent.to_string()),
            model: input.model.clone(),
            system: input.system.clone(),
            time: MessageTime::now(),
        };
        let info = self.sessions.append_message(project, user.clone().into())?;
        let part = self.sessions.append_part(
            project,
            Part::Text(TextPart {
                id: PartId::new(),
                session_id: session.id.clone(),
                message_id: user.id.clone(),
                text: input.text.clone(),
                synthetic: false,
                ignored: false,
                time: Some(TimeRange::starting_now()),
                metadata: None,
            }),
        )?;
        self.bus.publish(project, BusEvent::MessageUpdated { info });
        self.bus.publish(project, BusEvent::PartUpdated { part });
        Ok(user)
    }

    fn spawn_turn(
        self: &Arc<Self>,
        project: &ProjectId,
        session: &SessionId,
        message: AssistantMessage,
        agent: AgentInfo,
        turn_id: TurnId,
        cancel: CancellationToken,
    ) -> TurnHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let handle = TurnHandle {
            session_id: session.clone(),
            message_id: message.id.clone(),
            cancel: cancel.clone(),
            result_rx,
        };
        let turn = Turn {
            project: project.clone(),
            session_id: session.clone(),
            message,
            agent,
            turn_id,
            cancel,
        };
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let finished = processor::run_turn(runtime, turn).await;
            let _ = result_tx.send(finished);
        });
        handle
    }

    fn spawn_title(self: &Arc<Self>, project: ProjectId, session: SessionId, text: String) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            match runtime.generate_title(&project, &session, text).await {
                Ok(Some(title)) => {
                    tracing::debug!(session_id = %session, title = %title, "session title updated");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %session, error = %err, "title generation failed");
                }
            }
        });
    }

    async fn generate_title(
        &self,
        project: &ProjectId,
        session: &SessionId,
        text: String,
    ) -> Result<Option<String>> {
        let request = StreamRequest {
            session_id: session.clone(),
            message_id: MessageId::new(),
            agent: TITLE_AGENT.to_string(),
            system: vec![TITLE_PROMPT.to_string()],
            messages: vec![ModelMessage::user(text)],
            tools: Vec::new(),
            step: 1,
            force_text_only: true,
        };
        let stream: EventStream = self.model.stream(request, CancellationToken::new()).await?;
        let raw: String = stream
            .filter_map(|event| async move {
                match event {
                    StreamEvent::TextDelta { text } => Some(text),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .await
            .concat();
        let Some(title) = clean_title(&raw) else {
            return Ok(None);
        };
        self.sessions.set_title(project, session, title.clone())?;
        Ok(Some(title))
    }

    /// Cancel the session's active turn. Returns whether one was running.
    pub fn abort(&self, project: &ProjectId, session: &SessionId) -> bool {
        self.sessions.abort(project, session)
    }

    /// Poll until the session has no active turn.
    ///
    /// `on_progress` is called with the elapsed time after every poll, and a
    /// final time with `busy = false` once the session is idle.
    pub async fn wait_for_idle(
        &self,
        project: &ProjectId,
        session: &SessionId,
        cancel: &CancellationToken,
        max_wait: Duration,
        poll: Duration,
        mut on_progress: impl FnMut(Duration, bool) + Send,
    ) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(BuddyError::Aborted);
            }
            let elapsed = started.elapsed();
            if !self.sessions.is_busy(project, session) {
                on_progress(elapsed, false);
                return Ok(());
            }
            if elapsed > max_wait {
                return Err(BuddyError::TaskWaitTimeout {
                    session_id: session.to_string(),
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            on_progress(elapsed, true);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BuddyError::Aborted),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// First non-empty line, unquoted and capped.
fn clean_title(raw: &str) -> Option<String> {
    let line = raw
        .lines()
        .map(|line| line.trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace()))
        .find(|line| !line.is_empty())?;
    Some(line.chars().take(TITLE_MAX_CHARS).collect())
}
