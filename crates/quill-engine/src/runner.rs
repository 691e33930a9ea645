use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use quill_core::bus::Bus;
use quill_core::diff::FileDiff;
use quill_core::error::SessionError;
use quill_core::event::BusEvent;
use quill_core::hooks::SessionStopReason;
use quill_core::ids::{now_millis, MessageId, SessionId};
use quill_core::message::{AssistantMessage, Message, MessagePath, UserMessage};
use quill_core::part::{Part, PartBody, Timespan, ToolState, ToolTime};
use quill_core::permission::PermissionReply;
use quill_core::provider::{
    LlmProvider, ModelRef, ModelSpec, ProviderEvent, ProviderResolver, StepStop, StreamOptions,
    TokenUsage,
};
use quill_core::session::{Session, ShareInfo};
use quill_core::todo::Todo;
use quill_core::tools::FileTimes;
use quill_store::diffs::DiffRepo;
use quill_store::messages::MessageRepo;
use quill_store::parts::PartRepo;
use quill_store::sessions::SessionRepo;
use quill_store::shares::ShareRepo;
use quill_store::todos::TodoRepo;
use quill_store::Database;

use crate::compact::{self, Compactor};
use crate::config::{AgentConfig, EngineConfig};
use crate::executor::{CallEnv, ToolExecutor};
use crate::hooks::HookRegistry;
use crate::lock::SessionLocks;
use crate::permission::{GateHandle, PermissionGate};
use crate::prompt;
use crate::registry::ToolRegistry;
use crate::snapshot;
use crate::tools::batch::BatchTool;
use crate::truncate::Truncator;

/// Body of a prompt request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptInput {
    pub session_id: SessionId,
    #[serde(default)]
    pub agent: Option<String>,
    pub model: ModelRef,
    pub parts: Vec<PromptPart>,
}

/// User message content accepted from callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PromptPart {
    Text {
        text: String,
    },
    File {
        mime: String,
        url: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        source: Option<String>,
    },
}

impl PromptPart {
    fn into_part(self, message_id: &MessageId, session_id: &SessionId) -> Part {
        let body = match self {
            Self::Text { text } => PartBody::Text {
                text,
                synthetic: false,
                time: Some(Timespan::started(now_millis())),
            },
            Self::File {
                mime,
                url,
                filename,
                source,
            } => PartBody::File {
                mime,
                url,
                filename,
                source,
            },
        };
        Part::new(message_id.clone(), session_id.clone(), body)
    }
}

enum TurnOutcome {
    Completed,
    Compacted,
}

/// The session engine: owns per-session serialisation, the streaming turn
/// loop, tool dispatch and the event fan-out around the store.
pub struct SessionEngine {
    db: Database,
    bus: Bus,
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    providers: Arc<dyn ProviderResolver>,
    locks: SessionLocks,
    gate: Arc<PermissionGate>,
    hooks: Arc<HookRegistry>,
    executor: Arc<ToolExecutor>,
    compactor: Compactor,
    file_times: Mutex<HashMap<String, Arc<FileTimes>>>,
}

impl SessionEngine {
    pub fn new(
        db: Database,
        bus: Bus,
        config: EngineConfig,
        mut registry: ToolRegistry,
        providers: Arc<dyn ProviderResolver>,
        hooks: HookRegistry,
    ) -> Arc<Self> {
        registry.register(Arc::new(BatchTool));
        let registry = Arc::new(registry);
        let hooks = Arc::new(hooks);
        let truncator = Arc::new(Truncator::new(&config.data_dir));
        let gate = Arc::new(PermissionGate::new(
            db.clone(),
            bus.clone(),
            &config.project_id,
        ));
        let executor = ToolExecutor::new(
            db.clone(),
            bus.clone(),
            registry.clone(),
            hooks.clone(),
            truncator,
        );
        let compactor = Compactor::new(db.clone(), bus.clone());

        Arc::new(Self {
            db,
            bus,
            config,
            registry,
            providers,
            locks: SessionLocks::new(),
            gate,
            hooks,
            executor,
            compactor,
            file_times: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.names()
    }

    // --- session management ---

    pub fn create_session(
        &self,
        title: Option<String>,
        parent_id: Option<SessionId>,
    ) -> Result<Session, SessionError> {
        let sessions = SessionRepo::new(self.db.clone());
        if let Some(parent) = &parent_id {
            let parent = sessions.get(parent)?;
            if parent.project_id != self.config.project_id {
                return Err(SessionError::unknown(
                    "parent session belongs to a different project",
                ));
            }
        }
        let session = Session::new(
            &self.config.project_id,
            self.config.directory.to_string_lossy(),
            title,
            parent_id,
            &self.config.version,
        );
        sessions.put(&session)?;
        self.bus.publish(BusEvent::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Session, SessionError> {
        Ok(SessionRepo::new(self.db.clone()).get(id)?)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        Ok(SessionRepo::new(self.db.clone()).list_for_project(&self.config.project_id)?)
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<(), SessionError> {
        self.locks.cancel(id);
        SessionRepo::new(self.db.clone()).delete(id)?;
        self.bus.publish(BusEvent::SessionDeleted {
            session_id: id.clone(),
        });
        Ok(())
    }

    /// Cancel a live turn. Returns whether one was running.
    pub fn abort(&self, id: &SessionId) -> bool {
        self.locks.cancel(id)
    }

    pub fn is_busy(&self, id: &SessionId) -> bool {
        self.locks.is_locked(id)
    }

    /// Cancel every live turn; used by shutdown and `/instance/dispose`.
    pub fn dispose(&self) -> usize {
        self.locks.cancel_all()
    }

    // --- conversation access ---

    pub fn messages(&self, session_id: &SessionId) -> Result<Vec<Message>, SessionError> {
        // Listing an unknown session is a 404, not an empty list.
        SessionRepo::new(self.db.clone()).get(session_id)?;
        Ok(MessageRepo::new(self.db.clone()).list(session_id)?)
    }

    pub fn parts(&self, message_id: &MessageId) -> Result<Vec<Part>, SessionError> {
        MessageRepo::new(self.db.clone()).get(message_id)?;
        Ok(PartRepo::new(self.db.clone()).list_for_message(message_id)?)
    }

    // --- collaborator surfaces ---

    pub fn reply_permission(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        response: PermissionReply,
    ) -> bool {
        self.gate.reply(session_id, permission_id, response)
    }

    pub fn share(&self, session_id: &SessionId) -> Result<ShareInfo, SessionError> {
        let sessions = SessionRepo::new(self.db.clone());
        let mut session = sessions.get(session_id)?;
        if let Some(share) = session.share {
            return Ok(share);
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let share = ShareInfo {
            secret: uuid::Uuid::new_v4().simple().to_string(),
            url: format!("https://quill.dev/s/{id}"),
            id,
        };
        ShareRepo::new(self.db.clone()).set(session_id, &share)?;
        session.share = Some(share.clone());
        session.touch();
        sessions.put(&session)?;
        self.bus.publish(BusEvent::SessionUpdated { session });
        Ok(share)
    }

    pub fn unshare(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let sessions = SessionRepo::new(self.db.clone());
        let mut session = sessions.get(session_id)?;
        ShareRepo::new(self.db.clone()).remove(session_id)?;
        session.share = None;
        session.touch();
        sessions.put(&session)?;
        self.bus.publish(BusEvent::SessionUpdated { session });
        Ok(())
    }

    /// Replace the session todo list wholesale.
    pub fn set_todos(&self, session_id: &SessionId, todos: Vec<Todo>) -> Result<(), SessionError> {
        SessionRepo::new(self.db.clone()).get(session_id)?;
        TodoRepo::new(self.db.clone()).set(session_id, &todos)?;
        self.bus.publish(BusEvent::TodoUpdated {
            session_id: session_id.clone(),
            todos,
        });
        Ok(())
    }

    /// Ingestion point for file-watcher style collaborators between turns.
    pub fn record_file_diff(
        &self,
        session_id: &SessionId,
        diff: FileDiff,
    ) -> Result<(), SessionError> {
        let path = diff.path.clone();
        DiffRepo::new(self.db.clone()).apply(session_id, diff)?;
        self.bus.publish(BusEvent::FileEdited { path });
        Ok(())
    }

    /// Raw watcher notifications fan out to subscribers unchanged.
    pub fn notify_file_watcher(&self, path: impl Into<String>, event: impl Into<String>) {
        self.bus.publish(BusEvent::FileWatcherUpdated {
            path: path.into(),
            event: event.into(),
        });
    }

    /// Remove one message (and its parts) from a session's history; used by
    /// revert-style collaborators. Refuses while a turn is live.
    pub fn remove_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Result<(), SessionError> {
        self.locks.assert_unlocked(session_id)?;
        let message = MessageRepo::new(self.db.clone()).get(message_id)?;
        if message.session_id() != session_id {
            return Err(SessionError::not_found(format!("message {message_id}")));
        }
        MessageRepo::new(self.db.clone()).remove(message_id)?;
        self.bus.publish(BusEvent::MessageRemoved {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });
        Ok(())
    }

    // --- the turn ---

    /// Drive one turn: persist the user message, stream the assistant
    /// response with tool dispatch, finalise, and publish `session.idle`
    /// exactly once. Once the assistant message exists, failures are recorded
    /// on it and the message is returned; only pre-flight failures surface
    /// as errors.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub async fn prompt(&self, input: PromptInput) -> Result<AssistantMessage, SessionError> {
        let sessions = SessionRepo::new(self.db.clone());
        let messages = MessageRepo::new(self.db.clone());

        let mut session = sessions.get(&input.session_id)?;
        let provider = self.providers.resolve(&input.model).ok_or_else(|| {
            SessionError::not_found(format!(
                "model {}/{}",
                input.model.provider_id, input.model.model_id
            ))
        })?;
        let guard = self.locks.acquire(&session.id)?;
        let cancel = guard.token();

        let agent = self
            .config
            .agent(input.agent.as_deref().unwrap_or("build"));
        let spec = provider.spec().clone();
        let system = prompt::compose_system(&self.config, &agent, &spec);
        let path = MessagePath {
            cwd: self.config.directory.to_string_lossy().to_string(),
            root: self.config.directory.to_string_lossy().to_string(),
        };

        // Pre-flight context check against the previous turn's usage.
        if let Some(last) = last_assistant_usage(&messages, &session.id)? {
            if compact::is_overflow(&last, &spec) {
                if !self.config.auto_compact {
                    return Err(SessionError::OverflowError {
                        tokens: last.context_tokens(),
                        limit: compact::effective_limit(&spec),
                    });
                }
                match self
                    .compactor
                    .compact(&session, &agent.name, provider.clone(), system.clone(), path.clone(), &cancel)
                    .await
                {
                    Ok(_) => {}
                    Err(SessionError::Aborted) => {
                        self.bus.publish(BusEvent::SessionIdle {
                            session_id: session.id.clone(),
                        });
                        return Err(SessionError::Aborted);
                    }
                    // The session stays usable; attempt the turn regardless.
                    Err(e) => warn!(error = %e, "pre-flight compaction failed"),
                }
            }
        }

        let user = UserMessage::new(session.id.clone(), &agent.name, input.model.clone());
        let user_parts: Vec<Part> = input
            .parts
            .into_iter()
            .map(|p| p.into_part(&user.id, &session.id))
            .collect();
        let user = Message::User(user);
        messages.put_with_parts(&user, &user_parts)?;
        self.bus.publish(BusEvent::MessageUpdated {
            message: user.clone(),
        });
        for part in &user_parts {
            self.bus
                .publish(BusEvent::MessagePartUpdated { part: part.clone() });
        }
        session.touch();
        sessions.put(&session)?;
        self.bus.publish(BusEvent::SessionUpdated {
            session: session.clone(),
        });

        let mut assistant = AssistantMessage::new(
            session.id.clone(),
            user.id().clone(),
            &input.model,
            &agent.name,
            system,
            path,
        );
        messages.put(&Message::Assistant(assistant.clone()))?;
        self.bus.publish(BusEvent::MessageUpdated {
            message: Message::Assistant(assistant.clone()),
        });

        let before_files = snapshot::capture(&self.config.directory);
        let outcome = self
            .run_turn(&session, &agent, provider, &spec, &mut assistant, &cancel)
            .await;

        // Attribute file changes made during the turn: one patch part on the
        // assistant message plus per-path events.
        let changed = snapshot::changed_paths(
            &before_files,
            &snapshot::capture(&self.config.directory),
        );
        if !changed.is_empty() {
            for path in &changed {
                self.bus.publish(BusEvent::FileEdited { path: path.clone() });
            }
            self.put_part(
                &PartRepo::new(self.db.clone()),
                Part::new(
                    assistant.id.clone(),
                    session.id.clone(),
                    PartBody::Patch {
                        hash: None,
                        files: changed,
                    },
                ),
            );
        }

        let reason = match &outcome {
            Ok(TurnOutcome::Completed) => SessionStopReason::Stop,
            Ok(TurnOutcome::Compacted) => SessionStopReason::Compact,
            Err(_) => SessionStopReason::Error,
        };
        if let Err(err) = &outcome {
            if *err == SessionError::Aborted {
                self.abort_pending_parts(&assistant.id);
            } else {
                self.bus.publish(BusEvent::SessionError {
                    session_id: session.id.clone(),
                    error: err.clone(),
                });
            }
            assistant.error = Some(err.clone());
        }
        assistant.finish();
        if let Err(e) = messages.put(&Message::Assistant(assistant.clone())) {
            error!(error = %e, "failed to finalise assistant message");
        }
        self.bus.publish(BusEvent::MessageUpdated {
            message: Message::Assistant(assistant.clone()),
        });
        self.bus.publish(BusEvent::SessionIdle {
            session_id: session.id.clone(),
        });
        self.hooks.session_stop(session.id.clone(), reason);

        drop(guard);
        Ok(assistant)
    }

    async fn run_turn(
        &self,
        session: &Session,
        agent: &AgentConfig,
        provider: Arc<dyn LlmProvider>,
        spec: &ModelSpec,
        assistant: &mut AssistantMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, SessionError> {
        let messages = MessageRepo::new(self.db.clone());
        let parts = PartRepo::new(self.db.clone());
        let tools = self.registry.definitions_for(agent.tools.as_ref());
        let env = CallEnv {
            session_id: session.id.clone(),
            message_id: assistant.id.clone(),
            worktree: self.config.directory.clone(),
            abort: cancel.clone(),
            permissions: Arc::new(GateHandle::new(self.gate.clone(), agent.permissions.clone())),
            file_times: self.file_times_for(&session.id),
        };

        loop {
            let request = prompt::build_request(
                &self.db,
                &session.id,
                assistant.system.clone(),
                tools.clone(),
            )?;
            let stream_options = StreamOptions::default();
            let mut stream = tokio::select! {
                r = provider.stream(&request, &stream_options) => {
                    r.map_err(|e| e.to_session_error())?
                }
                _ = cancel.cancelled() => return Err(SessionError::Aborted),
            };

            self.put_part(
                &parts,
                Part::new(assistant.id.clone(), session.id.clone(), PartBody::StepStart),
            );

            let mut text_part: Option<Part> = None;
            let mut reasoning_part: Option<Part> = None;
            let mut step_usage: Option<TokenUsage> = None;
            let mut had_tool_calls = false;
            let mut stop = StepStop::EndTurn;

            loop {
                let event = tokio::select! {
                    e = stream.next() => e,
                    _ = cancel.cancelled() => return Err(SessionError::Aborted),
                };
                let Some(event) = event else { break };
                match event {
                    ProviderEvent::TextDelta { text } => {
                        let part = text_part.get_or_insert_with(|| {
                            Part::new(
                                assistant.id.clone(),
                                session.id.clone(),
                                PartBody::Text {
                                    text: String::new(),
                                    synthetic: false,
                                    time: Some(Timespan::started(now_millis())),
                                },
                            )
                        });
                        if let PartBody::Text { text: buffer, .. } = &mut part.body {
                            buffer.push_str(&text);
                        }
                        self.put_part(&parts, part.clone());
                    }
                    ProviderEvent::TextEnd => {
                        if let Some(mut part) = text_part.take() {
                            if let PartBody::Text { time: Some(time), .. } = &mut part.body {
                                time.finish();
                            }
                            self.put_part(&parts, part);
                        }
                    }
                    ProviderEvent::ReasoningDelta { text } => {
                        let part = reasoning_part.get_or_insert_with(|| {
                            Part::new(
                                assistant.id.clone(),
                                session.id.clone(),
                                PartBody::Reasoning {
                                    text: String::new(),
                                    time: Timespan::started(now_millis()),
                                },
                            )
                        });
                        if let PartBody::Reasoning { text: buffer, .. } = &mut part.body {
                            buffer.push_str(&text);
                        }
                        self.put_part(&parts, part.clone());
                    }
                    ProviderEvent::ReasoningEnd => {
                        if let Some(mut part) = reasoning_part.take() {
                            if let PartBody::Reasoning { time, .. } = &mut part.body {
                                time.finish();
                            }
                            self.put_part(&parts, part);
                        }
                    }
                    ProviderEvent::ToolCall {
                        call_id,
                        tool,
                        input,
                    } => {
                        had_tool_calls = true;
                        self.executor
                            .execute(&env, &call_id, &tool, input, false)
                            .await;
                        if cancel.is_cancelled() {
                            return Err(SessionError::Aborted);
                        }
                    }
                    ProviderEvent::StepFinish { usage, stop: s } => {
                        stop = s;
                        assistant.tokens.add(&usage);
                        assistant.cost += spec.cost.cost_of(&usage);
                        self.put_part(
                            &parts,
                            Part::new(
                                assistant.id.clone(),
                                session.id.clone(),
                                PartBody::StepFinish {
                                    tokens: usage.clone(),
                                    cost: spec.cost.cost_of(&usage),
                                },
                            ),
                        );
                        messages.put(&Message::Assistant(assistant.clone()))?;
                        self.bus.publish(BusEvent::MessageUpdated {
                            message: Message::Assistant(assistant.clone()),
                        });
                        step_usage = Some(usage);
                    }
                    ProviderEvent::Error { error } => {
                        return Err(error.to_session_error());
                    }
                }
            }

            if stop == StepStop::MaxTokens {
                return Err(SessionError::OutputLengthError);
            }

            // Context management between steps: prune first, compact when
            // pruning has nothing left to give.
            if let Some(usage) = &step_usage {
                if compact::is_overflow(usage, spec) {
                    let report = self.compactor.prune(&session.id)?;
                    if report.pruned == 0 {
                        if !self.config.auto_compact {
                            return Err(SessionError::OverflowError {
                                tokens: usage.context_tokens(),
                                limit: compact::effective_limit(spec),
                            });
                        }
                        self.compactor
                            .compact(
                                session,
                                &agent.name,
                                provider.clone(),
                                assistant.system.clone(),
                                assistant.path.clone(),
                                cancel,
                            )
                            .await?;
                        return Ok(TurnOutcome::Compacted);
                    }
                }
            }

            if !had_tool_calls {
                return Ok(TurnOutcome::Completed);
            }
        }
    }

    /// After an abort, transition any still-pending tool parts of the
    /// message to a terminal `Aborted` error.
    fn abort_pending_parts(&self, message_id: &MessageId) {
        let parts = PartRepo::new(self.db.clone());
        let listed = match parts.list_for_message(message_id) {
            Ok(listed) => listed,
            Err(e) => {
                error!(error = %e, "failed to sweep pending parts after abort");
                return;
            }
        };
        for mut part in listed {
            let PartBody::Tool { state, .. } = &mut part.body else {
                continue;
            };
            let ToolState::Pending { input, .. } = state else {
                continue;
            };
            let now = now_millis();
            *state = ToolState::Error {
                input: input.clone(),
                error: SessionError::Aborted,
                time: ToolTime {
                    start: now,
                    end: now,
                    compacted: None,
                },
            };
            self.put_part(&parts, part);
        }
    }

    fn put_part(&self, parts: &PartRepo, part: Part) {
        if let Err(e) = parts.put(&part) {
            error!(part_id = %part.id, error = %e, "failed to persist part");
        }
        self.bus.publish(BusEvent::MessagePartUpdated { part });
    }

    fn file_times_for(&self, session_id: &SessionId) -> Arc<FileTimes> {
        self.file_times
            .lock()
            .entry(session_id.as_str().to_string())
            .or_insert_with(|| Arc::new(FileTimes::new()))
            .clone()
    }
}

fn last_assistant_usage(
    messages: &MessageRepo,
    session_id: &SessionId,
) -> Result<Option<TokenUsage>, SessionError> {
    let listed = messages.list(session_id)?;
    Ok(listed.iter().rev().find_map(|m| match m {
        Message::Assistant(a) => Some(a.tokens.clone()),
        _ => None,
    }))
}
