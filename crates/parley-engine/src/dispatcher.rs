// ABOUTME: StreamDispatcher: per-session state machine between the UI and the agent runtime
// ABOUTME: One active stream per session, events folded in order, confirmations applied after the runtime answers

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runtime::{AgentRuntime, OutboundMessage};
use crate::updates::{EngineUpdate, Notice, NoticeLevel, StreamHandle, StreamProgress};
use futures::Stream;
use parley_core::actions::{confirmation_payload, should_auto_confirm, submission_text};
use parley_core::{
    normalize, ActionRegistry, ActionRequired, ActionType, ExecutionStrategy, Fold,
    ImageAttachment, Message, MessageAccumulator, MessageStatus, PendingAction, Registration,
    StreamEvent, Topic,
};
use parley_store::{ModelPreference, PreferenceStore, SessionStore, TieredStore};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const UPDATE_CHANNEL_CAPACITY: usize = 512;
const RATE_LIMIT_CODE: &str = "rate_limit";

/// Answer to a pending action
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmResponse {
    pub request_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Approve or deny a tool confirmation
    Approve { approved: bool, reason: String },
    /// Answer an ask_user question or an elicitation
    Answer(Answer),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    Structured(Value),
}

/// Registration of the stream currently feeding a session
struct ActiveStream {
    message_id: String,
    cancel: CancellationToken,
    progress: watch::Sender<StreamProgress>,
}

/// Live state of one session
struct SessionState {
    workspace_id: String,
    messages: Vec<Message>,
    actions: ActionRegistry,
    active: Option<ActiveStream>,
    /// Strategy of the most recent send; decides auto-confirmation
    strategy: ExecutionStrategy,
}

impl SessionState {
    fn new(workspace_id: String, messages: Vec<Message>, ask_pattern: &Regex) -> Self {
        Self {
            workspace_id,
            messages,
            actions: ActionRegistry::new(ask_pattern.clone()),
            active: None,
            strategy: ExecutionStrategy::default(),
        }
    }

    fn is_active(&self, message_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.message_id == message_id && !a.cancel.is_cancelled())
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

/// Engine state, read and written under one lock
struct EngineState {
    workspace_id: Option<String>,
    current_session: Option<String>,
    strategy: ExecutionStrategy,
    model: ModelPreference,
    sessions: HashMap<String, SessionState>,
}

struct Inner {
    runtime: Arc<dyn AgentRuntime>,
    sessions: SessionStore,
    preferences: PreferenceStore,
    config: EngineConfig,
    ask_pattern: Regex,
    state: Mutex<EngineState>,
    updates: broadcast::Sender<EngineUpdate>,
}

/// What the consumer does after an event
enum Next {
    Continue,
    AutoConfirm(ActionRequired),
    /// Terminal event; the handle resolves once the cache is written
    Finished(watch::Sender<StreamProgress>, StreamProgress),
    Detached,
}

/// Top-level engine object
///
/// Cheap to clone; clones share state. Construct one per process and hand it
/// the runtime and stores it should use.
#[derive(Clone)]
pub struct StreamDispatcher {
    inner: Arc<Inner>,
}

impl StreamDispatcher {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<TieredStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let ask_pattern = Regex::new(&config.ask_tool_pattern)
            .map_err(|e| EngineError::Config(format!("Invalid ask_tool_pattern: {}", e)))?;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                sessions: SessionStore::new(store.clone()),
                preferences: PreferenceStore::new(store),
                state: Mutex::new(EngineState {
                    workspace_id: None,
                    current_session: None,
                    strategy: config.default_execution_strategy,
                    model: ModelPreference::default(),
                    sessions: HashMap::new(),
                }),
                ask_pattern,
                config,
                updates,
            }),
        })
    }

    // =========================================================================
    // Updates & accessors
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.inner.updates.subscribe()
    }

    /// Updates as a stream; updates missed by a lagging reader are skipped
    pub fn update_stream(&self) -> impl Stream<Item = EngineUpdate> {
        BroadcastStream::new(self.subscribe()).filter_map(|update| update.ok())
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.inner.state().workspace_id.clone()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner.state().current_session.clone()
    }

    pub fn execution_strategy(&self) -> ExecutionStrategy {
        self.inner.state().strategy
    }

    pub fn model_preference(&self) -> ModelPreference {
        self.inner.state().model.clone()
    }

    /// Messages of the current session
    pub fn messages(&self) -> Vec<Message> {
        let state = self.inner.state();
        state
            .current_session
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Unanswered actions of the current session
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        let state = self.inner.state();
        state
            .current_session
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .map(|s| s.actions.pending().to_vec())
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.inner
            .state()
            .sessions
            .get(session_id)
            .is_some_and(|s| s.active.is_some())
    }

    // =========================================================================
    // Workspaces & topics
    // =========================================================================

    /// Make `workspace_id` active and restore its session and cached messages
    pub async fn switch_workspace(&self, workspace_id: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.state().workspace_id.as_deref() == Some(workspace_id) {
            return Ok(());
        }
        inner.persist_current().await;
        inner.sessions.migrate_legacy(workspace_id).await?;

        let mut current = inner.sessions.current_session(workspace_id).await?;
        if current.is_none() {
            current = inner.recover_claimed_session(workspace_id).await?;
        }
        let messages = match &current {
            Some(_) => inner
                .sessions
                .load_messages(workspace_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(workspace_id, error = %e, "discarding unreadable message cache");
                    Vec::new()
                }),
            None => Vec::new(),
        };
        let strategy = inner
            .preferences
            .execution_strategy(workspace_id)
            .await?
            .unwrap_or(inner.config.default_execution_strategy);
        let model = inner
            .preferences
            .resolve_for_topic(workspace_id, current.as_deref())
            .await?;

        {
            let mut state = inner.state();
            state.workspace_id = Some(workspace_id.to_string());
            state.current_session = current.clone();
            state.strategy = strategy;
            state.model = model;
            if let Some(id) = &current {
                // A session still in memory is newer than its cache
                state.sessions.entry(id.clone()).or_insert_with(|| {
                    SessionState::new(workspace_id.to_string(), messages, &inner.ask_pattern)
                });
            }
        }

        tracing::info!(workspace_id, session_id = ?current, "workspace switched");
        inner.emit(EngineUpdate::SessionChanged {
            workspace_id: workspace_id.to_string(),
            session_id: current,
        });
        Ok(())
    }

    /// Open an existing topic, rehydrating it from the runtime's transcript
    pub async fn switch_topic(&self, session_id: &str) -> Result<()> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        inner.sessions.claim(session_id, &workspace_id).await?;
        inner.persist_current().await;

        let live = inner
            .state()
            .sessions
            .get(session_id)
            .is_some_and(|s| s.active.is_some());
        let messages = if live {
            None
        } else {
            let transcript = inner.runtime.get_transcript(session_id).await?;
            Some(normalize(&transcript))
        };
        let model = inner
            .preferences
            .resolve_for_topic(&workspace_id, Some(session_id))
            .await?;

        {
            let mut state = inner.state();
            if let Some(messages) = messages {
                // Replaced, not merged: the transcript is the source of truth
                state.sessions.insert(
                    session_id.to_string(),
                    SessionState::new(workspace_id.clone(), messages, &inner.ask_pattern),
                );
            }
            state.current_session = Some(session_id.to_string());
            state.model = model;
        }

        inner
            .sessions
            .set_current_session(&workspace_id, Some(session_id))
            .await?;
        inner.persist_current().await;

        inner.emit(EngineUpdate::SessionChanged {
            workspace_id,
            session_id: Some(session_id.to_string()),
        });
        inner.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Leave the current topic; the next `send` creates a new one
    pub async fn new_topic(&self) -> Result<()> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        inner.persist_current().await;

        let model = inner.preferences.workspace_preference(&workspace_id).await?;
        {
            let mut state = inner.state();
            state.current_session = None;
            state.model = model;
        }
        inner.sessions.set_current_session(&workspace_id, None).await?;
        inner.sessions.clear_messages(&workspace_id).await?;

        inner.emit(EngineUpdate::SessionChanged {
            workspace_id,
            session_id: None,
        });
        Ok(())
    }

    /// Topics of the active workspace; sessions claimed elsewhere are hidden
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        let topics = inner.runtime.list_sessions(&workspace_id).await?;

        let mut visible = Vec::with_capacity(topics.len());
        for topic in topics {
            match inner.sessions.owner(&topic.id).await? {
                Some(owner) if owner != workspace_id => {
                    tracing::debug!(session_id = %topic.id, %owner, "hiding topic of another workspace");
                }
                _ => visible.push(topic),
            }
        }
        Ok(visible)
    }

    pub async fn rename_topic(&self, session_id: &str, title: &str) -> Result<()> {
        self.inner.require_workspace()?;
        self.inner.runtime.rename_session(session_id, title).await?;
        Ok(())
    }

    pub async fn delete_topic(&self, session_id: &str) -> Result<()> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        if self.is_streaming(session_id) {
            self.stop(session_id).await?;
        }
        inner.runtime.delete_session(session_id).await?;
        inner.sessions.release(session_id).await?;
        inner
            .preferences
            .remove_topic_preference(&workspace_id, session_id)
            .await?;

        let was_current = {
            let mut state = inner.state();
            state.sessions.remove(session_id);
            let was_current = state.current_session.as_deref() == Some(session_id);
            if was_current {
                state.current_session = None;
            }
            was_current
        };
        if was_current {
            inner.sessions.set_current_session(&workspace_id, None).await?;
            inner.sessions.clear_messages(&workspace_id).await?;
            inner.emit(EngineUpdate::SessionChanged {
                workspace_id,
                session_id: None,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    /// Record the provider/model for the workspace and the current topic
    pub async fn set_model_preference(&self, provider: &str, model: &str) -> Result<()> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        let preference = ModelPreference::new(provider, model);

        inner
            .preferences
            .set_workspace_preference(&workspace_id, &preference)
            .await?;
        let current = inner.state().current_session.clone();
        if let Some(session_id) = current {
            inner
                .preferences
                .set_topic_preference(&workspace_id, &session_id, &preference)
                .await?;
        }
        inner.state().model = preference;
        Ok(())
    }

    pub async fn set_execution_strategy(&self, strategy: ExecutionStrategy) -> Result<()> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        inner
            .preferences
            .set_execution_strategy(&workspace_id, strategy)
            .await?;
        inner.state().strategy = strategy;
        Ok(())
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Send a user message and start streaming the reply.
    ///
    /// The user message and an empty assistant placeholder are in the
    /// message list before the runtime is contacted. Fails with
    /// `AlreadyStreaming` while the session has an active stream.
    pub async fn send(
        &self,
        text: &str,
        images: Vec<ImageAttachment>,
        strategy: Option<ExecutionStrategy>,
    ) -> Result<StreamHandle> {
        let inner = &self.inner;
        let workspace_id = inner.require_workspace()?;
        let (current, default_strategy, model) = {
            let state = inner.state();
            (state.current_session.clone(), state.strategy, state.model.clone())
        };
        let strategy = strategy.unwrap_or(default_strategy);

        let session_id = match current {
            Some(id) => id,
            None => inner.create_session(&workspace_id, strategy).await?,
        };

        let user = Message::user(text.to_string(), images.clone());
        let placeholder = Message::assistant_placeholder();
        let message_id = placeholder.id.clone();
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(StreamProgress::pending());
        let (events_tx, events_rx) = mpsc::channel(inner.config.event_channel_capacity.max(1));

        {
            let mut state = inner.state();
            let session = state
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    SessionState::new(workspace_id.clone(), Vec::new(), &inner.ask_pattern)
                });
            if session.active.is_some() {
                return Err(EngineError::AlreadyStreaming);
            }
            session.strategy = strategy;
            session.messages.push(user);
            session.messages.push(placeholder);
            session.active = Some(ActiveStream {
                message_id: message_id.clone(),
                cancel: cancel.clone(),
                progress: progress_tx,
            });
        }
        inner.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.clone(),
        });
        inner.emit(EngineUpdate::StreamPhaseChanged {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            phase: MessageStatus::Pending,
        });

        // Listener is attached before the runtime sees the message
        tokio::spawn(Inner::consume(
            inner.clone(),
            session_id.clone(),
            message_id.clone(),
            events_rx,
            cancel,
        ));

        let outbound = OutboundMessage {
            session_id: session_id.clone(),
            channel_key: message_id.clone(),
            text: text.to_string(),
            images,
            provider: model.provider,
            model: model.model,
            execution_strategy: strategy,
        };
        // Held until the runtime answers so the consumer cannot mistake a
        // failed submission for a cleanly closed stream
        let send_guard = events_tx.clone();
        let sent = inner.runtime.send_message(outbound, events_tx).await;

        if let Err(e) = sent {
            tracing::warn!(%session_id, error = %e, "send_message failed");
            inner.abort_send(&session_id, &message_id, &e.to_string());
            drop(send_guard);
            return Err(EngineError::Transport(e));
        }
        drop(send_guard);

        Ok(StreamHandle::new(session_id, message_id, progress_rx))
    }

    /// Cancel the active stream of a session.
    ///
    /// The listener is detached immediately; events still in flight for the
    /// message are ignored. Returns whether a stream was stopped.
    pub async fn stop(&self, session_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let stopped = {
            let mut state = inner.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Ok(false);
            };
            let Some(active) = session.active.take() else {
                return Ok(false);
            };
            active.cancel.cancel();
            if let Some(message) = session.message_mut(&active.message_id) {
                message.status = MessageStatus::Cancelled;
                message.is_thinking = false;
            }
            let dropped = session.actions.discard_for_message(&active.message_id);
            if !dropped.is_empty() {
                tracing::debug!(session_id, count = dropped.len(), "pending actions discarded");
            }
            active.progress.send_replace(StreamProgress {
                status: MessageStatus::Cancelled,
                error: None,
            });
            active.message_id
        };

        inner.emit(EngineUpdate::StreamPhaseChanged {
            session_id: session_id.to_string(),
            message_id: stopped,
            phase: MessageStatus::Cancelled,
        });
        inner.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.to_string(),
        });
        inner.emit(EngineUpdate::ActionsChanged {
            session_id: session_id.to_string(),
        });

        if let Err(e) = inner.runtime.stop_session(session_id).await {
            tracing::warn!(session_id, error = %e, "runtime stop failed");
        }
        inner.persist_session(session_id).await;
        Ok(true)
    }

    /// Answer a pending action.
    ///
    /// The action is marked submitted only after the runtime accepted the
    /// answer; on failure nothing changes.
    pub async fn confirm(&self, response: ConfirmResponse) -> Result<()> {
        let inner = &self.inner;
        let request_id = response.request_id.as_str();
        let (session_id, action) = inner
            .find_pending(request_id)
            .ok_or_else(|| EngineError::ActionNotFound(request_id.to_string()))?;
        if action.is_fallback {
            return Err(EngineError::FallbackAction(request_id.to_string()));
        }

        let result = match (action.action_type, &response.decision) {
            (ActionType::ToolConfirmation, Decision::Approve { approved, reason }) => {
                let user_data = confirmation_payload(*approved, reason);
                inner
                    .runtime
                    .confirm_action(&session_id, request_id, *approved, reason)
                    .await
                    .map(|_| user_data)
            }
            (ActionType::ToolConfirmation, Decision::Answer(_)) => {
                return Err(EngineError::InvalidResponse(format!(
                    "{request_id} is a tool confirmation and needs approve or deny"
                )));
            }
            (_, decision) => {
                let user_data = match decision {
                    Decision::Answer(Answer::Text(text)) => Value::String(text.clone()),
                    Decision::Answer(Answer::Structured(value)) => value.clone(),
                    Decision::Approve { approved, reason } => {
                        confirmation_payload(*approved, reason)
                    }
                };
                inner
                    .runtime
                    .submit_elicitation(&session_id, request_id, user_data.clone())
                    .await
                    .map(|_| user_data)
            }
        };

        let user_data = match result {
            Ok(user_data) => user_data,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "confirmation failed");
                inner.notice(
                    NoticeLevel::Error,
                    Some(&session_id),
                    format!("Could not submit answer: {}", e),
                );
                return Err(EngineError::Confirmation {
                    request_id: request_id.to_string(),
                    source: e,
                });
            }
        };

        {
            let mut state = inner.state();
            if let Some(session) = state.sessions.get_mut(&session_id) {
                let text = submission_text(&action, &user_data);
                session
                    .actions
                    .submit(&mut session.messages, request_id, text, user_data);
            }
        }
        inner.emit(EngineUpdate::ActionsChanged {
            session_id: session_id.clone(),
        });
        inner.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.clone(),
        });
        inner.persist_session(&session_id).await;
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("lock poisoned")
    }

    fn emit(&self, update: EngineUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    fn notice(&self, level: NoticeLevel, session_id: Option<&str>, message: String) {
        self.emit(EngineUpdate::Notice(Notice {
            level,
            session_id: session_id.map(String::from),
            message,
        }));
    }

    fn require_workspace(&self) -> Result<String> {
        self.state()
            .workspace_id
            .clone()
            .ok_or(EngineError::WorkspaceMissing)
    }

    fn find_pending(&self, request_id: &str) -> Option<(String, ActionRequired)> {
        let state = self.state();
        state.sessions.iter().find_map(|(id, session)| {
            session
                .actions
                .get(request_id)
                .map(|p| (id.clone(), p.action.clone()))
        })
    }

    async fn create_session(&self, workspace_id: &str, strategy: ExecutionStrategy) -> Result<String> {
        let topic = self.runtime.create_session(workspace_id, strategy).await?;
        self.sessions.claim(&topic.id, workspace_id).await?;
        self.sessions
            .set_current_session(workspace_id, Some(&topic.id))
            .await?;

        {
            let mut state = self.state();
            state.current_session = Some(topic.id.clone());
            state
                .sessions
                .entry(topic.id.clone())
                .or_insert_with(|| {
                    SessionState::new(workspace_id.to_string(), Vec::new(), &self.ask_pattern)
                });
        }
        let model = self.state().model.clone();
        if !model.is_empty() {
            self.preferences
                .set_topic_preference(workspace_id, &topic.id, &model)
                .await?;
        }

        tracing::info!(workspace_id, session_id = %topic.id, "session created");
        self.emit(EngineUpdate::SessionChanged {
            workspace_id: workspace_id.to_string(),
            session_id: Some(topic.id.clone()),
        });
        Ok(topic.id)
    }

    /// Most recent runtime session already claimed by this workspace
    async fn recover_claimed_session(&self, workspace_id: &str) -> Result<Option<String>> {
        let topics = match self.runtime.list_sessions(workspace_id).await {
            Ok(topics) => topics,
            Err(e) => {
                tracing::warn!(workspace_id, error = %e, "could not list sessions");
                return Ok(None);
            }
        };
        let found = self
            .sessions
            .find_claimed_session(workspace_id, &topics)
            .await?;
        if let Some(id) = &found {
            self.sessions
                .set_current_session(workspace_id, Some(id))
                .await?;
        }
        Ok(found)
    }

    /// Undo a send whose message never reached the runtime
    fn abort_send(&self, session_id: &str, message_id: &str, error: &str) {
        {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            let owned = session
                .active
                .as_ref()
                .is_some_and(|a| a.message_id == message_id);
            if let Some(active) = owned.then(|| session.active.take()).flatten() {
                active.cancel.cancel();
                active.progress.send_replace(StreamProgress {
                    status: MessageStatus::Failed,
                    error: Some(error.to_string()),
                });
            }
            session.messages.retain(|m| m.id != message_id);
        }
        self.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.to_string(),
        });
        self.notice(
            NoticeLevel::Error,
            Some(session_id),
            format!("Message not sent: {}", error),
        );
    }

    /// Drain one message's event channel until a terminal event, cancellation or close
    async fn consume(
        inner: Arc<Inner>,
        session_id: String,
        message_id: String,
        mut events: mpsc::Receiver<Value>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                event = events.recv() => {
                    let next = match event {
                        Some(raw) => inner.handle_event(&session_id, &message_id, raw),
                        // Channel closed without a terminal event
                        None => inner.finish_stream(&session_id, &message_id, MessageStatus::Completed, None),
                    };
                    match next {
                        Next::Continue => {}
                        Next::AutoConfirm(action) => {
                            tokio::spawn(Inner::auto_confirm(
                                inner.clone(),
                                session_id.clone(),
                                message_id.clone(),
                                action,
                            ));
                        }
                        Next::Finished(progress, outcome) => {
                            inner.persist_session(&session_id).await;
                            progress.send_replace(outcome);
                            break;
                        }
                        Next::Detached => break,
                    }
                }
            }
        }
        tracing::debug!(%session_id, %message_id, "stream listener detached");
    }

    fn handle_event(&self, session_id: &str, message_id: &str, raw: Value) -> Next {
        let event = match StreamEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "dropping unparseable event");
                return Next::Continue;
            }
        };

        match event {
            StreamEvent::FinalDone => {
                return self.finish_stream(session_id, message_id, MessageStatus::Completed, None);
            }
            StreamEvent::Error { message } => {
                if self.config.is_rate_limited(&message) {
                    self.notice(NoticeLevel::RateLimited, Some(session_id), message);
                    return self.finish_stream(session_id, message_id, MessageStatus::Completed, None);
                }
                tracing::warn!(session_id, error = %message, "stream failed");
                self.notice(NoticeLevel::Error, Some(session_id), message.clone());
                return self.finish_stream(session_id, message_id, MessageStatus::Failed, Some(message));
            }
            StreamEvent::Warning { code, message } => {
                if !self.mark_streaming(session_id, message_id) {
                    return Next::Detached;
                }
                let level = if code.as_deref() == Some(RATE_LIMIT_CODE)
                    || self.config.is_rate_limited(&message)
                {
                    NoticeLevel::RateLimited
                } else {
                    NoticeLevel::Warning
                };
                self.notice(level, Some(session_id), message);
                return Next::Continue;
            }
            _ => {}
        }

        let mut next = Next::Continue;
        let mut actions_changed = false;
        let mut messages_changed = false;
        {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Next::Detached;
            };
            if !session.is_active(message_id) {
                tracing::debug!(session_id, message_id, "event for detached stream ignored");
                return Next::Detached;
            }
            let strategy = session.strategy;
            let SessionState {
                messages, actions, ..
            } = session;
            let Some(index) = messages.iter().position(|m| m.id == message_id) else {
                return Next::Detached;
            };

            match &event {
                StreamEvent::ActionRequired(request) => {
                    let action = request.clone().into_action();
                    messages[index].is_thinking = false;
                    messages_changed = true;
                    if should_auto_confirm(strategy, &action) {
                        next = Next::AutoConfirm(action);
                    } else {
                        let outcome = actions.register(messages, message_id, action);
                        actions_changed = outcome != Registration::Skipped;
                    }
                }
                event => {
                    let fold = MessageAccumulator::new(&mut messages[index]).fold(event);
                    messages_changed = fold == Fold::Applied;

                    // Only a first sighting of the tool may ask the user
                    if let (Fold::Applied, StreamEvent::ToolStart {
                        tool_id,
                        tool_name,
                        arguments,
                    }) = (fold, event)
                    {
                        if let Some(fallback) =
                            actions.fallback_for_tool(tool_id, tool_name, arguments)
                        {
                            let outcome = actions.register(messages, message_id, fallback);
                            actions_changed = outcome != Registration::Skipped;
                            messages_changed |= actions_changed;
                        }
                    }
                }
            }
        }

        self.mark_streaming(session_id, message_id);
        if messages_changed {
            self.emit(EngineUpdate::MessagesChanged {
                session_id: session_id.to_string(),
            });
        }
        if actions_changed {
            self.emit(EngineUpdate::ActionsChanged {
                session_id: session_id.to_string(),
            });
        }
        next
    }

    /// Enter `Streaming` on the first event; false if the stream is detached
    fn mark_streaming(&self, session_id: &str, message_id: &str) -> bool {
        let changed = {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return false;
            };
            if !session.is_active(message_id) {
                return false;
            }
            let Some(message) = session.message_mut(message_id) else {
                return false;
            };
            if message.status != MessageStatus::Pending {
                return true;
            }
            message.status = MessageStatus::Streaming;
            if let Some(active) = &session.active {
                active.progress.send_replace(StreamProgress {
                    status: MessageStatus::Streaming,
                    error: None,
                });
            }
            true
        };
        if changed {
            self.emit(EngineUpdate::StreamPhaseChanged {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                phase: MessageStatus::Streaming,
            });
        }
        true
    }

    fn finish_stream(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Next {
        let progress = {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Next::Detached;
            };
            if !session.is_active(message_id) {
                return Next::Detached;
            }
            let Some(active) = session.active.take() else {
                return Next::Detached;
            };
            if let Some(message) = session.message_mut(message_id) {
                message.status = status;
                message.is_thinking = false;
                message.error = error.clone();
            }
            active.progress
        };

        tracing::debug!(session_id, message_id, ?status, "stream finished");
        self.emit(EngineUpdate::StreamPhaseChanged {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            phase: status,
        });
        self.emit(EngineUpdate::MessagesChanged {
            session_id: session_id.to_string(),
        });
        Next::Finished(progress, StreamProgress { status, error })
    }

    /// Confirm a tool call under the auto strategy; on failure show it to the user
    async fn auto_confirm(
        inner: Arc<Inner>,
        session_id: String,
        message_id: String,
        action: ActionRequired,
    ) {
        let reason = inner.config.auto_confirm_reason.clone();
        let result = inner
            .runtime
            .confirm_action(&session_id, &action.request_id, true, &reason)
            .await;
        let error = match result {
            Ok(()) => {
                tracing::debug!(%session_id, request_id = %action.request_id, "auto-confirmed");
                return;
            }
            Err(e) => e,
        };

        tracing::warn!(%session_id, request_id = %action.request_id, error = %error, "auto-confirm failed");
        let registered = {
            let mut state = inner.state();
            match state.sessions.get_mut(&session_id) {
                Some(session)
                    if session
                        .messages
                        .iter()
                        .any(|m| m.id == message_id && m.status != MessageStatus::Cancelled) =>
                {
                    let SessionState {
                        messages, actions, ..
                    } = session;
                    actions.register(messages, &message_id, action);
                    true
                }
                _ => false,
            }
        };
        if registered {
            inner.emit(EngineUpdate::ActionsChanged {
                session_id: session_id.clone(),
            });
            inner.emit(EngineUpdate::MessagesChanged {
                session_id: session_id.clone(),
            });
        }
        inner.notice(
            NoticeLevel::Warning,
            Some(&session_id),
            format!("Automatic approval failed, please confirm manually: {}", error),
        );
    }

    /// Persist the current session's messages into its workspace cache
    async fn persist_current(&self) {
        let current = self.state().current_session.clone();
        if let Some(session_id) = current {
            self.persist_session(&session_id).await;
        }
    }

    /// Persist `session_id`'s messages if it is its workspace's current session
    async fn persist_session(&self, session_id: &str) {
        let owner = {
            let state = self.state();
            state.sessions.get(session_id).map(|s| s.workspace_id.clone())
        };
        let Some(workspace_id) = owner else {
            return;
        };
        match self.sessions.current_session(&workspace_id).await {
            Ok(Some(current)) if current == session_id => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(%workspace_id, session_id, error = %e, "could not read current session");
                return;
            }
        }
        // Snapshot after the lookup so the newest messages are written
        let snapshot = {
            let state = self.state();
            state.sessions.get(session_id).map(|s| s.messages.clone())
        };
        let Some(messages) = snapshot else {
            return;
        };
        if let Err(e) = self.sessions.save_messages(&workspace_id, &messages).await {
            tracing::warn!(%workspace_id, session_id, error = %e, "failed to cache messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeError;
    use parley_core::Role;

    fn session_with_stream(message_id: &str) -> SessionState {
        let mut session = SessionState::new("w1".into(), Vec::new(), &Regex::new("^ask").unwrap());
        let mut placeholder = Message::assistant_placeholder();
        placeholder.id = message_id.into();
        session.messages.push(placeholder);
        let (progress, _) = watch::channel(StreamProgress::pending());
        session.active = Some(ActiveStream {
            message_id: message_id.into(),
            cancel: CancellationToken::new(),
            progress,
        });
        session
    }

    #[test]
    fn test_is_active_tracks_registration_and_cancellation() {
        let session = session_with_stream("m1");
        assert!(session.is_active("m1"));
        assert!(!session.is_active("m2"));

        if let Some(active) = &session.active {
            active.cancel.cancel();
        }
        assert!(!session.is_active("m1"));
    }

    /// Runtime that refuses everything; enough for driving events by hand
    struct Offline;

    #[async_trait::async_trait]
    impl AgentRuntime for Offline {
        async fn create_session(&self, _: &str, _: ExecutionStrategy) -> std::result::Result<Topic, RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn send_message(&self, _: OutboundMessage, _: mpsc::Sender<Value>) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn stop_session(&self, _: &str) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn confirm_action(&self, _: &str, _: &str, _: bool, _: &str) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn submit_elicitation(&self, _: &str, _: &str, _: Value) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn list_sessions(&self, _: &str) -> std::result::Result<Vec<Topic>, RuntimeError> {
            Ok(Vec::new())
        }
        async fn rename_session(&self, _: &str, _: &str) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn delete_session(&self, _: &str) -> std::result::Result<(), RuntimeError> {
            Err(RuntimeError::Unavailable("offline".into()))
        }
        async fn get_transcript(&self, _: &str) -> std::result::Result<Vec<parley_core::RawMessage>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    fn offline_dispatcher() -> StreamDispatcher {
        StreamDispatcher::new(
            Arc::new(Offline),
            Arc::new(TieredStore::in_memory()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_events_after_stop_are_ignored() {
        let engine = offline_dispatcher();
        let inner = &engine.inner;
        inner
            .state()
            .sessions
            .insert("s1".into(), session_with_stream("m1"));

        let text = |t: &str| serde_json::json!({"type": "text_delta", "text": t});
        assert!(matches!(inner.handle_event("s1", "m1", text("partial")), Next::Continue));

        assert!(engine.stop("s1").await.unwrap());
        assert!(matches!(inner.handle_event("s1", "m1", text(" late")), Next::Detached));
        assert!(matches!(
            inner.handle_event("s1", "m1", serde_json::json!({"type": "final_done"})),
            Next::Detached
        ));

        let state = inner.state();
        let message = &state.sessions["s1"].messages[0];
        assert_eq!(message.content, "partial");
        assert_eq!(message.status, MessageStatus::Cancelled);
    }

    #[test]
    fn test_session_state_uses_given_ask_pattern() {
        let session = session_with_stream("m1");
        assert!(session.actions.is_ask_tool("ask_anything"));
        assert!(!session.actions.is_ask_tool("user_ask"));
        assert_eq!(session.messages[0].role, Role::Assistant);
    }
}
