// ABOUTME: Scripted AgentRuntime double shared by the engine integration tests
// ABOUTME: Replays canned event scripts and records every call the engine makes

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parley_engine::core::{ExecutionStrategy, RawMessage, Topic};
use parley_engine::store::TieredStore;
use parley_engine::{
    AgentRuntime, EngineConfig, EngineUpdate, OutboundMessage, RuntimeError, StreamDispatcher,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, mpsc};

/// What the runtime does with the next submitted message
pub enum Script {
    /// Deliver the events, then close the channel
    Closed(Vec<Value>),
    /// Deliver the events and keep the channel open for `push`
    Open(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub session_id: String,
    pub request_id: String,
    pub approved: bool,
    pub reason: String,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<VecDeque<Script>>,
    open: Mutex<Option<mpsc::Sender<Value>>>,
    next_session: AtomicUsize,
    pub fail_send: AtomicBool,
    pub fail_confirm: AtomicBool,
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub confirmations: Mutex<Vec<Confirmation>>,
    pub elicitations: Mutex<Vec<(String, String, Value)>>,
    pub stops: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub topics: Mutex<Vec<Topic>>,
    pub transcripts: Mutex<HashMap<String, Vec<RawMessage>>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Push an event into the currently open stream.
    /// Returns false when the engine no longer listens on it.
    pub async fn push(&self, event: Value) -> bool {
        let sender = self.open.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Close the currently open stream without a terminal event
    pub fn close(&self) {
        self.open.lock().unwrap().take();
    }

    pub fn set_transcript(&self, session_id: &str, transcript: Vec<RawMessage>) {
        self.transcripts
            .lock()
            .unwrap()
            .insert(session_id.to_string(), transcript);
    }

    pub fn add_topic(&self, id: &str) {
        let mut topics = self.topics.lock().unwrap();
        let age = topics.len() as i64;
        topics.push(Topic {
            id: id.to_string(),
            title: format!("Topic {id}"),
            created_at: Utc::now() + Duration::seconds(age),
            messages_count: 0,
            execution_strategy: ExecutionStrategy::default(),
        });
    }

    pub fn confirmations(&self) -> Vec<Confirmation> {
        self.confirmations.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_session(
        &self,
        _workspace_id: &str,
        _strategy: ExecutionStrategy,
    ) -> Result<Topic, RuntimeError> {
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("s{n}");
        self.add_topic(&id);
        let topic = self
            .topics
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned();
        topic.ok_or_else(|| RuntimeError::Unavailable("topic vanished".into()))
    }

    async fn send_message(
        &self,
        message: OutboundMessage,
        events: mpsc::Sender<Value>,
    ) -> Result<(), RuntimeError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("connection refused".into()));
        }
        self.sent.lock().unwrap().push(message);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Open(Vec::new()));
        let (script_events, keep_open) = match script {
            Script::Closed(events) => (events, false),
            Script::Open(events) => (events, true),
        };
        for event in script_events {
            let _ = events.send(event).await;
        }
        if keep_open {
            *self.open.lock().unwrap() = Some(events);
        }
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        // The sender stays open: a runtime may keep emitting after a stop
        self.stops.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn confirm_action(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        if self.fail_confirm.load(Ordering::SeqCst) {
            return Err(RuntimeError::Rejected("request expired".into()));
        }
        self.confirmations.lock().unwrap().push(Confirmation {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            approved,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn submit_elicitation(
        &self,
        session_id: &str,
        request_id: &str,
        response: Value,
    ) -> Result<(), RuntimeError> {
        if self.fail_confirm.load(Ordering::SeqCst) {
            return Err(RuntimeError::Rejected("request expired".into()));
        }
        self.elicitations.lock().unwrap().push((
            session_id.to_string(),
            request_id.to_string(),
            response,
        ));
        Ok(())
    }

    async fn list_sessions(&self, _workspace_id: &str) -> Result<Vec<Topic>, RuntimeError> {
        Ok(self.topics.lock().unwrap().clone())
    }

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), RuntimeError> {
        let mut topics = self.topics.lock().unwrap();
        let topic = topics
            .iter_mut()
            .find(|t| t.id == session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.to_string()))?;
        topic.title = title.to_string();
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        self.topics.lock().unwrap().retain(|t| t.id != session_id);
        self.deleted.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn get_transcript(&self, session_id: &str) -> Result<Vec<RawMessage>, RuntimeError> {
        Ok(self
            .transcripts
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Dispatcher over an in-memory store, not yet bound to a workspace
pub fn dispatcher(runtime: &Arc<ScriptedRuntime>) -> StreamDispatcher {
    dispatcher_with_store(runtime, Arc::new(TieredStore::in_memory()))
}

pub fn dispatcher_with_store(
    runtime: &Arc<ScriptedRuntime>,
    store: Arc<TieredStore>,
) -> StreamDispatcher {
    let runtime: Arc<dyn AgentRuntime> = runtime.clone();
    StreamDispatcher::new(runtime, store, EngineConfig::default()).unwrap()
}

/// Dispatcher bound to workspace `w1`
pub async fn dispatcher_in_workspace(runtime: &Arc<ScriptedRuntime>) -> StreamDispatcher {
    let engine = dispatcher(runtime);
    engine.switch_workspace("w1").await.unwrap();
    engine
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(StdDuration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Every update currently buffered in `rx`
pub fn drain(rx: &mut broadcast::Receiver<EngineUpdate>) -> Vec<EngineUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}
