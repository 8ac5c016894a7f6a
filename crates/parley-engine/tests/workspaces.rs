// ABOUTME: Integration tests for workspace scoping, topic switching and persistence
// ABOUTME: Sessions belong to one workspace; cached messages survive a new dispatcher

mod common;

use common::{
    dispatcher_in_workspace, dispatcher_with_store, drain, wait_until, Script, ScriptedRuntime,
};
use parley_engine::core::{ExecutionStrategy, MessageStatus, RawMessage, Role, ToolStatus};
use parley_engine::store::TieredStore;
use parley_engine::{Config, EngineError, EngineUpdate};
use serde_json::json;
use std::sync::Arc;

async fn complete_one_turn(
    runtime: &ScriptedRuntime,
    engine: &parley_engine::StreamDispatcher,
    text: &str,
) -> String {
    runtime.script(Script::Closed(vec![
        json!({"type": "text_delta", "text": format!("re: {text}")}),
        json!({"type": "final_done"}),
    ]));
    let handle = engine.send(text, vec![], None).await.unwrap();
    let session_id = handle.session_id.clone();
    handle.wait().await.unwrap();
    session_id
}

#[tokio::test]
async fn test_sessions_are_isolated_per_workspace() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;
    let session_id = complete_one_turn(&runtime, &engine, "hello").await;

    engine.switch_workspace("w2").await.unwrap();
    assert_eq!(engine.workspace_id().as_deref(), Some("w2"));
    assert_eq!(engine.current_session_id(), None);
    assert!(engine.messages().is_empty());
    assert!(engine.list_topics().await.unwrap().is_empty());

    let err = engine.switch_topic(&session_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkspaceConflict { ref owner, .. } if owner == "w1"
    ));

    engine.switch_workspace("w1").await.unwrap();
    assert_eq!(engine.current_session_id(), Some(session_id));
    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "re: hello");
}

#[tokio::test]
async fn test_messages_survive_new_dispatcher() {
    let runtime = ScriptedRuntime::new();
    let store = Arc::new(TieredStore::in_memory());

    let first = dispatcher_with_store(&runtime, store.clone());
    first.switch_workspace("w1").await.unwrap();
    let session_id = complete_one_turn(&runtime, &first, "remember me").await;
    drop(first);

    let second = dispatcher_with_store(&runtime, store);
    second.switch_workspace("w1").await.unwrap();
    assert_eq!(second.current_session_id(), Some(session_id));
    let messages = second.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "remember me");
    assert_eq!(messages[1].status, MessageStatus::Completed);
}

#[tokio::test]
async fn test_claimed_session_recovered_when_pointer_missing() {
    let runtime = ScriptedRuntime::new();
    let store = Arc::new(TieredStore::in_memory());

    let first = dispatcher_with_store(&runtime, store.clone());
    first.switch_workspace("w1").await.unwrap();
    let session_id = complete_one_turn(&runtime, &first, "hi").await;
    first.new_topic().await.unwrap();
    assert_eq!(first.current_session_id(), None);
    drop(first);

    let second = dispatcher_with_store(&runtime, store);
    second.switch_workspace("w1").await.unwrap();
    assert_eq!(second.current_session_id(), Some(session_id));
}

#[tokio::test]
async fn test_switch_topic_rehydrates_from_transcript() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;
    let mut updates = engine.subscribe();

    runtime.add_topic("s9");
    let transcript: Vec<RawMessage> = serde_json::from_value(json!([
        {"id": "u1", "role": "user", "parts": [{"type": "text", "text": "What's 2+2?"}]},
        {"id": "a1", "role": "assistant", "parts": [
            {"type": "text", "text": "Let me check"},
            {"type": "tool_request", "id": "t1", "name": "calc", "arguments": {"expr": "2+2"}}
        ]},
        {"id": "x1", "role": "tool", "parts": [
            {"type": "tool_response", "id": "t1", "output": "4"}
        ]},
        {"id": "a2", "role": "assistant", "parts": [{"type": "text", "text": "It is 4."}]}
    ]))
    .unwrap();
    runtime.set_transcript("s9", transcript);

    engine.switch_topic("s9").await.unwrap();
    assert_eq!(engine.current_session_id().as_deref(), Some("s9"));

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(messages[1].content.starts_with("Let me check"));
    assert!(messages[1].content.ends_with("It is 4."));
    assert_eq!(messages[1].tool_calls.len(), 1);
    assert_eq!(messages[1].tool_calls[0].status, ToolStatus::Completed);

    assert!(drain(&mut updates).iter().any(|u| matches!(
        u,
        EngineUpdate::SessionChanged { session_id: Some(id), .. } if id == "s9"
    )));

    // The topic is now claimed by w1
    engine.switch_workspace("w2").await.unwrap();
    assert!(engine.switch_topic("s9").await.is_err());
}

#[tokio::test]
async fn test_list_topics_hides_other_workspaces() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;
    let owned = complete_one_turn(&runtime, &engine, "mine").await;
    runtime.add_topic("unclaimed");

    engine.switch_workspace("w2").await.unwrap();
    let ids: Vec<String> = engine
        .list_topics()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["unclaimed".to_string()]);

    engine.switch_workspace("w1").await.unwrap();
    let ids: Vec<String> = engine
        .list_topics()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert!(ids.contains(&owned));
}

#[tokio::test]
async fn test_delete_current_topic_clears_it() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;
    let session_id = complete_one_turn(&runtime, &engine, "bye").await;

    engine.delete_topic(&session_id).await.unwrap();
    assert_eq!(engine.current_session_id(), None);
    assert!(engine.messages().is_empty());
    assert_eq!(*runtime.deleted.lock().unwrap(), vec![session_id.clone()]);

    // The claim is released, so another workspace may adopt the id
    engine.switch_workspace("w2").await.unwrap();
    runtime.add_topic(&session_id);
    engine.switch_topic(&session_id).await.unwrap();
}

#[tokio::test]
async fn test_delete_streaming_topic_stops_it_first() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;

    let handle = engine.send("long job", vec![], None).await.unwrap();
    let session_id = handle.session_id.clone();
    engine.delete_topic(&session_id).await.unwrap();

    assert_eq!(handle.wait().await.unwrap(), MessageStatus::Cancelled);
    assert_eq!(*runtime.stops.lock().unwrap(), vec![session_id]);
}

#[tokio::test]
async fn test_rename_topic() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;
    let session_id = complete_one_turn(&runtime, &engine, "hi").await;

    engine.rename_topic(&session_id, "Greetings").await.unwrap();
    let topics = engine.list_topics().await.unwrap();
    assert_eq!(topics[0].title, "Greetings");
}

#[tokio::test]
async fn test_preferences_are_scoped() {
    let runtime = ScriptedRuntime::new();
    let engine = dispatcher_in_workspace(&runtime).await;

    engine
        .set_execution_strategy(ExecutionStrategy::CodeOrchestrated)
        .await
        .unwrap();
    engine.set_model_preference("openai", "gpt-x").await.unwrap();
    let session_id = complete_one_turn(&runtime, &engine, "hi").await;
    assert_eq!(
        runtime.sent()[0].execution_strategy,
        ExecutionStrategy::CodeOrchestrated
    );

    // Topic preference wins over the workspace default once set
    engine.set_model_preference("anthropic", "claude").await.unwrap();
    engine.new_topic().await.unwrap();
    engine.set_model_preference("openai", "gpt-y").await.unwrap();
    engine.switch_topic(&session_id).await.unwrap();
    assert_eq!(engine.model_preference().model.as_deref(), Some("claude"));

    engine.switch_workspace("w2").await.unwrap();
    assert_eq!(engine.execution_strategy(), ExecutionStrategy::React);
    assert!(engine.model_preference().is_empty());
}

#[tokio::test]
async fn test_stream_finishing_in_background_workspace_keeps_reply() {
    let runtime = ScriptedRuntime::new();
    let store = Arc::new(TieredStore::in_memory());
    let engine = dispatcher_with_store(&runtime, store.clone());
    engine.switch_workspace("w1").await.unwrap();

    let handle = engine.send("write it", vec![], None).await.unwrap();
    runtime.push(json!({"type": "text_delta", "text": "part"})).await;
    wait_until(|| engine.messages()[1].content == "part").await;

    engine.switch_workspace("w2").await.unwrap();
    runtime.push(json!({"type": "text_delta", "text": "ial done"})).await;
    runtime.push(json!({"type": "final_done"})).await;
    assert_eq!(handle.wait().await.unwrap(), MessageStatus::Completed);

    engine.switch_workspace("w1").await.unwrap();
    let reply = &engine.messages()[1];
    assert_eq!(reply.content, "partial done");
    assert_eq!(reply.status, MessageStatus::Completed);

    // The cache of w1 was written while w2 was active
    let restarted = dispatcher_with_store(&runtime, store);
    restarted.switch_workspace("w1").await.unwrap();
    let reply = &restarted.messages()[1];
    assert_eq!(reply.content, "partial done");
    assert_eq!(reply.status, MessageStatus::Completed);
}

#[tokio::test]
async fn test_restart_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = Some(dir.path().to_path_buf());
    let runtime = ScriptedRuntime::new();

    let session_id = {
        let store = Arc::new(config.open_store().await.unwrap());
        let engine = dispatcher_with_store(&runtime, store);
        engine.switch_workspace("w1").await.unwrap();
        engine
            .set_execution_strategy(ExecutionStrategy::Auto)
            .await
            .unwrap();
        complete_one_turn(&runtime, &engine, "persist me").await
    };
    assert!(config.db_path().unwrap().exists());

    // Fresh transient tier; everything comes back from the database file
    let store = Arc::new(config.open_store().await.unwrap());
    let engine = dispatcher_with_store(&runtime, store);
    engine.switch_workspace("w1").await.unwrap();
    assert_eq!(engine.current_session_id(), Some(session_id));
    assert_eq!(engine.execution_strategy(), ExecutionStrategy::Auto);
    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "re: persist me");
}
