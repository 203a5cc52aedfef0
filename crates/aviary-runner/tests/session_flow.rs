//! End-to-end session flows against a scripted stub agent.
//!
//! The stub is a shell script speaking the same newline-delimited JSON
//! protocol as the real agent CLI: it reports a canonical session id
//! on init, streams text deltas, raises blocking tool calls, and
//! closes turns with `result` events.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use aviary_protocol::events::{EnvUpdate, SessionEvent};
use aviary_runner::stream::ControlSignal;
use aviary_runner::{
    FsSessionStore, NewSessionConfig, SessionEngineConfig, SessionManager, SessionStore,
};

/// Streams two text deltas, a finalized assistant message, and a
/// successful result for every prompt. Interrupt control lines get an
/// interrupted result instead.
const TEXT_FLOW_SCRIPT: &str = r#"#!/bin/sh
SID=""
RESUME=""
prev=""
for a in "$@"; do
  [ "$prev" = "--session-id" ] && SID="$a"
  [ "$prev" = "--resume" ] && RESUME="$a"
  prev="$a"
done
if [ -n "$RESUME" ]; then CANON="$RESUME"; else CANON="canon-$SID"; fi

while IFS= read -r line; do
  case "$line" in
    *control_request*)
      printf '{"type":"result","subtype":"interrupted","is_error":true,"fatal":false,"session_id":"%s"}\n' "$CANON"
      continue;;
  esac
  printf '{"type":"system","subtype":"init","session_id":"%s","model":"stub-model"}\n' "$CANON"
  printf '{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}},"session_id":"%s"}\n' "$CANON"
  printf '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello "}},"session_id":"%s"}\n' "$CANON"
  printf '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"there"}},"session_id":"%s"}\n' "$CANON"
  printf '{"type":"assistant","message":{"id":"msg_1","model":"stub-model","content":[{"type":"text","text":"Hello there"}],"usage":{"input_tokens":10,"output_tokens":5}},"session_id":"%s"}\n' "$CANON"
  printf '{"type":"result","subtype":"success","is_error":false,"session_id":"%s","num_turns":1,"total_cost_usd":0.001,"usage":{"input_tokens":10,"output_tokens":5},"modelUsage":{"stub-model":{"contextWindow":180000}}}\n' "$CANON"
done
"#;

/// Raises a `request_secret` blocking tool call on the first prompt,
/// then parks waiting for more input.
const BLOCKING_TOOL_SCRIPT: &str = r#"#!/bin/sh
SID=""
prev=""
for a in "$@"; do
  [ "$prev" = "--session-id" ] && SID="$a"
  prev="$a"
done
CANON="canon-$SID"

read -r line
printf '{"type":"system","subtype":"init","session_id":"%s","model":"stub-model"}\n' "$CANON"
printf '{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_s1","name":"request_secret","input":{}}},"session_id":"%s"}\n' "$CANON"
printf '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"key\":\"API_TOKEN\"}"}},"session_id":"%s"}\n' "$CANON"
printf '{"type":"stream_event","event":{"type":"content_block_stop","index":0},"session_id":"%s"}\n' "$CANON"
while IFS= read -r line; do
  :
done
"#;

/// Reports init, then fails the turn fatally.
const FATAL_FLOW_SCRIPT: &str = r#"#!/bin/sh
SID=""
prev=""
for a in "$@"; do
  [ "$prev" = "--session-id" ] && SID="$a"
  prev="$a"
done
CANON="canon-$SID"

read -r line
printf '{"type":"system","subtype":"init","session_id":"%s","model":"stub-model"}\n' "$CANON"
printf '{"type":"result","subtype":"error_during_execution","is_error":true,"fatal":true,"session_id":"%s","result":"provider rejected credentials"}\n' "$CANON"
while IFS= read -r line; do
  :
done
"#;

fn write_stub(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("stub-agent.sh");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn engine(
    dir: &Path,
    script: &str,
) -> (Arc<SessionManager>, mpsc::Receiver<ControlSignal>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let binary = write_stub(dir, script);
    let store = Arc::new(FsSessionStore::new(dir.join("data"))) as Arc<dyn SessionStore>;
    let (control_tx, control_rx) = mpsc::channel(8);
    let config = SessionEngineConfig {
        agent_binary: binary,
        default_cwd: dir.to_path_buf(),
        canonical_id_timeout: Duration::from_secs(5),
        readiness_window: Duration::from_millis(100),
        stop_grace: Duration::from_secs(2),
        input_timeout: Duration::from_secs(300),
        input_sweep_interval: Duration::from_secs(60),
        default_context_window: 200_000,
    };
    (SessionManager::new(config, store, control_tx), control_rx)
}

/// Collect session events until one matches, or panic after the
/// timeout.
async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; saw {seen:?}"))
            .expect("event channel closed");
        let done = matches(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn create_stream_and_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _control_rx) = engine(dir.path(), TEXT_FLOW_SCRIPT);

    let session_id = manager
        .create_session("hi", NewSessionConfig::default())
        .await
        .unwrap();
    assert!(session_id.starts_with("canon-"), "{session_id}");
    assert_eq!(manager.live_session_count().await, 1);

    // Let the first turn finish (its result updates the metadata)
    // before observing the second one, so the delta assertions below
    // see exactly one turn.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let meta = manager.store().load_meta(&session_id).unwrap();
        if meta.is_some_and(|m| m.last_usage.is_some()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "first turn never completed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Second turn observed end to end.
    let mut rx = manager.subscribe(&session_id).await.unwrap();
    manager.send_message(&session_id, "again").await.unwrap();
    let seen = wait_for_event(&mut rx, |e| matches!(e, SessionEvent::Idle)).await;

    let text: String = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::TextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello there");
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::MessagesChanged)));
    // Context window learned from the stub's result metadata.
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::UsageUpdated { usage } if usage.context_window == 180_000
    )));

    // Transcript has the user messages and the finalized assistant
    // messages, never the deltas.
    let events = manager.store().read_events(&session_id).unwrap();
    assert!(events.len() >= 3);

    manager.stop_session(&session_id).await.unwrap();
    assert_eq!(manager.live_session_count().await, 0);

    // Resume from persisted metadata.
    let mut rx = {
        manager.send_message(&session_id, "back again").await.unwrap();
        manager.subscribe(&session_id).await.unwrap()
    };
    assert_eq!(manager.live_session_count().await, 1);
    manager.send_message(&session_id, "one more").await.unwrap();
    wait_for_event(&mut rx, |e| matches!(e, SessionEvent::Idle)).await;

    let meta = manager
        .store()
        .load_meta(&session_id)
        .unwrap()
        .expect("meta persisted");
    assert_eq!(meta.session_id, session_id);
    assert!(meta.last_usage.is_some());

    manager.stop_all().await;
    assert_eq!(manager.live_session_count().await, 0);
}

#[tokio::test]
async fn blocking_tool_raises_pending_input_and_resolution_writes_env() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _control_rx) = engine(dir.path(), BLOCKING_TOOL_SCRIPT);

    let session_id = manager
        .create_session("please fetch my repos", NewSessionConfig::default())
        .await
        .unwrap();

    // The pending request may already have been raised while
    // create_session was returning; poll instead of subscribing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let notice = loop {
        let pending = manager.active_pending(&session_id).await;
        if let Some(notice) = pending.into_iter().next() {
            break notice;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pending input never arrived"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(notice.tool_use_id, "toolu_s1");

    // Secret lands in the env store before the request resolves.
    let update = EnvUpdate {
        key: "API_TOKEN".to_string(),
        value: "sk-test-123".to_string(),
    };
    assert!(manager
        .resolve_secret(&session_id, &notice.tool_use_id, &update)
        .await
        .unwrap());

    let env = manager.store().read_env(&session_id).unwrap();
    assert_eq!(env["API_TOKEN"], "sk-test-123");
    assert!(manager.active_pending(&session_id).await.is_empty());

    // Already resolved: a second answer finds nothing.
    assert!(!manager
        .resolve_input(&session_id, &notice.tool_use_id, serde_json::json!({}))
        .await);

    manager.stop_all().await;
}

#[tokio::test]
async fn fatal_turn_error_requests_container_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut control_rx) = engine(dir.path(), FATAL_FLOW_SCRIPT);

    let session_id = manager
        .create_session("do something doomed", NewSessionConfig::default())
        .await
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(10), control_rx.recv())
        .await
        .expect("timed out waiting for control signal")
        .expect("control channel closed");
    match signal {
        ControlSignal::StopContainer {
            session_id: sid,
            reason,
        } => {
            assert_eq!(sid, session_id);
            assert!(reason.contains("provider rejected credentials"));
        }
    }

    manager.stop_all().await;
}

#[tokio::test]
async fn interrupt_flags_live_session_only() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _control_rx) = engine(dir.path(), TEXT_FLOW_SCRIPT);

    let session_id = manager
        .create_session("hi", NewSessionConfig::default())
        .await
        .unwrap();
    assert!(manager.interrupt(&session_id).await);
    assert!(!manager.interrupt("no-such-session").await);

    manager.stop_all().await;
}
