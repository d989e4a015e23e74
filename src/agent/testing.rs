//! Mock runtime and Agent Manager integration tests.

use super::runtime::{
    AgentRuntime, ApprovalDecision, ModelInfo, PermissionMode, QueryControl, QueryOptions,
    RuntimeError, RuntimeMessage, RuntimeQuery, ToolGate,
};
use super::*;
use crate::boundary::BoundaryGuard;
use crate::mcp::ToolServer;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_stream::StreamExt;

/// Scripted runtime behaviors for tests.
#[derive(Clone)]
pub enum MockBehavior {
    /// SessionStarted + one text delta + Completed.
    Echo,
    /// Streams a tool use through the gate, honoring its decision.
    ToolUse { name: String },
    /// Fails query start with a resume-failure error when resuming;
    /// behaves like `Echo` on a fresh start.
    StaleResume,
    /// Fails query start outright.
    FailStart(String),
}

pub struct MockRuntime {
    pub behavior: MockBehavior,
    /// Session id the runtime reports; defaults to `sdk-<key>` derived ids.
    pub assigned_session_id: String,
}

impl MockRuntime {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            assigned_session_id: "sdk-session-1".to_string(),
        }
    }
}

pub struct MockControl {
    pub interrupted: AtomicBool,
}

#[async_trait]
impl QueryControl for MockControl {
    async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    async fn set_permission_mode(&self, _mode: PermissionMode) {}
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn start_query(
        &self,
        prompt: String,
        options: QueryOptions,
        _tool_server: Option<ToolServer>,
        gate: Arc<dyn ToolGate>,
    ) -> Result<RuntimeQuery, RuntimeError> {
        match &self.behavior {
            MockBehavior::FailStart(message) => {
                return Err(RuntimeError::Query(message.clone()));
            }
            MockBehavior::StaleResume if options.resume.is_some() => {
                return Err(RuntimeError::Query(
                    "No conversation found with that id".to_string(),
                ));
            }
            _ => {}
        }

        let (tx, rx) = mpsc::channel(32);
        let control = Arc::new(MockControl {
            interrupted: AtomicBool::new(false),
        });
        let behavior = self.behavior.clone();
        let session_id = self.assigned_session_id.clone();

        tokio::spawn(async move {
            let _ = tx
                .send(RuntimeMessage::SessionStarted {
                    session_id: session_id.clone(),
                })
                .await;

            match behavior {
                MockBehavior::Echo | MockBehavior::StaleResume => {
                    let _ = tx
                        .send(RuntimeMessage::TextDelta {
                            text: format!("echo: {prompt}"),
                        })
                        .await;
                }
                MockBehavior::ToolUse { name } => {
                    let _ = tx
                        .send(RuntimeMessage::TextDelta {
                            text: "working".to_string(),
                        })
                        .await;
                    let _ = tx
                        .send(RuntimeMessage::ToolUseStart {
                            id: "tool-1".to_string(),
                            name: name.clone(),
                            input: json!({"path": "notes.txt"}),
                        })
                        .await;
                    let decision = gate
                        .approve_tool("tool-1", &name, &json!({"path": "notes.txt"}))
                        .await;
                    let _ = tx
                        .send(RuntimeMessage::ToolUseEnd {
                            id: "tool-1".to_string(),
                            output: json!(null),
                            is_error: decision == ApprovalDecision::Deny,
                        })
                        .await;
                    let _ = tx
                        .send(RuntimeMessage::TextDelta {
                            text: "after tool".to_string(),
                        })
                        .await;
                }
                MockBehavior::FailStart(_) => unreachable!(),
            }

            let _ = tx.send(RuntimeMessage::Completed { usage: None }).await;
        });

        Ok(RuntimeQuery {
            messages: rx,
            control,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError> {
        Ok(vec![ModelInfo {
            id: "mock-large".to_string(),
            display_name: "Mock Large".to_string(),
            description: None,
        }])
    }
}

pub fn manager_with(behavior: MockBehavior, root: &std::path::Path) -> Arc<AgentManager> {
    let boundary = Arc::new(BoundaryGuard::new(root).unwrap());
    Arc::new(AgentManager::new(
        Arc::new(MockRuntime::new(behavior)),
        boundary,
        ServerInfo::new(4242),
        root.to_path_buf(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use tempfile::TempDir;

    async fn collect(stream: ReceiverStream<StreamEvent>) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn echo_query_streams_text_and_done() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());

        let stream = manager
            .send_message("s1", "hello".to_string(), SendOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::SessionStatus { session_id } if session_id == "sdk-session-1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text } if text == "echo: hello")));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn boundary_violation_is_single_error_event() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());

        let stream = manager
            .send_message(
                "s1",
                "hello".to_string(),
                SendOptions {
                    cwd: Some(PathBuf::from("/etc")),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(events.len(), 1);
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["code"], "BOUNDARY_VIOLATION");
        assert_eq!(json["path"], "/etc");
    }

    #[tokio::test]
    async fn reverse_index_tracks_sdk_session_id() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());

        let stream = manager
            .send_message("key-1", "hi".to_string(), SendOptions::default())
            .await
            .unwrap();
        let _ = collect(stream).await;

        assert_eq!(
            manager.session_key_for_sdk_id("sdk-session-1").as_deref(),
            Some("key-1")
        );
        // The creation-time identity entry is gone.
        assert!(manager.session_key_for_sdk_id("key-1").is_none());
    }

    #[tokio::test]
    async fn denied_approval_flows_through_events() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(
            MockBehavior::ToolUse {
                name: "Write".to_string(),
            },
            temp.path(),
        );

        let mut stream = manager
            .send_message("s1", "write it".to_string(), SendOptions::default())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::ToolApprovalRequest { id, name, .. } = &event {
                assert_eq!(name, "Write");
                let id = id.clone();
                seen.push(event);
                assert!(manager.approve_tool("s1", &id, false).await);
                continue;
            }
            seen.push(event);
        }

        let start_idx = seen
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolCallStart { .. }))
            .unwrap();
        let request_idx = seen
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolApprovalRequest { .. }))
            .unwrap();
        assert!(start_idx < request_idx, "start precedes approval request");

        assert!(seen.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallEnd {
                approved: Some(false),
                ..
            }
        )));
        assert!(matches!(seen.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn bypass_mode_auto_allows_tools() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(
            MockBehavior::ToolUse {
                name: "Bash".to_string(),
            },
            temp.path(),
        );

        let stream = manager
            .send_message(
                "s1",
                "run".to_string(),
                SendOptions {
                    permission_mode: Some(PermissionMode::BypassPermissions),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        let events = collect(stream).await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolApprovalRequest { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallEnd {
                approved: Some(true),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn plan_mode_denies_execution_tools() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(
            MockBehavior::ToolUse {
                name: "Bash".to_string(),
            },
            temp.path(),
        );

        let stream = manager
            .send_message(
                "s1",
                "run".to_string(),
                SendOptions {
                    permission_mode: Some(PermissionMode::Plan),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        let events = collect(stream).await;

        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallEnd {
                approved: Some(false),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn stale_resume_retries_fresh_once() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::StaleResume, temp.path());

        // Pretend the session already ran once.
        manager
            .ensure_session(
                "s1",
                EnsureOptions {
                    has_started: Some(true),
                    ..EnsureOptions::default()
                },
            )
            .unwrap();

        let stream = manager
            .send_message("s1", "again".to_string(), SendOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        // The retry succeeded as a fresh session rather than erroring.
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn session_limit_fails_loudly() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());

        for i in 0..MAX_SESSIONS {
            manager
                .ensure_session(&format!("s{i}"), EnsureOptions::default())
                .unwrap();
        }
        let err = manager
            .ensure_session("one-too-many", EnsureOptions::default())
            .unwrap_err();
        assert!(matches!(err, AgentError::SessionLimit));
    }

    #[tokio::test]
    async fn health_sweep_evicts_idle_sessions() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());
        manager.ensure_session("idle", EnsureOptions::default()).unwrap();
        manager.ensure_session("fresh", EnsureOptions::default()).unwrap();
        manager.locks().acquire("idle", "client-a").unwrap();

        // Backdate one session just past the timeout; the other stays just
        // under it.
        {
            let shared = manager.get("idle").unwrap();
            let mut session = shared.lock().await;
            session.last_activity = std::time::Instant::now() - SESSION_IDLE_TIMEOUT
                - Duration::from_secs(1);
        }
        {
            let shared = manager.get("fresh").unwrap();
            let mut session = shared.lock().await;
            session.last_activity = std::time::Instant::now() - SESSION_IDLE_TIMEOUT
                + Duration::from_secs(1);
        }

        let evicted = manager.check_session_health().await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.session_key_for_sdk_id("idle").is_none());
        assert!(manager.session_key_for_sdk_id("fresh").is_some());
        assert!(manager.locks().get("idle").is_none());
    }

    #[tokio::test]
    async fn fresh_session_keeps_identity_mapping() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());
        manager.ensure_session("fresh", EnsureOptions::default()).unwrap();

        // Before any query, sdkSessionId == sessionKey and the reverse
        // index maps it to itself.
        assert_eq!(
            manager.session_key_for_sdk_id("fresh").as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn update_session_autocreates_as_started() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());

        manager
            .update_session(
                "resumed",
                UpdateOptions {
                    model: Some("mock-large".to_string()),
                    permission_mode: Some(PermissionMode::AcceptEdits),
                },
            )
            .await
            .unwrap();

        let view = manager.session_view("resumed").unwrap();
        assert_eq!(view["hasStarted"], true);
        assert_eq!(view["model"], "mock-large");
    }

    #[tokio::test]
    async fn models_are_cached_after_first_call() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(MockBehavior::Echo, temp.path());
        let first = manager.get_supported_models().await;
        let second = manager.get_supported_models().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first.len(), second.len());
    }
}
