//! Trait seam to the external LLM runtime.
//!
//! The Agent Manager is the only component that invokes the runtime, and it
//! does so exclusively through [`AgentRuntime`]. Tests substitute a mock
//! (see `agent::testing`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{Question, Usage};
use crate::mcp::ToolServer;

/// Permission mode for a session, mapped 1:1 onto the runtime's modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

/// A model descriptor from the runtime's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Messages the runtime emits while streaming a query.
#[derive(Debug, Clone)]
pub enum RuntimeMessage {
    /// The runtime assigned (or confirmed) its session id.
    SessionStarted { session_id: String },
    TextDelta { text: String },
    ToolUseStart { id: String, name: String, input: Value },
    ToolUseDelta { id: String, delta: String },
    ToolUseEnd { id: String, output: Value, is_error: bool },
    TaskProgress { id: String, subject: String, status: String },
    Completed { usage: Option<Usage> },
    Error { message: String },
}

/// Decision returned by the tool gate for each tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

/// Per-session callback surface the runtime invokes for tool approval and
/// structured questions. Both calls suspend the runtime until resolved or
/// timed out.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn approve_tool(&self, tool_call_id: &str, name: &str, input: &Value)
        -> ApprovalDecision;

    /// Returns `None` when the question times out or the session goes away.
    async fn ask(&self, tool_call_id: &str, questions: Vec<Question>)
        -> Option<HashMap<String, String>>;
}

/// Control surface for an in-flight query.
#[async_trait]
pub trait QueryControl: Send + Sync {
    /// Interrupt the query; the message stream ends shortly after.
    async fn interrupt(&self);

    /// Forward a live permission-mode change to the runtime.
    async fn set_permission_mode(&self, mode: PermissionMode);
}

/// A started query: its message stream plus a control handle.
pub struct RuntimeQuery {
    pub messages: mpsc::Receiver<RuntimeMessage>,
    pub control: Arc<dyn QueryControl>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub cwd: PathBuf,
    /// Prior runtime session id to resume, when the session has started.
    pub resume: Option<String>,
    pub permission_mode: PermissionMode,
    /// Set iff the mode is `bypassPermissions`.
    pub allow_dangerously_skip_permissions: bool,
    pub model: Option<String>,
    pub system_prompt_append: Option<String>,
}

/// Substrings the runtime emits when a resume target no longer exists.
/// Matching errors trigger one fresh retry with `has_started` cleared.
const RESUME_FAILURE_MARKERS: &[&str] = &[
    "no conversation found",
    "session not found",
    "unknown session",
    "cannot resume",
];

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime query failed: {0}")]
    Query(String),
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    pub fn is_resume_failure(&self) -> bool {
        is_resume_failure(&self.to_string())
    }
}

pub fn is_resume_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    RESUME_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// The external LLM runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start a streaming query. The tool server is rebuilt per query because
    /// the runtime's tool protocol is single-transport; the gate is bound to
    /// the owning session.
    async fn start_query(
        &self,
        prompt: String,
        options: QueryOptions,
        tool_server: Option<ToolServer>,
        gate: Arc<dyn ToolGate>,
    ) -> Result<RuntimeQuery, RuntimeError>;

    /// The runtime's model catalog.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError>;
}

/// Placeholder used when no runtime is attached to the process. Queries
/// fail with a clear message; the model catalog is empty. Embedders and
/// tests inject their own implementation.
pub struct DetachedRuntime;

#[async_trait]
impl AgentRuntime for DetachedRuntime {
    async fn start_query(
        &self,
        _prompt: String,
        _options: QueryOptions,
        _tool_server: Option<ToolServer>,
        _gate: Arc<dyn ToolGate>,
    ) -> Result<RuntimeQuery, RuntimeError> {
        Err(RuntimeError::Unavailable(
            "no LLM runtime is attached to this server".to_string(),
        ))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_modes_use_runtime_spelling() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::AcceptEdits).unwrap(),
            "\"acceptEdits\""
        );
        assert_eq!(
            serde_json::to_string(&PermissionMode::BypassPermissions).unwrap(),
            "\"bypassPermissions\""
        );
        let parsed: PermissionMode = serde_json::from_str("\"plan\"").unwrap();
        assert_eq!(parsed, PermissionMode::Plan);
    }

    #[test]
    fn resume_failures_match_known_markers() {
        assert!(is_resume_failure("No conversation found with id abc"));
        assert!(is_resume_failure("error: Session NOT FOUND"));
        assert!(!is_resume_failure("rate limited"));
    }
}
