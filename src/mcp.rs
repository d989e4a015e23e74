//! In-process MCP tool surface.
//!
//! Every enabled subsystem contributes tools; the registry assembles them
//! into one logical server. The tool set is static per process, but the
//! server instance is rebuilt per runtime query (the runtime's tool protocol
//! is single-transport), so tools are cheaply cloneable: handlers are `Arc`s
//! over the subsystem services they capture.

pub mod core_tools;
pub mod mesh_tools;
pub mod pulse_tools;
pub mod relay_tools;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{DomainError, ErrorCode};

pub const SERVER_NAME: &str = "dorkos";

/// Payload a tool handler resolves to. Handlers never fail the future;
/// errors are carried in-band with `is_error`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Serialize) -> Self {
        Self {
            content: serde_json::to_value(content).unwrap_or(Value::Null),
            is_error: false,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Value::String(content.into()),
            is_error: false,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            content: serde_json::json!({
                "code": code,
                "message": message.into(),
            }),
            is_error: true,
        }
    }
}

impl From<DomainError> for ToolResult {
    fn from(err: DomainError) -> Self {
        Self {
            content: serde_json::json!({
                "code": err.code,
                "message": err.message,
                "details": err.details,
            }),
            is_error: true,
        }
    }
}

pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// One tool exposed to the LLM as `mcp__dorkos__<name>`.
#[derive(Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

impl McpTool {
    pub fn new(
        name: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            handler,
        }
    }

    /// Invoke the handler. Argument validation problems come back as
    /// `is_error` payloads, never as panics or thrown errors.
    pub async fn call(&self, args: Value) -> ToolResult {
        (self.handler)(args).await
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool").field("name", &self.name).finish()
    }
}

/// A per-query server instance.
#[derive(Debug, Clone)]
pub struct ToolServer {
    pub name: String,
    pub version: String,
    pub tools: Vec<McpTool>,
}

impl ToolServer {
    #[allow(dead_code)] // Used by in-process tool callers
    pub fn tool(&self, name: &str) -> Option<&McpTool> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Process-wide registry. Subsystems contribute their slices at startup;
/// the factory form hands a fresh `ToolServer` to each query.
pub struct McpRegistry {
    tools: Vec<McpTool>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn contribute(&mut self, tools: Vec<McpTool>) {
        self.tools.extend(tools);
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Build a server instance for one query.
    pub fn build_server(&self) -> ToolServer {
        ToolServer {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tools: self.tools.clone(),
        }
    }

    /// The factory closure handed to the Agent Manager.
    pub fn into_factory(self) -> Arc<dyn Fn() -> ToolServer + Send + Sync> {
        let registry = Arc::new(self);
        Arc::new(move || registry.build_server())
    }
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for building a handler from an async closure over parsed args.
pub fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Pull a required string argument out of a tool-call payload.
pub fn require_str(args: &Value, key: &str) -> Result<String, ToolResult> {
    args.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            ToolResult::error(
                ErrorCode::ValidationFailed,
                format!("missing required argument: {key}"),
            )
        })
}

/// JSON schema helper for object parameters.
pub fn object_schema(properties: Value, required: &[&str]) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_builds_fresh_server_per_call() {
        let mut registry = McpRegistry::new();
        registry.contribute(vec![McpTool::new(
            "ping",
            "liveness probe",
            object_schema(serde_json::json!({}), &[]),
            handler(|_| async { ToolResult::text("pong") }),
        )]);

        let factory = registry.into_factory();
        let a = factory();
        let b = factory();
        assert_eq!(a.name, "dorkos");
        assert_eq!(a.tools.len(), b.tools.len());

        let result = a.tool("ping").unwrap().call(Value::Null).await;
        assert!(!result.is_error);
        assert_eq!(result.content, Value::String("pong".to_string()));
    }

    #[tokio::test]
    async fn missing_argument_is_in_band_error() {
        let args = serde_json::json!({});
        let err = require_str(&args, "subject").unwrap_err();
        assert!(err.is_error);
        assert_eq!(err.content["code"], "VALIDATION_FAILED");
    }
}
