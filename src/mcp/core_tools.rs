//! Core MCP tools: server introspection.

use serde_json::json;
use std::sync::Arc;

use super::{handler, object_schema, McpTool, ToolResult};
use crate::agent::AgentManager;
use crate::config::ServerConfig;
use crate::mesh::manifest::AgentManifest;

pub fn tools(config: Arc<ServerConfig>, agent: Arc<AgentManager>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    tools.push(McpTool::new(
        "ping",
        "Liveness probe; answers pong.",
        object_schema(json!({}), &[]),
        handler(|_args| async { ToolResult::text("pong") }),
    ));

    {
        let config = Arc::clone(&config);
        tools.push(McpTool::new(
            "get_server_info",
            "Server name, version, port, and enabled subsystems.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let config = Arc::clone(&config);
                async move {
                    ToolResult::ok(json!({
                        "name": "DorkOS",
                        "version": env!("CARGO_PKG_VERSION"),
                        "port": config.port,
                        "pulse": { "enabled": config.pulse_enabled },
                        "relay": { "enabled": config.relay_enabled },
                        "mesh": { "enabled": config.mesh_enabled },
                        "tunnel": { "enabled": config.tunnel_enabled },
                    }))
                }
            }),
        ));
    }

    {
        let agent = Arc::clone(&agent);
        tools.push(McpTool::new(
            "get_session_count",
            "Number of live agent sessions.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let agent = Arc::clone(&agent);
                async move { ToolResult::ok(json!({ "count": agent.session_count() })) }
            }),
        ));
    }

    {
        let config = Arc::clone(&config);
        tools.push(McpTool::new(
            "get_current_agent",
            "The mesh manifest registered at the default working directory, if any.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let config = Arc::clone(&config);
                async move {
                    match AgentManifest::read_from_project(&config.default_cwd) {
                        Ok(Some(manifest)) => ToolResult::ok(manifest),
                        Ok(None) => ToolResult::ok(json!({ "registered": false })),
                        Err(e) => ToolResult::error(
                            crate::error::ErrorCode::InternalError,
                            e.to_string(),
                        ),
                    }
                }
            }),
        ));
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{manager_with, MockBehavior};
    use tempfile::TempDir;

    #[tokio::test]
    async fn ping_answers_pong() {
        let temp = TempDir::new().unwrap();
        let mut config = ServerConfig::from_env();
        config.default_cwd = temp.path().to_path_buf();
        let tools = tools(
            Arc::new(config),
            manager_with(MockBehavior::Echo, temp.path()),
        );

        let ping = tools.iter().find(|t| t.name == "ping").unwrap();
        let result = ping.call(json!({})).await;
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn current_agent_reports_unregistered_dir() {
        let temp = TempDir::new().unwrap();
        let mut config = ServerConfig::from_env();
        config.default_cwd = temp.path().to_path_buf();
        let tools = tools(
            Arc::new(config),
            manager_with(MockBehavior::Echo, temp.path()),
        );

        let current = tools.iter().find(|t| t.name == "get_current_agent").unwrap();
        let result = current.call(json!({})).await;
        assert!(!result.is_error);
        assert_eq!(result.content["registered"], false);
    }
}
