//! Mesh MCP tools: discovery, registration, denial, and topology.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use super::{handler, object_schema, require_str, McpTool, ToolResult};
use crate::error::{DomainError, ErrorCode};
use crate::mesh::discovery::DiscoveryOptions;
use crate::mesh::{ListFilters, ManifestOverrides, MeshService};

const AGENT_APPROVER: &str = "mcp-agent";

pub fn tools(mesh: Arc<MeshService>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_discover",
            "Scan roots for agent projects (bounded depth; denied paths excluded).",
            object_schema(
                json!({
                    "roots": { "type": "array", "items": { "type": "string" } },
                    "maxDepth": { "type": "integer" },
                }),
                &["roots"],
            ),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let roots: Vec<PathBuf> = args
                        .get("roots")
                        .and_then(Value::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(Value::as_str)
                                .map(PathBuf::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    if roots.is_empty() {
                        return ToolResult::error(
                            ErrorCode::ValidationFailed,
                            "roots must be a non-empty array of paths",
                        );
                    }
                    let opts = DiscoveryOptions {
                        max_depth: args
                            .get("maxDepth")
                            .and_then(Value::as_u64)
                            .map(|v| v as usize),
                        excluded_dirs: None,
                    };
                    match mesh.discover(&roots, &opts) {
                        Ok(candidates) => ToolResult::ok(candidates),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_register",
            "Register an agent at a project path.",
            object_schema(
                json!({
                    "path": { "type": "string" },
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "capabilities": { "type": "array", "items": { "type": "string" } },
                }),
                &["path"],
            ),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let path = match require_str(&args, "path") {
                        Ok(path) => path,
                        Err(result) => return result,
                    };
                    let overrides: ManifestOverrides =
                        serde_json::from_value(args).unwrap_or_default();
                    match mesh.register(&PathBuf::from(path), overrides, AGENT_APPROVER) {
                        Ok(manifest) => ToolResult::ok(manifest),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_list",
            "List registered agents, filterable by runtime and capability.",
            object_schema(
                json!({
                    "runtime": { "type": "string" },
                    "capability": { "type": "string" },
                    "callerNamespace": { "type": "string" },
                }),
                &[],
            ),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let filters: ListFilters = serde_json::from_value(args).unwrap_or_default();
                    match mesh.list(&filters) {
                        Ok(manifests) => ToolResult::ok(manifests),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_deny",
            "Exclude a path from future discovery.",
            object_schema(
                json!({
                    "path": { "type": "string" },
                    "reason": { "type": "string" },
                }),
                &["path"],
            ),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let path = match require_str(&args, "path") {
                        Ok(path) => path,
                        Err(result) => return result,
                    };
                    let reason = args
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(String::from);
                    match mesh.deny(
                        &PathBuf::from(path),
                        reason,
                        Some(AGENT_APPROVER.to_string()),
                    ) {
                        Ok(record) => ToolResult::ok(record),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_unregister",
            "Remove an agent's manifest, registry row, and relay endpoint.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let id = match require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match mesh.unregister(&id) {
                        Ok(()) => ToolResult::ok(json!({ "unregistered": true })),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_status",
            "Mesh subsystem status: agent and denial counts.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    match mesh.status() {
                        Ok(status) => ToolResult::ok(status),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "mesh_inspect",
            "An agent's manifest enriched with health, bindings, and schedules.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let id = match require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match mesh.inspect(&id) {
                        Ok(agent) => ToolResult::ok(agent),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let mesh = Arc::clone(&mesh);
        tools.push(McpTool::new(
            "query_topology",
            "Namespace-scoped topology view with access rules.",
            object_schema(json!({ "namespace": { "type": "string" } }), &[]),
            handler(move |args| {
                let mesh = Arc::clone(&mesh);
                async move {
                    let namespace = args
                        .get("namespace")
                        .and_then(Value::as_str)
                        .unwrap_or("*");
                    match mesh.get_topology(namespace) {
                        Ok(view) => ToolResult::ok(view),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    tools
}
