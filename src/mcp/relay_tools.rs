//! Relay MCP tools: messaging, endpoints, traces, adapters, and bindings.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{handler, object_schema, require_str, McpTool, ToolResult};
use crate::error::{DomainError, ErrorCode};
use crate::relay::adapters::AdapterRegistry;
use crate::relay::bindings::{BindingStore, NewBinding};
use crate::relay::envelope::BudgetSpec;
use crate::relay::{InboxStatus, PublishOptions, ReadInboxOptions, Relay};

pub fn tools(relay: Arc<Relay>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "relay_send",
            "Publish a message on a relay subject.",
            object_schema(
                json!({
                    "subject": { "type": "string" },
                    "payload": {},
                    "from": { "type": "string" },
                    "replyTo": { "type": "string" },
                    "budget": { "type": "object" },
                }),
                &["subject", "from"],
            ),
            handler(move |args| {
                let relay = Arc::clone(&relay);
                async move {
                    let subject = match require_str(&args, "subject") {
                        Ok(subject) => subject,
                        Err(result) => return result,
                    };
                    let from = match require_str(&args, "from") {
                        Ok(from) => from,
                        Err(result) => return result,
                    };
                    let payload = args.get("payload").cloned().unwrap_or(Value::Null);
                    let budget: Option<BudgetSpec> = args
                        .get("budget")
                        .cloned()
                        .and_then(|b| serde_json::from_value(b).ok());
                    let reply_to = args
                        .get("replyTo")
                        .and_then(Value::as_str)
                        .map(String::from);

                    match relay
                        .publish(
                            &subject,
                            payload,
                            PublishOptions {
                                from,
                                reply_to,
                                budget,
                                ..PublishOptions::default()
                            },
                        )
                        .await
                    {
                        Ok(receipt) => ToolResult::ok(receipt),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "relay_inbox",
            "Read an endpoint's inbox (cursor-paginated, filterable by status).",
            object_schema(
                json!({
                    "subject": { "type": "string" },
                    "limit": { "type": "integer" },
                    "status": { "type": "string", "enum": ["new", "cur", "failed"] },
                    "cursor": { "type": "string" },
                }),
                &["subject"],
            ),
            handler(move |args| {
                let relay = Arc::clone(&relay);
                async move {
                    let subject = match require_str(&args, "subject") {
                        Ok(subject) => subject,
                        Err(result) => return result,
                    };
                    let status: Option<InboxStatus> = args
                        .get("status")
                        .cloned()
                        .and_then(|s| serde_json::from_value(s).ok());
                    let opts = ReadInboxOptions {
                        limit: args
                            .get("limit")
                            .and_then(Value::as_u64)
                            .map(|v| v as usize),
                        status,
                        cursor: args
                            .get("cursor")
                            .and_then(Value::as_str)
                            .map(String::from),
                    };
                    match relay.read_inbox(&subject, opts) {
                        Ok(page) => ToolResult::ok(page),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "list_endpoints",
            "List registered relay endpoints.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let relay = Arc::clone(&relay);
                async move { ToolResult::ok(relay.list_endpoints()) }
            }),
        ));
    }

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "register_endpoint",
            "Register a durable endpoint on a concrete subject.",
            object_schema(
                json!({
                    "subject": { "type": "string" },
                    "metadata": { "type": "object" },
                }),
                &["subject"],
            ),
            handler(move |args| {
                let relay = Arc::clone(&relay);
                async move {
                    let subject = match require_str(&args, "subject") {
                        Ok(subject) => subject,
                        Err(result) => return result,
                    };
                    let metadata = args.get("metadata").cloned().unwrap_or(Value::Null);
                    match relay.register_endpoint(&subject, metadata) {
                        Ok(endpoint) => ToolResult::ok(endpoint),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "get_trace",
            "All spans for a trace id, ordered by start time.",
            object_schema(json!({ "traceId": { "type": "string" } }), &["traceId"]),
            handler(move |args| {
                let relay = Arc::clone(&relay);
                async move {
                    let trace_id = match require_str(&args, "traceId") {
                        Ok(trace_id) => trace_id,
                        Err(result) => return result,
                    };
                    let Some(traces) = relay.traces() else {
                        return ToolResult::error(
                            ErrorCode::TracingDisabled,
                            "trace store is not enabled",
                        );
                    };
                    match traces.get_trace(&trace_id) {
                        Ok(spans) => ToolResult::ok(spans),
                        Err(e) => ToolResult::error(ErrorCode::InternalError, e.to_string()),
                    }
                }
            }),
        ));
    }

    {
        let relay = Arc::clone(&relay);
        tools.push(McpTool::new(
            "get_metrics",
            "Relay metrics: counters, dead letters, and delivery latency percentiles.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let relay = Arc::clone(&relay);
                async move {
                    let Some(traces) = relay.traces() else {
                        return ToolResult::error(
                            ErrorCode::TracingDisabled,
                            "trace store is not enabled",
                        );
                    };
                    match traces.get_metrics() {
                        Ok(metrics) => ToolResult::ok(metrics),
                        Err(e) => ToolResult::error(ErrorCode::InternalError, e.to_string()),
                    }
                }
            }),
        ));
    }

    tools
}

pub fn adapter_tools(registry: Arc<AdapterRegistry>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    {
        let registry = Arc::clone(&registry);
        tools.push(McpTool::new(
            "list_adapters",
            "List adapters with lifecycle status.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let registry = Arc::clone(&registry);
                async move { ToolResult::ok(registry.list().await) }
            }),
        ));
    }

    {
        let registry = Arc::clone(&registry);
        tools.push(McpTool::new(
            "enable_adapter",
            "Enable and start an adapter.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let registry = Arc::clone(&registry);
                async move {
                    let id = match require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match registry.enable(&id).await {
                        Ok(view) => ToolResult::ok(view),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let registry = Arc::clone(&registry);
        tools.push(McpTool::new(
            "disable_adapter",
            "Disable and stop an adapter.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let registry = Arc::clone(&registry);
                async move {
                    let id = match require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match registry.disable(&id).await {
                        Ok(view) => ToolResult::ok(view),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let registry = Arc::clone(&registry);
        tools.push(McpTool::new(
            "reload_adapters",
            "Re-read the adapters config file and reconcile state.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let registry = Arc::clone(&registry);
                async move {
                    match registry.reload().await {
                        Ok(views) => ToolResult::ok(views),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    tools
}

pub fn binding_tools(bindings: Arc<BindingStore>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    {
        let bindings = Arc::clone(&bindings);
        tools.push(McpTool::new(
            "list_bindings",
            "List adapter-to-agent bindings.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let bindings = Arc::clone(&bindings);
                async move {
                    match bindings.get_all() {
                        Ok(all) => ToolResult::ok(all),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let bindings = Arc::clone(&bindings);
        tools.push(McpTool::new(
            "create_binding",
            "Bind an adapter (optionally filtered by chat/channel) to an agent directory.",
            object_schema(
                json!({
                    "adapterId": { "type": "string" },
                    "agentId": { "type": "string" },
                    "agentDir": { "type": "string" },
                    "sessionStrategy": {
                        "type": "string",
                        "enum": ["per-chat", "per-user", "stateless"]
                    },
                    "chatId": { "type": "string" },
                    "channelType": { "type": "string" },
                    "label": { "type": "string" },
                }),
                &["adapterId", "agentId", "agentDir"],
            ),
            handler(move |args| {
                let bindings = Arc::clone(&bindings);
                async move {
                    let new: NewBinding = match serde_json::from_value(args) {
                        Ok(new) => new,
                        Err(e) => {
                            return ToolResult::error(
                                ErrorCode::ValidationFailed,
                                e.to_string(),
                            )
                        }
                    };
                    match bindings.create(new) {
                        Ok(binding) => ToolResult::ok(binding),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let bindings = Arc::clone(&bindings);
        tools.push(McpTool::new(
            "delete_binding",
            "Delete a binding by id. In-flight runs are unaffected.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let bindings = Arc::clone(&bindings);
                async move {
                    let id = match require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match bindings.delete(&id) {
                        Ok(removed) => ToolResult::ok(json!({ "deleted": removed })),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    tools
}
