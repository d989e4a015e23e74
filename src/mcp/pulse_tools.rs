//! Pulse MCP tools: schedule CRUD and run history.
//!
//! Schedules created through these tools always start `pending_approval`.

use serde_json::json;
use std::sync::Arc;

use super::{handler, object_schema, McpTool, ToolResult};
use crate::error::DomainError;
use crate::pulse::store::{NewSchedule, RunQuery, ScheduleUpdate};
use crate::pulse::Pulse;

const AGENT_CREATOR: &str = "mcp-agent";

pub fn tools(pulse: Arc<Pulse>) -> Vec<McpTool> {
    let mut tools = Vec::new();

    {
        let pulse = Arc::clone(&pulse);
        tools.push(McpTool::new(
            "list_schedules",
            "List every Pulse schedule with status and cron expression.",
            object_schema(json!({}), &[]),
            handler(move |_args| {
                let pulse = Arc::clone(&pulse);
                async move {
                    match pulse.list_schedules() {
                        Ok(schedules) => ToolResult::ok(schedules),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let pulse = Arc::clone(&pulse);
        tools.push(McpTool::new(
            "create_schedule",
            "Create a schedule (requires user approval before it runs).",
            object_schema(
                json!({
                    "name": { "type": "string" },
                    "cron": { "type": "string", "description": "cron expression" },
                    "timezone": { "type": "string" },
                    "cwd": { "type": "string" },
                    "prompt": { "type": "string" },
                    "permissionMode": { "type": "string" },
                    "model": { "type": "string" },
                    "maxRuntimeMs": { "type": "integer" },
                }),
                &["name", "cron", "prompt"],
            ),
            handler(move |args| {
                let pulse = Arc::clone(&pulse);
                async move {
                    let new: NewSchedule = match serde_json::from_value(args) {
                        Ok(new) => new,
                        Err(e) => return ToolResult::error(
                            crate::error::ErrorCode::ValidationFailed,
                            e.to_string(),
                        ),
                    };
                    match pulse.create_schedule(new, AGENT_CREATOR, true) {
                        Ok(schedule) => ToolResult::ok(schedule),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let pulse = Arc::clone(&pulse);
        tools.push(McpTool::new(
            "update_schedule",
            "Update fields of an existing schedule.",
            object_schema(
                json!({
                    "id": { "type": "string" },
                    "name": { "type": "string" },
                    "cron": { "type": "string" },
                    "prompt": { "type": "string" },
                    "enabled": { "type": "boolean" },
                }),
                &["id"],
            ),
            handler(move |args| {
                let pulse = Arc::clone(&pulse);
                async move {
                    let id = match super::require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    let update: ScheduleUpdate = match serde_json::from_value(args) {
                        Ok(update) => update,
                        Err(e) => return ToolResult::error(
                            crate::error::ErrorCode::ValidationFailed,
                            e.to_string(),
                        ),
                    };
                    match pulse.update_schedule(&id, update) {
                        Ok(schedule) => ToolResult::ok(schedule),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let pulse = Arc::clone(&pulse);
        tools.push(McpTool::new(
            "delete_schedule",
            "Delete a schedule by id.",
            object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            handler(move |args| {
                let pulse = Arc::clone(&pulse);
                async move {
                    let id = match super::require_str(&args, "id") {
                        Ok(id) => id,
                        Err(result) => return result,
                    };
                    match pulse.delete_schedule(&id) {
                        Ok(removed) => ToolResult::ok(json!({ "deleted": removed })),
                        Err(e) => DomainError::from(e).into(),
                    }
                }
            }),
        ));
    }

    {
        let pulse = Arc::clone(&pulse);
        tools.push(McpTool::new(
            "get_run_history",
            "Paginated run history, newest first.",
            object_schema(
                json!({
                    "scheduleId": { "type": "string" },
                    "status": { "type": "string" },
                    "limit": { "type": "integer" },
                    "offset": { "type": "integer" },
                }),
                &[],
            ),
            handler(move |args| {
                let pulse = Arc::clone(&pulse);
                async move {
                    let query: RunQuery = serde_json::from_value(args).unwrap_or_default();
                    match pulse.list_runs(&query) {
                        Ok(runs) => ToolResult::ok(runs),
                        Err(e) => DomainError::from(e).into(),
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
    use crate::ids::IdGenerator;
    use crate::pulse::store::{PulseStore, ScheduleStatus};
    use tempfile::TempDir;

    fn pulse(temp: &TempDir) -> Arc<Pulse> {
        Pulse::new(
            Arc::new(PulseStore::open_in_memory().unwrap()),
            manager_with(MockBehavior::Echo, temp.path()),
            None,
            Arc::new(IdGenerator::new()),
        )
    }

    #[tokio::test]
    async fn tool_created_schedules_are_pending_approval() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse(&temp);
        let tools = tools(Arc::clone(&pulse));

        let create = tools.iter().find(|t| t.name == "create_schedule").unwrap();
        let result = create
            .call(json!({
                "name": "standup",
                "cron": "0 9 * * *",
                "prompt": "post the standup summary",
            }))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content["status"], "pending_approval");

        let schedules = pulse.list_schedules().unwrap();
        assert_eq!(schedules[0].status, ScheduleStatus::PendingApproval);
    }

    #[tokio::test]
    async fn invalid_cron_surfaces_as_in_band_error() {
        let temp = TempDir::new().unwrap();
        let tools = tools(pulse(&temp));
        let create = tools.iter().find(|t| t.name == "create_schedule").unwrap();

        let result = create
            .call(json!({ "name": "x", "cron": "not-cron", "prompt": "p" }))
            .await;
        assert!(result.is_error);
        assert_eq!(result.content["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn missing_id_fails_validation() {
        let temp = TempDir::new().unwrap();
        let tools = tools(pulse(&temp));
        let delete = tools.iter().find(|t| t.name == "delete_schedule").unwrap();
        let result = delete.call(json!({})).await;
        assert!(result.is_error);
    }
}
