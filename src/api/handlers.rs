//! HTTP request handlers
//!
//! Thin translators over the transport port (`Operations`). Domain errors
//! surface as 4xx with stable codes; unexpected errors are 500 with the
//! message suppressed in production.

use super::sse::sse_response;
use super::types::{
    AnswerBody, ApproveBody, ApproveScheduleBody, DeletedResponse, DenyBody, DiscoverBody,
    ErrorResponse, InboxQuery, PatchSessionBody, PublishBody, RegisterAgentBody,
    RegisterEndpointBody, ResolvedResponse, SendMessageBody, SessionsQuery, SuccessResponse,
    TopologyQuery,
};
use crate::agent::locks::LockInfo;
use crate::agent::{SendOptions, UpdateOptions};
use crate::error::{DomainError, ErrorCode};
use crate::mesh::discovery::DiscoveryOptions;
use crate::pulse::store::{NewSchedule, RunQuery, ScheduleUpdate};
use crate::relay::{PublishOptions, ReadInboxOptions};
use crate::transport::Operations;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Set once at router construction; controls 500-message suppression.
static PRODUCTION: OnceLock<bool> = OnceLock::new();

type AppState = Arc<Operations>;

/// Create the API router
pub fn create_router(ops: AppState) -> Router {
    let _ = PRODUCTION.set(ops.config.production);

    Router::new()
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session).patch(patch_session))
        .route("/api/sessions/:id/messages", post(send_message))
        .route("/api/sessions/:id/approve", post(approve_tool))
        .route("/api/sessions/:id/answer", post(submit_answers))
        .route(
            "/api/sessions/:id/lock",
            post(acquire_lock).delete(release_lock),
        )
        // Sync broadcast
        .route("/api/sync", get(sync_stream))
        // Models
        .route("/api/models", get(list_models))
        // Pulse
        .route(
            "/api/pulse/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/api/pulse/schedules/:id",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .route("/api/pulse/schedules/:id/run", post(run_schedule_now))
        .route("/api/pulse/schedules/:id/approve", post(approve_schedule))
        .route("/api/pulse/schedules/:id/reject", post(reject_schedule))
        .route("/api/pulse/runs", get(list_runs))
        .route("/api/pulse/runs/:id", get(get_run))
        .route("/api/pulse/runs/:id/cancel", post(cancel_run))
        // Relay
        .route("/api/relay/messages", post(publish_message))
        .route(
            "/api/relay/endpoints",
            get(list_endpoints).post(register_endpoint),
        )
        .route("/api/relay/endpoints/:subject", delete(unregister_endpoint))
        .route("/api/relay/endpoints/:subject/inbox", get(read_inbox))
        .route("/api/relay/traces/:id", get(get_trace))
        .route("/api/relay/metrics", get(get_metrics))
        .route("/api/relay/stream", get(relay_stream))
        // Adapters
        .route("/api/relay/adapters", get(list_adapters))
        .route("/api/relay/adapters/reload", post(reload_adapters))
        .route("/api/relay/adapters/:id/enable", post(enable_adapter))
        .route("/api/relay/adapters/:id/disable", post(disable_adapter))
        // Bindings
        .route(
            "/api/relay/bindings",
            get(list_bindings).post(create_binding),
        )
        .route("/api/relay/bindings/:id", delete(delete_binding))
        // Mesh
        .route("/api/mesh/discover", post(mesh_discover))
        .route("/api/mesh/agents", get(mesh_list).post(mesh_register))
        .route(
            "/api/mesh/agents/:id",
            get(mesh_get).patch(mesh_update).delete(mesh_unregister),
        )
        .route("/api/mesh/agents/:id/inspect", get(mesh_inspect))
        .route("/api/mesh/agents/:id/heartbeat", post(mesh_heartbeat))
        .route("/api/mesh/deny", post(mesh_deny))
        .route("/api/mesh/denied", get(mesh_denied))
        .route("/api/mesh/denied/:path", delete(mesh_undeny))
        .route("/api/mesh/status", get(mesh_status))
        .route("/api/mesh/topology", get(mesh_topology))
        // Config
        .route("/api/config", get(get_config))
        .route("/version", get(get_version))
        .with_state(ops)
}

fn client_id(headers: &HeaderMap) -> String {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// The 409 body clients use to render the current writer.
fn locked_response(info: &LockInfo) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "code": ErrorCode::Locked,
            "holder": info.holder,
            "acquiredAt": info.acquired_at,
        })),
    )
        .into_response()
}

// ============================================================
// Sessions
// ============================================================

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cwd = state.boundary.validate(&query.cwd).map_err(domain)?;
    let sessions = state
        .transcripts
        .list_sessions(&cwd)
        .map_err(|e| ApiError(DomainError::internal(e.to_string())))?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(view) = state.agent.session_view(&id) {
        return Ok(Json(json!({ "session": view, "live": true })));
    }
    match state.transcripts.read_transcript(&id) {
        Ok(records) => Ok(Json(json!({
            "session": { "key": id, "messageCount": records.len() },
            "live": false,
        }))),
        Err(_) => Err(ApiError(DomainError::not_found(format!(
            "session not found: {id}"
        )))),
    }
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers);
    if let Some(info) = state.agent.locks().is_locked_by_other(&id, &client) {
        return Ok(locked_response(&info));
    }

    let stream = state
        .agent
        .send_message(
            &id,
            body.content,
            SendOptions {
                permission_mode: body.permission_mode,
                cwd: body.cwd,
                model: body.model,
                system_prompt_append: None,
            },
        )
        .await
        .map_err(domain)?;
    Ok(sse_response(stream))
}

async fn approve_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Json<ResolvedResponse> {
    let resolved = state
        .agent
        .approve_tool(&id, &body.tool_call_id, body.approved)
        .await;
    Json(ResolvedResponse { resolved })
}

async fn submit_answers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Json<ResolvedResponse> {
    let resolved = state
        .agent
        .submit_answers(&id, &body.tool_call_id, body.answers)
        .await;
    Json(ResolvedResponse { resolved })
}

async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state
        .agent
        .update_session(
            &id,
            UpdateOptions {
                permission_mode: body.permission_mode,
                model: body.model,
            },
        )
        .await
        .map_err(domain)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn acquire_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let client = client_id(&headers);
    match state.agent.locks().acquire(&id, &client) {
        Ok(()) => Ok(Json(SuccessResponse { success: true }).into_response()),
        Err(info) => Ok(locked_response(&info)),
    }
}

async fn release_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Json<SuccessResponse> {
    let client = client_id(&headers);
    let released = state.agent.locks().release(&id, &client);
    Json(SuccessResponse { success: released })
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state.agent.get_supported_models().await;
    Json(json!({ "models": models }))
}

// ============================================================
// Sync broadcast
// ============================================================

async fn sync_stream(State(state): State<AppState>) -> Response {
    let rx = state.broadcaster.subscribe();
    let events = BroadcastStream::new(rx).filter_map(|result| result.ok());
    sse_response(events)
}

// ============================================================
// Pulse
// ============================================================

async fn list_schedules(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let schedules = pulse.list_schedules().map_err(domain)?;
    Ok(Json(json!({ "schedules": schedules })))
}

async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewSchedule>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let schedule = pulse
        .create_schedule(body, &client_id(&headers), false)
        .map_err(domain)?;
    Ok(Json(json!({ "schedule": schedule })))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let schedule = pulse.get_schedule(&id).map_err(domain)?;
    Ok(Json(json!({ "schedule": schedule })))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let schedule = pulse.update_schedule(&id, body).map_err(domain)?;
    Ok(Json(json!({ "schedule": schedule })))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let deleted = pulse.delete_schedule(&id).map_err(domain)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn run_schedule_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let run = pulse.run_now(&id).await.map_err(domain)?;
    Ok(Json(json!({ "run": run })))
}

async fn approve_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ApproveScheduleBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let approver = body
        .and_then(|Json(b)| b.approver)
        .unwrap_or_else(|| client_id(&headers));
    let schedule = pulse.approve_schedule(&id, &approver).map_err(domain)?;
    Ok(Json(json!({ "schedule": schedule })))
}

async fn reject_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let deleted = pulse.reject_schedule(&id).map_err(domain)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let runs = pulse.list_runs(&query).map_err(domain)?;
    Ok(Json(json!({ "runs": runs })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let run = pulse.get_run(&id).map_err(domain)?;
    Ok(Json(json!({ "run": run })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pulse = state.pulse().map_err(ApiError)?;
    let run = pulse.cancel_run(&id).await.map_err(domain)?;
    Ok(Json(json!({ "run": run })))
}

// ============================================================
// Relay
// ============================================================

async fn publish_message(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    let receipt = relay
        .publish(
            &body.subject,
            body.payload,
            PublishOptions {
                from: body.from,
                reply_to: body.reply_to,
                budget: body.budget,
                ..PublishOptions::default()
            },
        )
        .await
        .map_err(domain)?;
    Ok(Json(json!({ "receipt": receipt })))
}

async fn list_endpoints(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    Ok(Json(json!({ "endpoints": relay.list_endpoints() })))
}

async fn register_endpoint(
    State(state): State<AppState>,
    Json(body): Json<RegisterEndpointBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    let endpoint = relay
        .register_endpoint(&body.subject, body.metadata)
        .map_err(domain)?;
    Ok(Json(json!({ "endpoint": endpoint })))
}

async fn unregister_endpoint(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    Ok(Json(DeletedResponse {
        deleted: relay.unregister_endpoint(&subject),
    }))
}

async fn read_inbox(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    let page = relay
        .read_inbox(
            &subject,
            ReadInboxOptions {
                limit: query.limit,
                status: query.status,
                cursor: query.cursor,
            },
        )
        .map_err(domain)?;
    Ok(Json(serde_json::to_value(page).unwrap_or_default()))
}

async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let traces = state.traces().map_err(ApiError)?;
    let spans = traces
        .get_trace(&id)
        .map_err(|e| ApiError(DomainError::internal(e.to_string())))?;
    Ok(Json(json!({ "traceId": id, "spans": spans })))
}

async fn get_metrics(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let traces = state.traces().map_err(ApiError)?;
    let metrics = traces
        .get_metrics()
        .map_err(|e| ApiError(DomainError::internal(e.to_string())))?;
    Ok(Json(serde_json::to_value(metrics).unwrap_or_default()))
}

async fn relay_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let relay = state.relay().map_err(ApiError)?;
    let rx = relay.subscribe_events();
    let events = BroadcastStream::new(rx).filter_map(|result| result.ok());
    Ok(sse_response(events))
}

// ============================================================
// Adapters
// ============================================================

async fn list_adapters(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let adapters = state.adapters().map_err(ApiError)?;
    Ok(Json(json!({ "adapters": adapters.list().await })))
}

async fn enable_adapter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapters = state.adapters().map_err(ApiError)?;
    let view = adapters.enable(&id).await.map_err(domain)?;
    Ok(Json(json!({ "adapter": view })))
}

async fn disable_adapter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapters = state.adapters().map_err(ApiError)?;
    let view = adapters.disable(&id).await.map_err(domain)?;
    Ok(Json(json!({ "adapter": view })))
}

async fn reload_adapters(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let adapters = state.adapters().map_err(ApiError)?;
    let views = adapters.reload().await.map_err(domain)?;
    Ok(Json(json!({ "adapters": views })))
}

// ============================================================
// Bindings
// ============================================================

async fn list_bindings(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let bindings = state.bindings().map_err(ApiError)?;
    let all = bindings.get_all().map_err(domain)?;
    Ok(Json(json!({ "bindings": all })))
}

async fn create_binding(
    State(state): State<AppState>,
    Json(body): Json<crate::relay::bindings::NewBinding>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bindings = state.bindings().map_err(ApiError)?;
    let binding = bindings.create(body).map_err(domain)?;
    Ok(Json(json!({ "binding": binding })))
}

async fn delete_binding(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let bindings = state.bindings().map_err(ApiError)?;
    let deleted = bindings.delete(&id).map_err(domain)?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================
// Mesh
// ============================================================

async fn mesh_discover(
    State(state): State<AppState>,
    Json(body): Json<DiscoverBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let candidates = mesh
        .discover(
            &body.roots,
            &DiscoveryOptions {
                max_depth: body.max_depth,
                excluded_dirs: None,
            },
        )
        .map_err(domain)?;
    Ok(Json(json!({ "candidates": candidates })))
}

async fn mesh_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterAgentBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let manifest = mesh
        .register(&body.path, body.overrides, &client_id(&headers))
        .map_err(domain)?;
    Ok(Json(json!({ "agent": manifest })))
}

async fn mesh_list(
    State(state): State<AppState>,
    Query(filters): Query<crate::mesh::ListFilters>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let agents = mesh.list(&filters).map_err(domain)?;
    Ok(Json(json!({ "agents": agents })))
}

async fn mesh_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let agent = mesh.get(&id).map_err(domain)?;
    Ok(Json(json!({ "agent": agent })))
}

async fn mesh_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(overrides): Json<crate::mesh::ManifestOverrides>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let agent = mesh.update(&id, overrides).map_err(domain)?;
    Ok(Json(json!({ "agent": agent })))
}

async fn mesh_unregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    mesh.unregister(&id).map_err(domain)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn mesh_inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let agent = mesh.inspect(&id).map_err(domain)?;
    Ok(Json(json!({ "agent": agent })))
}

async fn mesh_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let seen = mesh.heartbeat(&id).map_err(domain)?;
    Ok(Json(SuccessResponse { success: seen }))
}

async fn mesh_deny(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DenyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let record = mesh
        .deny(&body.path, body.reason, Some(client_id(&headers)))
        .map_err(domain)?;
    Ok(Json(json!({ "denial": record })))
}

async fn mesh_denied(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let denied = mesh.list_denied().map_err(domain)?;
    Ok(Json(json!({ "denied": denied })))
}

async fn mesh_undeny(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let deleted = mesh.undeny(&path).map_err(domain)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn mesh_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let status = mesh.status().map_err(domain)?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn mesh_topology(
    State(state): State<AppState>,
    Query(query): Query<TopologyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = state.mesh().map_err(ApiError)?;
    let namespace = query.namespace.as_deref().unwrap_or("*");
    let view = mesh.get_topology(namespace).map_err(domain)?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

// ============================================================
// Config
// ============================================================

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config_view())
}

async fn get_version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// ============================================================
// Error mapping
// ============================================================

/// Transport-facing error wrapper. Domain codes map to 4xx; anything
/// `INTERNAL_ERROR` is a 500 whose message is suppressed in production.
pub struct ApiError(pub DomainError);

fn domain<E: Into<DomainError>>(err: E) -> ApiError {
    ApiError(err.into())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = self.0;
        let status = StatusCode::from_u16(error.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(code = %error.code, message = %error.message, "Request failed");
            if PRODUCTION.get().copied().unwrap_or(false) {
                error.message = "internal error".to_string();
                error.details = None;
            }
        } else {
            tracing::warn!(code = %error.code, message = %error.message, "Domain error");
        }

        (status, Json(ErrorResponse::new(error))).into_response()
    }
}
