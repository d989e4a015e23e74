//! Agent Manager: owns live LLM sessions.
//!
//! The only component that invokes the LLM runtime. Maintains the session
//! map with its reverse index, per-session write locks, pending tool
//! approvals/questions, and the streaming merge between the runtime's
//! message stream and the per-session injected-event queue.

pub mod context;
pub mod locks;
pub mod mapper;
pub mod runtime;
pub mod session;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::boundary::BoundaryGuard;
use crate::error::{DomainError, ErrorCode};
use crate::events::{Question, StreamEvent};
use crate::mcp::ToolServer;
use context::ServerInfo;
use locks::SessionLockManager;
use mapper::EventMapper;
use runtime::{
    is_resume_failure, AgentRuntime, ApprovalDecision, ModelInfo, PermissionMode, QueryOptions,
    RuntimeMessage, ToolGate,
};
use session::{PendingInteraction, Session};

pub const MAX_SESSIONS: usize = 100;
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Built-in edit tools auto-allowed under `acceptEdits`.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Read-only tools allowed under `plan`.
const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebFetch", "WebSearch", "TodoWrite"];

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("session limit reached ({} live sessions)", MAX_SESSIONS)]
    SessionLimit,
}

impl From<AgentError> for DomainError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::SessionLimit => {
                DomainError::new(ErrorCode::SessionLimit, err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    pub permission_mode: Option<PermissionMode>,
    pub cwd: Option<PathBuf>,
    pub has_started: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub permission_mode: Option<PermissionMode>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub system_prompt_append: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub permission_mode: Option<PermissionMode>,
    pub model: Option<String>,
}

type SharedSession = Arc<Mutex<Session>>;
type ToolServerFactory = Arc<dyn Fn() -> ToolServer + Send + Sync>;

pub struct AgentManager {
    runtime: Arc<dyn AgentRuntime>,
    boundary: Arc<BoundaryGuard>,
    server_info: ServerInfo,
    default_cwd: PathBuf,
    sessions: StdMutex<HashMap<String, SharedSession>>,
    /// Runtime session id -> session key.
    reverse: StdMutex<HashMap<String, String>>,
    locks: SessionLockManager,
    tool_server_factory: StdRwLock<Option<ToolServerFactory>>,
    models_cache: tokio::sync::RwLock<Option<Vec<ModelInfo>>>,
}

impl AgentManager {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        boundary: Arc<BoundaryGuard>,
        server_info: ServerInfo,
        default_cwd: PathBuf,
    ) -> Self {
        Self {
            runtime,
            boundary,
            server_info,
            default_cwd,
            sessions: StdMutex::new(HashMap::new()),
            reverse: StdMutex::new(HashMap::new()),
            locks: SessionLockManager::new(),
            tool_server_factory: StdRwLock::new(None),
            models_cache: tokio::sync::RwLock::new(None),
        }
    }

    /// The MCP registry hands its factory over at startup; each query gets a
    /// freshly built server instance.
    pub fn set_tool_server_factory(&self, factory: ToolServerFactory) {
        *self.tool_server_factory.write().unwrap() = Some(factory);
    }

    pub fn locks(&self) -> &SessionLockManager {
        &self.locks
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Create the session record if none exists. Idempotent.
    pub fn ensure_session(&self, session_key: &str, opts: EnsureOptions) -> Result<(), AgentError> {
        self.ensure_and_get(session_key, opts).map(|_| ())
    }

    fn ensure_and_get(
        &self,
        session_key: &str,
        opts: EnsureOptions,
    ) -> Result<SharedSession, AgentError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(shared) = sessions.get(session_key) {
            return Ok(Arc::clone(shared));
        }
        if sessions.len() >= MAX_SESSIONS {
            return Err(AgentError::SessionLimit);
        }

        let mut session = Session::new(session_key);
        if let Some(mode) = opts.permission_mode {
            session.permission_mode = mode;
        }
        session.cwd = opts.cwd;
        session.has_started = opts.has_started.unwrap_or(false);

        let shared = Arc::new(Mutex::new(session));
        sessions.insert(session_key.to_string(), Arc::clone(&shared));
        self.reverse
            .lock()
            .unwrap()
            .insert(session_key.to_string(), session_key.to_string());
        Ok(shared)
    }

    fn get(&self, session_key: &str) -> Option<SharedSession> {
        self.sessions.lock().unwrap().get(session_key).cloned()
    }

    /// Session key for a runtime-assigned session id, via the reverse index.
    pub fn session_key_for_sdk_id(&self, sdk_session_id: &str) -> Option<String> {
        self.reverse.lock().unwrap().get(sdk_session_id).cloned()
    }

    pub fn session_view(&self, session_key: &str) -> Option<Value> {
        let shared = self.get(session_key)?;
        let session = shared.try_lock().ok()?;
        Some(session::session_view(&session))
    }

    /// Send a message into a session, returning the event stream.
    ///
    /// Auto-creates the session. Boundary violations terminate the stream
    /// with a single `error` event; `SESSION_LIMIT` fails the call itself.
    pub async fn send_message(
        self: &Arc<Self>,
        session_key: &str,
        content: String,
        opts: SendOptions,
    ) -> Result<ReceiverStream<StreamEvent>, AgentError> {
        let shared = self.ensure_and_get(
            session_key,
            EnsureOptions {
                permission_mode: opts.permission_mode,
                cwd: opts.cwd.clone(),
                has_started: None,
            },
        )?;

        let (tx, rx) = mpsc::channel::<StreamEvent>(256);

        let effective_cwd = {
            let mut session = shared.lock().await;
            session.touch();
            if let Some(mode) = opts.permission_mode {
                session.permission_mode = mode;
            }
            if let Some(model) = opts.model.clone() {
                session.model = Some(model);
            }
            if let Some(cwd) = opts.cwd.clone() {
                session.cwd = Some(cwd);
            }
            session
                .cwd
                .clone()
                .unwrap_or_else(|| self.default_cwd.clone())
        };

        let cwd = match self.boundary.validate(&effective_cwd) {
            Ok(cwd) => cwd,
            Err(_) => {
                let _ = tx
                    .send(StreamEvent::boundary_violation(
                        effective_cwd.to_string_lossy(),
                    ))
                    .await;
                return Ok(ReceiverStream::new(rx));
            }
        };

        let manager = Arc::clone(self);
        let key = session_key.to_string();
        tokio::spawn(async move {
            manager
                .drive_query(&key, shared, content, cwd, opts.system_prompt_append, tx)
                .await;
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Run one query to completion, retrying once as a fresh session when a
    /// resume target has gone stale.
    async fn drive_query(
        self: Arc<Self>,
        session_key: &str,
        shared: SharedSession,
        content: String,
        cwd: PathBuf,
        caller_suffix: Option<String>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let base_context = context::build_context(&self.server_info, &cwd).await;

        for attempt in 0..2 {
            let (options, gate) = {
                let session = shared.lock().await;
                let mut suffix = base_context.clone();
                for extra in [session.system_prompt_suffix.as_ref(), caller_suffix.as_ref()] {
                    if let Some(extra) = extra {
                        suffix.push_str("\n\n");
                        suffix.push_str(extra);
                    }
                }
                let options = QueryOptions {
                    cwd: cwd.clone(),
                    resume: session.has_started.then(|| session.sdk_session_id.clone()),
                    permission_mode: session.permission_mode,
                    allow_dangerously_skip_permissions: session.permission_mode
                        == PermissionMode::BypassPermissions,
                    model: session.model.clone(),
                    system_prompt_append: Some(suffix),
                };
                let gate: Arc<dyn ToolGate> = Arc::new(SessionGate {
                    session: Arc::clone(&shared),
                });
                (options, gate)
            };
            let resuming = options.resume.is_some();

            let tool_server = self
                .tool_server_factory
                .read()
                .unwrap()
                .as_ref()
                .map(|factory| factory());

            let query = match self
                .runtime
                .start_query(content.clone(), options, tool_server, gate)
                .await
            {
                Ok(query) => query,
                Err(e) if resuming && attempt == 0 && e.is_resume_failure() => {
                    tracing::info!(session = session_key, "Stale resume target, retrying fresh");
                    shared.lock().await.has_started = false;
                    continue;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::error(ErrorCode::InternalError, e.to_string()))
                        .await;
                    return;
                }
            };

            {
                let mut session = shared.lock().await;
                session.has_started = true;
                session.active_query = Some(Arc::clone(&query.control));
            }

            let outcome = self
                .stream_query(session_key, &shared, query, resuming && attempt == 0, &tx)
                .await;

            shared.lock().await.active_query = None;

            match outcome {
                StreamOutcome::Finished => return,
                StreamOutcome::RetryFresh => {
                    shared.lock().await.has_started = false;
                }
            }
        }
    }

    /// Merge the runtime's stream with the session's injected-event queue.
    ///
    /// Buffered runtime messages are preferred over queued injections so
    /// interaction events queued by the gate sort after the tool events
    /// that caused them.
    async fn stream_query(
        &self,
        session_key: &str,
        shared: &SharedSession,
        mut query: runtime::RuntimeQuery,
        may_retry: bool,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> StreamOutcome {
        let mut mapper = EventMapper::new();
        let notify = shared.lock().await.notify.clone();

        loop {
            while let Ok(message) = query.messages.try_recv() {
                if let Some(outcome) = self
                    .handle_message(session_key, shared, &mut mapper, message, may_retry, &query, tx)
                    .await
                {
                    return outcome;
                }
            }

            // Drain injected events once buffered runtime messages are out.
            let queued: Vec<StreamEvent> = {
                let mut session = shared.lock().await;
                session.queue.drain(..).collect()
            };
            for event in queued {
                if tx.send(event).await.is_err() {
                    query.control.interrupt().await;
                    return StreamOutcome::Finished;
                }
            }

            tokio::select! {
                biased;
                message = query.messages.recv() => {
                    let Some(message) = message else {
                        if let Some(done) = mapper.finish() {
                            let _ = tx.send(done).await;
                        }
                        return StreamOutcome::Finished;
                    };
                    if let Some(outcome) = self
                        .handle_message(session_key, shared, &mut mapper, message, may_retry, &query, tx)
                        .await
                    {
                        return outcome;
                    }
                }
                () = notify.notified() => {
                    // Queue gained an entry; loop back to drain it.
                }
            }
        }
    }

    /// Process one runtime message. `Some(outcome)` terminates the stream.
    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &self,
        session_key: &str,
        shared: &SharedSession,
        mapper: &mut EventMapper,
        message: RuntimeMessage,
        may_retry: bool,
        query: &runtime::RuntimeQuery,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Option<StreamOutcome> {
        if let RuntimeMessage::Error { message: text } = &message {
            if may_retry && is_resume_failure(text) {
                return Some(StreamOutcome::RetryFresh);
            }
        }

        if let RuntimeMessage::SessionStarted { session_id } = &message {
            self.adopt_sdk_session_id(session_key, shared, session_id).await;
        }

        let decisions = shared.lock().await.tool_decisions.clone();
        for event in mapper.map(message, &decisions) {
            if tx.send(event).await.is_err() {
                query.control.interrupt().await;
                return Some(StreamOutcome::Finished);
            }
        }
        None
    }

    /// The runtime assigned its own session id: update the session record
    /// and the reverse index under one guard each.
    async fn adopt_sdk_session_id(
        &self,
        session_key: &str,
        shared: &SharedSession,
        sdk_session_id: &str,
    ) {
        let previous = {
            let mut session = shared.lock().await;
            let previous = std::mem::replace(
                &mut session.sdk_session_id,
                sdk_session_id.to_string(),
            );
            session.touch();
            previous
        };
        let mut reverse = self.reverse.lock().unwrap();
        reverse.remove(&previous);
        reverse.insert(sdk_session_id.to_string(), session_key.to_string());
    }

    /// Inject an event into a session's live stream. Returns false when the
    /// session does not exist.
    #[allow(dead_code)] // In-process callers push events into active runs
    pub async fn inject_event(&self, session_key: &str, event: StreamEvent) -> bool {
        let Some(shared) = self.get(session_key) else {
            return false;
        };
        shared.lock().await.inject_event(event);
        true
    }

    /// Apply permission-mode/model changes. Auto-creates the session as
    /// already-started, since an update implies resumption.
    pub async fn update_session(
        &self,
        session_key: &str,
        opts: UpdateOptions,
    ) -> Result<(), AgentError> {
        let shared = self.ensure_and_get(
            session_key,
            EnsureOptions {
                permission_mode: opts.permission_mode,
                cwd: None,
                has_started: Some(true),
            },
        )?;
        let control = {
            let mut session = shared.lock().await;
            session.touch();
            if let Some(model) = opts.model {
                session.model = Some(model);
            }
            if let Some(mode) = opts.permission_mode {
                session.permission_mode = mode;
                session.active_query.clone().map(|control| (control, mode))
            } else {
                None
            }
        };
        // Forward a live mode change to the in-flight query asynchronously.
        if let Some((control, mode)) = control {
            tokio::spawn(async move {
                control.set_permission_mode(mode).await;
            });
        }
        Ok(())
    }

    /// Resolve a pending tool approval. False when nothing matches.
    pub async fn approve_tool(&self, session_key: &str, tool_call_id: &str, approved: bool) -> bool {
        let Some(shared) = self.get(session_key) else {
            return false;
        };
        let mut session = shared.lock().await;
        session.touch();
        session.resolve_approval(tool_call_id, approved)
    }

    /// Resolve a pending question. False when nothing matches.
    pub async fn submit_answers(
        &self,
        session_key: &str,
        tool_call_id: &str,
        answers: HashMap<String, String>,
    ) -> bool {
        let Some(shared) = self.get(session_key) else {
            return false;
        };
        let mut session = shared.lock().await;
        session.touch();
        session.resolve_question(tool_call_id, answers)
    }

    /// Evict sessions idle past the timeout. Clears pending interaction
    /// timers, reverse-index entries, and any locks held for evicted keys.
    pub async fn check_session_health(&self) -> Vec<String> {
        let snapshot: Vec<(String, SharedSession)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut evicted = Vec::new();
        let mut stale_sdk_ids = Vec::new();
        for (key, shared) in snapshot {
            let mut session = shared.lock().await;
            if session.last_activity.elapsed() > SESSION_IDLE_TIMEOUT {
                session.clear_pending();
                stale_sdk_ids.push(session.sdk_session_id.clone());
                evicted.push(key);
            }
        }

        if !evicted.is_empty() {
            {
                let mut sessions = self.sessions.lock().unwrap();
                for key in &evicted {
                    sessions.remove(key);
                }
            }
            {
                let mut reverse = self.reverse.lock().unwrap();
                for sdk_id in &stale_sdk_ids {
                    reverse.remove(sdk_id);
                }
            }
            self.locks.cleanup(&evicted);
            tracing::info!(count = evicted.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Periodic health sweep.
    pub fn spawn_health_sweep(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.check_session_health().await;
            }
        })
    }

    /// Cached model catalog; the first call refreshes from the runtime.
    pub async fn get_supported_models(&self) -> Vec<ModelInfo> {
        if let Some(models) = self.models_cache.read().await.as_ref() {
            return models.clone();
        }
        let mut cache = self.models_cache.write().await;
        if let Some(models) = cache.as_ref() {
            return models.clone();
        }
        match self.runtime.list_models().await {
            Ok(models) => {
                *cache = Some(models.clone());
                models
            }
            Err(e) => {
                tracing::warn!(error = %e, "Model catalog refresh failed");
                Vec::new()
            }
        }
    }

    /// Interrupt the in-flight query for a session, if any.
    pub async fn interrupt(&self, session_key: &str) -> bool {
        let Some(shared) = self.get(session_key) else {
            return false;
        };
        let control = shared.lock().await.active_query.clone();
        match control {
            Some(control) => {
                control.interrupt().await;
                true
            }
            None => false,
        }
    }
}

enum StreamOutcome {
    Finished,
    RetryFresh,
}

/// Per-session tool gate bound into each runtime query.
struct SessionGate {
    session: SharedSession,
}

#[async_trait]
impl ToolGate for SessionGate {
    async fn approve_tool(
        &self,
        tool_call_id: &str,
        name: &str,
        input: &Value,
    ) -> ApprovalDecision {
        let rx = {
            let mut session = self.session.lock().await;
            match session.permission_mode {
                PermissionMode::BypassPermissions => {
                    session.record_decision(tool_call_id, true);
                    return ApprovalDecision::Allow;
                }
                PermissionMode::Plan => {
                    let allowed = READ_ONLY_TOOLS.contains(&name);
                    session.record_decision(tool_call_id, allowed);
                    return if allowed {
                        ApprovalDecision::Allow
                    } else {
                        ApprovalDecision::Deny
                    };
                }
                PermissionMode::AcceptEdits if EDIT_TOOLS.contains(&name) => {
                    session.record_decision(tool_call_id, true);
                    return ApprovalDecision::Allow;
                }
                PermissionMode::AcceptEdits | PermissionMode::Default => {}
            }

            let (resolver, rx) = oneshot::channel();
            let timer = spawn_approval_timeout(Arc::clone(&self.session), tool_call_id.to_string());
            session.pending.insert(
                tool_call_id.to_string(),
                PendingInteraction::Approval { resolver, timer },
            );
            session.inject_event(StreamEvent::ToolApprovalRequest {
                id: tool_call_id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            });
            rx
        };

        // A dropped resolver (eviction, timeout race) is a deny.
        match rx.await {
            Ok(true) => ApprovalDecision::Allow,
            _ => ApprovalDecision::Deny,
        }
    }

    async fn ask(
        &self,
        tool_call_id: &str,
        questions: Vec<Question>,
    ) -> Option<HashMap<String, String>> {
        let rx = {
            let mut session = self.session.lock().await;
            let (resolver, rx) = oneshot::channel();
            let timer = spawn_question_timeout(Arc::clone(&self.session), tool_call_id.to_string());
            session.pending.insert(
                tool_call_id.to_string(),
                PendingInteraction::Question { resolver, timer },
            );
            session.inject_event(StreamEvent::QuestionRequest {
                id: tool_call_id.to_string(),
                questions,
            });
            rx
        };
        rx.await.ok()
    }
}

/// Deny the approval if it is still pending after the timeout.
fn spawn_approval_timeout(
    session: SharedSession,
    tool_call_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(APPROVAL_TIMEOUT).await;
        let mut session = session.lock().await;
        session.resolve_approval(&tool_call_id, false);
    })
}

/// Drop the question's resolver after the timeout; the gate observes `None`.
fn spawn_question_timeout(
    session: SharedSession,
    tool_call_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(APPROVAL_TIMEOUT).await;
        let mut session = session.lock().await;
        if let Some(pending) = session.pending.remove(&tool_call_id) {
            pending.cancel();
        }
    })
}
