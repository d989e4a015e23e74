//! Per-session state owned by the Agent Manager.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use super::runtime::{PermissionMode, QueryControl};
use crate::events::StreamEvent;

/// A pending tool approval or question, keyed by tool-call id. The resolver
/// is a oneshot the gate awaits; the timer denies after the timeout and is
/// aborted on resolution or eviction.
pub enum PendingInteraction {
    Approval {
        resolver: oneshot::Sender<bool>,
        timer: JoinHandle<()>,
    },
    Question {
        resolver: oneshot::Sender<HashMap<String, String>>,
        timer: JoinHandle<()>,
    },
}

impl PendingInteraction {
    pub fn cancel(self) {
        match self {
            Self::Approval { timer, .. } | Self::Question { timer, .. } => timer.abort(),
        }
    }
}

pub struct Session {
    pub key: String,
    /// The runtime's session id. Equals `key` at creation; may diverge once
    /// the runtime assigns its own id on first message.
    pub sdk_session_id: String,
    pub cwd: Option<PathBuf>,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub has_started: bool,
    pub last_activity: Instant,
    /// Tool-call id -> pending approval/question.
    pub pending: HashMap<String, PendingInteraction>,
    /// Events injected by other server code while a query streams.
    pub queue: VecDeque<StreamEvent>,
    /// Wakes the streaming loop when the queue gains an entry.
    pub notify: Arc<Notify>,
    /// Control handle for the in-flight query, if any.
    pub active_query: Option<Arc<dyn QueryControl>>,
    /// Gate decisions recorded per tool-call id, joined onto tool_call_end.
    pub tool_decisions: HashMap<String, bool>,
    pub system_prompt_suffix: Option<String>,
}

impl Session {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            sdk_session_id: key.to_string(),
            cwd: None,
            permission_mode: PermissionMode::Default,
            model: None,
            has_started: false,
            last_activity: Instant::now(),
            pending: HashMap::new(),
            queue: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            active_query: None,
            tool_decisions: HashMap::new(),
            system_prompt_suffix: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Push an event into the live stream and wake the merge loop.
    pub fn inject_event(&mut self, event: StreamEvent) {
        self.queue.push_back(event);
        self.notify.notify_one();
    }

    /// Drop every pending interaction, aborting its timer. Unresolved
    /// resolvers are dropped, which the awaiting gate observes as a deny.
    pub fn clear_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel();
        }
    }

    /// Resolve a pending approval. Returns false when no approval is
    /// pending under that id (or a question is).
    pub fn resolve_approval(&mut self, tool_call_id: &str, approved: bool) -> bool {
        match self.pending.get(tool_call_id) {
            Some(PendingInteraction::Approval { .. }) => {}
            _ => return false,
        }
        let Some(PendingInteraction::Approval { resolver, timer }) =
            self.pending.remove(tool_call_id)
        else {
            return false;
        };
        timer.abort();
        self.tool_decisions.insert(tool_call_id.to_string(), approved);
        resolver.send(approved).is_ok()
    }

    /// Resolve a pending question with structured answers.
    pub fn resolve_question(
        &mut self,
        tool_call_id: &str,
        answers: HashMap<String, String>,
    ) -> bool {
        match self.pending.get(tool_call_id) {
            Some(PendingInteraction::Question { .. }) => {}
            _ => return false,
        }
        let Some(PendingInteraction::Question { resolver, timer }) =
            self.pending.remove(tool_call_id)
        else {
            return false;
        };
        timer.abort();
        resolver.send(answers).is_ok()
    }

    /// Record a non-interactive gate decision (auto-allow/deny) so the
    /// event mapper can annotate the matching tool_call_end.
    pub fn record_decision(&mut self, tool_call_id: &str, approved: bool) {
        self.tool_decisions.insert(tool_call_id.to_string(), approved);
    }

    #[allow(dead_code)] // Used by tests and the approval summary route
    pub fn pending_interaction_ids(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }
}

/// JSON view of a session for the details route.
pub fn session_view(session: &Session) -> Value {
    serde_json::json!({
        "key": session.key,
        "sdkSessionId": session.sdk_session_id,
        "cwd": session.cwd,
        "permissionMode": session.permission_mode,
        "model": session.model,
        "hasStarted": session.has_started,
        "pendingInteractions": session.pending.len(),
        "queryInFlight": session.active_query.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_timer() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn approval_resolution_is_typed() {
        let mut session = Session::new("s1");
        let (tx, rx) = oneshot::channel();
        session.pending.insert(
            "t1".to_string(),
            PendingInteraction::Approval {
                resolver: tx,
                timer: dummy_timer(),
            },
        );

        // Wrong type: answering a question against an approval fails.
        assert!(!session.resolve_question("t1", HashMap::new()));
        assert!(session.resolve_approval("t1", true));
        assert!(rx.await.unwrap());

        // Already resolved.
        assert!(!session.resolve_approval("t1", true));
    }

    #[tokio::test]
    async fn clear_pending_drops_resolvers() {
        let mut session = Session::new("s1");
        let (tx, rx) = oneshot::channel::<bool>();
        session.pending.insert(
            "t1".to_string(),
            PendingInteraction::Approval {
                resolver: tx,
                timer: dummy_timer(),
            },
        );

        session.clear_pending();
        assert!(session.pending.is_empty());
        // The awaiting side observes the dropped sender.
        assert!(rx.await.is_err());
    }

    #[test]
    fn inject_event_queues_and_notifies() {
        let mut session = Session::new("s1");
        session.inject_event(StreamEvent::Done { usage: None });
        assert_eq!(session.queue.len(), 1);
    }
}
