//! The unified stream event union.
//!
//! Produced by the Agent Manager (and a few peripheral sources: the session
//! broadcaster, Relay-backed runs) and consumed by every transport. Each
//! variant carries exactly the fields clients read; the SSE layer uses
//! [`StreamEvent::event_name`] for the `event:` field and serializes the
//! payload as a single JSON line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Agent activity, surfaced through `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Idle,
}

/// One question inside a `question_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Token usage reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    ToolCallDelta {
        id: String,
        delta: String,
    },
    ToolCallEnd {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        approved: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    ToolApprovalRequest {
        id: String,
        name: String,
        input: Value,
    },
    QuestionRequest {
        id: String,
        questions: Vec<Question>,
    },
    Status {
        state: AgentStatus,
    },
    SessionStatus {
        session_id: String,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A nested event from a Relay-backed run, re-published on the bus.
    RelayMessage {
        subject: String,
        message_id: String,
        payload: Value,
    },
    /// Terminates a Relay-backed run's response stream.
    RelayReceipt {
        message_id: String,
        status: String,
    },
    MessageDelivered {
        message_id: String,
        delivered_to: usize,
    },
    /// An external transcript change observed by the session broadcaster.
    SyncUpdate {
        session_id: String,
    },
    /// Structured task progress reported by the runtime.
    Task {
        id: String,
        subject: String,
        status: String,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::ToolApprovalRequest { .. } => "tool_approval_request",
            Self::QuestionRequest { .. } => "question_request",
            Self::Status { .. } => "status",
            Self::SessionStatus { .. } => "session_status",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::RelayMessage { .. } => "relay_message",
            Self::RelayReceipt { .. } => "relay_receipt",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::SyncUpdate { .. } => "sync_update",
            Self::Task { .. } => "task",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: Some(code),
            message: Some(message.into()),
            path: None,
        }
    }

    pub fn boundary_violation(path: impl Into<String>) -> Self {
        Self::Error {
            code: Some(ErrorCode::BoundaryViolation),
            message: None,
            path: Some(path.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_event_name() {
        let event = StreamEvent::TextDelta {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_name());
    }

    #[test]
    fn boundary_error_payload_shape() {
        let event = StreamEvent::boundary_violation("/etc");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "BOUNDARY_VIOLATION");
        assert_eq!(json["path"], "/etc");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let events = vec![
            StreamEvent::ToolCallStart {
                id: "t1".to_string(),
                name: "Write".to_string(),
                input: None,
            },
            StreamEvent::ToolCallEnd {
                id: "t1".to_string(),
                approved: Some(false),
                output: None,
            },
            StreamEvent::Done { usage: None },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: StreamEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }
}
