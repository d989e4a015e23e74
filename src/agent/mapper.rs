//! Translates runtime messages into stream events.
//!
//! The mapper is pure apart from its tool-state accumulator: it tracks
//! in-flight tool calls so `tool_call_end` can be annotated with the gate's
//! decision, announces the runtime session id exactly once, and guarantees a
//! terminal `done` even when the runtime exits without one.

use std::collections::HashMap;

use super::runtime::RuntimeMessage;
use crate::events::{AgentStatus, StreamEvent};

#[derive(Default)]
pub struct EventMapper {
    /// Tool-call id -> tool name, for calls currently streaming.
    in_flight: HashMap<String, String>,
    session_announced: bool,
    done_emitted: bool,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one runtime message to zero or more stream events.
    /// `decisions` carries the gate's per-tool-call verdicts.
    pub fn map(
        &mut self,
        message: RuntimeMessage,
        decisions: &HashMap<String, bool>,
    ) -> Vec<StreamEvent> {
        match message {
            RuntimeMessage::SessionStarted { session_id } => {
                if self.session_announced {
                    return Vec::new();
                }
                self.session_announced = true;
                vec![
                    StreamEvent::SessionStatus { session_id },
                    StreamEvent::Status {
                        state: AgentStatus::Running,
                    },
                ]
            }
            RuntimeMessage::TextDelta { text } => vec![StreamEvent::TextDelta { text }],
            RuntimeMessage::ToolUseStart { id, name, input } => {
                self.in_flight.insert(id.clone(), name.clone());
                vec![StreamEvent::ToolCallStart {
                    id,
                    name,
                    input: Some(input),
                }]
            }
            RuntimeMessage::ToolUseDelta { id, delta } => {
                vec![StreamEvent::ToolCallDelta { id, delta }]
            }
            RuntimeMessage::ToolUseEnd {
                id,
                output,
                is_error: _,
            } => {
                self.in_flight.remove(&id);
                let approved = decisions.get(&id).copied();
                let output = (!output.is_null()).then_some(output);
                vec![StreamEvent::ToolCallEnd {
                    id,
                    approved,
                    output,
                }]
            }
            RuntimeMessage::TaskProgress {
                id,
                subject,
                status,
            } => vec![StreamEvent::Task {
                id,
                subject,
                status,
            }],
            RuntimeMessage::Completed { usage } => {
                self.done_emitted = true;
                vec![
                    StreamEvent::Status {
                        state: AgentStatus::Idle,
                    },
                    StreamEvent::Done { usage },
                ]
            }
            RuntimeMessage::Error { message } => {
                self.done_emitted = true;
                vec![StreamEvent::error(
                    crate::error::ErrorCode::InternalError,
                    message,
                )]
            }
        }
    }

    /// Synthetic `done` for runtimes that end the stream without one.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.done_emitted {
            None
        } else {
            self.done_emitted = true;
            Some(StreamEvent::Done { usage: None })
        }
    }

    pub fn session_announced(&self) -> bool {
        self.session_announced
    }
}
