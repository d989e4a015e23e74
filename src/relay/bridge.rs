//! Relay-to-agent bridge.
//!
//! Two traffic sources land here: inbound adapter messages (resolved
//! through the binding store) and Pulse run requests published on
//! `relay.system.pulse.{scheduleId}`. Both turn into Agent Manager runs
//! whose events flow back over the bus as `relay_message` envelopes,
//! closed by a `relay_receipt`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::adapters::InboundSink;
use super::bindings::BindingStore;
use super::envelope::Envelope;
use super::{PublishOptions, Relay};
use crate::agent::runtime::PermissionMode;
use crate::agent::{AgentManager, SendOptions};
use crate::events::{StreamEvent, Usage};

/// Subject prefix Pulse publishes run requests on.
pub const PULSE_REQUEST_PREFIX: &str = "relay.system.pulse";
/// Subject prefix for per-run response streams.
pub const PULSE_RESPONSE_PREFIX: &str = "relay.system.pulse.response";

/// Final state of a bridged run, folded into its receipt.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub status: String,
    pub session_id: Option<String>,
    pub output: Option<String>,
    pub usage: Option<Usage>,
}

pub struct RelayAgentBridge {
    relay: Arc<Relay>,
    bindings: Arc<BindingStore>,
    agent: Arc<AgentManager>,
    /// Response subject -> cancellation token for in-flight runs.
    active_runs: Mutex<HashMap<String, CancellationToken>>,
}

impl RelayAgentBridge {
    pub fn new(
        relay: Arc<Relay>,
        bindings: Arc<BindingStore>,
        agent: Arc<AgentManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            bindings,
            agent,
            active_runs: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe the bridge to Pulse run-request traffic.
    pub fn install(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let callback: super::DeliveryCallback = Arc::new(move |envelope: Envelope| {
            let bridge = Arc::clone(&bridge);
            Box::pin(async move {
                bridge.handle_pulse_envelope(envelope).await;
                Ok(())
            })
        });
        if let Err(e) = self.relay.subscribe(
            &format!("{PULSE_REQUEST_PREFIX}.>"),
            callback,
            json!({ "role": "agent-bridge" }),
        ) {
            tracing::warn!(target: "relay", error = %e, "Bridge subscription failed");
        }
    }

    /// Pulse traffic arrives on both request and response subjects (the
    /// request pattern covers both); response-side envelopes only matter
    /// when they carry a cancellation.
    async fn handle_pulse_envelope(&self, envelope: Envelope) {
        if envelope.subject.starts_with(PULSE_RESPONSE_PREFIX) {
            if envelope.payload.get("type").and_then(Value::as_str) == Some("cancel") {
                let token = self.active_runs.lock().await.get(&envelope.subject).cloned();
                if let Some(token) = token {
                    token.cancel();
                }
            }
            return;
        }

        let Some(reply_to) = envelope.reply_to.clone() else {
            tracing::warn!(target: "relay", subject = %envelope.subject, "Pulse request without replyTo");
            return;
        };
        let payload = &envelope.payload;
        let Some(prompt) = payload.get("prompt").and_then(Value::as_str) else {
            return;
        };
        let session_key = payload
            .get("runId")
            .and_then(Value::as_str)
            .unwrap_or(&envelope.message_id)
            .to_string();
        let cwd = payload
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        let permission_mode = payload
            .get("permissionMode")
            .and_then(|v| serde_json::from_value::<PermissionMode>(v.clone()).ok());
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .map(String::from);
        let max_runtime = payload
            .get("maxRuntimeMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        let suffix = payload
            .get("systemPromptAppend")
            .and_then(Value::as_str)
            .map(String::from);

        let token = CancellationToken::new();
        self.active_runs
            .lock()
            .await
            .insert(reply_to.clone(), token.clone());

        self.run_and_stream(
            &session_key,
            prompt.to_string(),
            SendOptions {
                cwd,
                permission_mode,
                model,
                system_prompt_append: suffix,
            },
            &reply_to,
            token,
            max_runtime,
        )
        .await;

        self.active_runs.lock().await.remove(&reply_to);
    }

    /// Run a session and mirror its events onto `response_subject`,
    /// closing with a receipt that carries the run summary.
    pub async fn run_and_stream(
        &self,
        session_key: &str,
        prompt: String,
        opts: SendOptions,
        response_subject: &str,
        cancel: CancellationToken,
        max_runtime: Option<Duration>,
    ) -> RunSummary {
        let mut summary = RunSummary {
            status: "completed".to_string(),
            ..RunSummary::default()
        };

        let stream = match self.agent.send_message(session_key, prompt, opts).await {
            Ok(stream) => stream,
            Err(e) => {
                summary.status = "failed".to_string();
                summary.output = Some(e.to_string());
                self.publish_receipt(response_subject, &summary).await;
                return summary;
            }
        };
        tokio::pin!(stream);

        let deadline = max_runtime.map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let next = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, stream.next()).await,
                    None => Ok(stream.next().await),
                }
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    self.agent.interrupt(session_key).await;
                    summary.status = "cancelled".to_string();
                    break;
                }
                result = next => {
                    let event = match result {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(_) => {
                            self.agent.interrupt(session_key).await;
                            summary.status = "cancelled".to_string();
                            summary.output = Some("run exceeded max runtime".to_string());
                            break;
                        }
                    };
                    self.track(&mut summary, &event);
                    self.publish_event(response_subject, &event).await;
                    if event.is_terminal() {
                        break;
                    }
                }
            }
        }

        self.publish_receipt(response_subject, &summary).await;
        summary
    }

    fn track(&self, summary: &mut RunSummary, event: &StreamEvent) {
        match event {
            StreamEvent::SessionStatus { session_id } => {
                summary.session_id = Some(session_id.clone());
            }
            StreamEvent::TextDelta { text } => match &mut summary.output {
                Some(output) => output.push_str(text),
                None => summary.output = Some(text.clone()),
            },
            StreamEvent::Done { usage } => {
                summary.usage = *usage;
            }
            StreamEvent::Error { message, .. } => {
                summary.status = "failed".to_string();
                if let Some(message) = message {
                    summary.output = Some(message.clone());
                }
            }
            _ => {}
        }
    }

    async fn publish_event(&self, response_subject: &str, event: &StreamEvent) {
        let payload = serde_json::to_value(event).unwrap_or(Value::Null);
        if let Err(e) = self
            .relay
            .publish(
                response_subject,
                payload,
                PublishOptions {
                    from: PULSE_REQUEST_PREFIX.to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
        {
            tracing::debug!(target: "relay", error = %e, "Response event publish failed");
        }
    }

    async fn publish_receipt(&self, response_subject: &str, summary: &RunSummary) {
        let payload = json!({
            "type": "relay_receipt",
            "status": summary.status,
            "sessionId": summary.session_id,
            "output": summary.output,
            "usage": summary.usage,
        });
        if let Err(e) = self
            .relay
            .publish(
                response_subject,
                payload,
                PublishOptions {
                    from: PULSE_REQUEST_PREFIX.to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
        {
            tracing::debug!(target: "relay", error = %e, "Receipt publish failed");
        }
    }
}

#[async_trait]
impl InboundSink for RelayAgentBridge {
    /// Resolve bindings for an inbound adapter message and start one run
    /// per match, streaming responses on `relay.response.{messageId}`.
    async fn on_inbound(&self, adapter_id: &str, envelope: &Envelope) {
        let bindings = match self.bindings.for_adapter(adapter_id) {
            Ok(bindings) => bindings,
            Err(e) => {
                tracing::warn!(target: "relay", error = %e, "Binding lookup failed");
                return;
            }
        };

        let chat_id = envelope.payload.get("chatId").and_then(Value::as_str);
        let channel_type = envelope.payload.get("channelType").and_then(Value::as_str);
        let Some(text) = envelope.payload.get("text").and_then(Value::as_str) else {
            return;
        };

        for binding in bindings
            .into_iter()
            .filter(|b| b.matches(chat_id, channel_type))
        {
            let session_key = binding.session_key(chat_id, channel_type);
            let response_subject = format!("relay.response.{}", envelope.message_id);
            let summary = self
                .run_and_stream(
                    &session_key,
                    text.to_string(),
                    SendOptions {
                        cwd: Some(binding.agent_dir.clone()),
                        ..SendOptions::default()
                    },
                    &response_subject,
                    CancellationToken::new(),
                    None,
                )
                .await;
            tracing::info!(
                target: "relay",
                adapter = adapter_id,
                binding = %binding.id,
                status = %summary.status,
                "Bound agent run finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{manager_with, MockBehavior};
    use crate::ids::IdGenerator;
    use crate::relay::bindings::{NewBinding, SessionStrategy};
    use crate::relay::trace::TraceStore;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(
            Arc::new(IdGenerator::new()),
            Some(Arc::new(TraceStore::open_in_memory().unwrap())),
        ))
    }

    fn collector(
        relay: &Arc<Relay>,
        pattern: &str,
    ) -> Arc<StdMutex<Vec<Envelope>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        relay
            .subscribe(
                pattern,
                Arc::new(move |envelope| {
                    let seen = Arc::clone(&seen_inner);
                    Box::pin(async move {
                        seen.lock().unwrap().push(envelope);
                        Ok(())
                    })
                }),
                Value::Null,
            )
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn inbound_message_runs_bound_agent_and_streams_response() {
        let temp = TempDir::new().unwrap();
        let relay = relay();
        let bindings = Arc::new(BindingStore::open_in_memory().unwrap());
        let agent = manager_with(MockBehavior::Echo, temp.path());
        bindings
            .create(NewBinding {
                adapter_id: "chat-1".to_string(),
                agent_id: "a".to_string(),
                agent_dir: temp.path().to_path_buf(),
                session_strategy: SessionStrategy::PerUser,
                chat_id: None,
                channel_type: None,
                label: None,
            })
            .unwrap();

        let bridge = RelayAgentBridge::new(Arc::clone(&relay), bindings, agent);
        let seen = collector(&relay, "relay.response.>");

        let envelope = Envelope {
            message_id: "msg-1".to_string(),
            subject: "relay.ext.chat1.inbound".to_string(),
            from: "relay.ext.chat1".to_string(),
            reply_to: None,
            payload: json!({ "chatId": "u1", "text": "hello there" }),
            trace_id: "t1".to_string(),
            parent_id: None,
            published_at: chrono::Utc::now(),
            budget: super::super::envelope::Budget::effective(None, chrono::Utc::now()),
        };
        bridge.on_inbound("chat-1", &envelope).await;

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|e| e.subject == "relay.response.msg-1"));
        // Stream closes with a receipt.
        let last = seen.last().unwrap();
        assert_eq!(last.payload["type"], "relay_receipt");
        assert_eq!(last.payload["status"], "completed");
        assert!(last.payload["sessionId"].is_string());
    }

    #[tokio::test]
    async fn pulse_request_streams_to_reply_subject() {
        let temp = TempDir::new().unwrap();
        let relay = relay();
        let bindings = Arc::new(BindingStore::open_in_memory().unwrap());
        let agent = manager_with(MockBehavior::Echo, temp.path());
        let bridge = RelayAgentBridge::new(Arc::clone(&relay), bindings, agent);
        bridge.install();

        let reply_to = format!("{PULSE_RESPONSE_PREFIX}.run-1");
        let seen = collector(&relay, &reply_to);

        relay
            .publish(
                &format!("{PULSE_REQUEST_PREFIX}.sched-1"),
                json!({
                    "runId": "run-1",
                    "prompt": "do the thing",
                    "cwd": temp.path().to_string_lossy(),
                }),
                PublishOptions {
                    from: format!("{PULSE_REQUEST_PREFIX}.sched-1"),
                    reply_to: Some(reply_to.clone()),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let last = seen.last().unwrap();
        assert_eq!(last.payload["type"], "relay_receipt");
        assert_eq!(last.payload["status"], "completed");
    }

    #[tokio::test]
    async fn unmatched_binding_filter_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let relay = relay();
        let bindings = Arc::new(BindingStore::open_in_memory().unwrap());
        bindings
            .create(NewBinding {
                adapter_id: "chat-1".to_string(),
                agent_id: "a".to_string(),
                agent_dir: temp.path().to_path_buf(),
                session_strategy: SessionStrategy::PerChat,
                chat_id: Some("room-9".to_string()),
                channel_type: None,
                label: None,
            })
            .unwrap();
        let agent = manager_with(MockBehavior::Echo, temp.path());
        let bridge = RelayAgentBridge::new(Arc::clone(&relay), bindings, agent);
        let seen = collector(&relay, "relay.response.>");

        let envelope = Envelope {
            message_id: "msg-2".to_string(),
            subject: "relay.ext.chat1.inbound".to_string(),
            from: "relay.ext.chat1".to_string(),
            reply_to: None,
            payload: json!({ "chatId": "other-room", "text": "hi" }),
            trace_id: "t2".to_string(),
            parent_id: None,
            published_at: chrono::Utc::now(),
            budget: super::super::envelope::Budget::effective(None, chrono::Utc::now()),
        };
        bridge.on_inbound("chat-1", &envelope).await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
