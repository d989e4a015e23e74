//! Relay: in-process subject-based publish/subscribe with budget envelopes,
//! tracing, adapters, and agent bindings.

pub mod adapters;
pub mod bindings;
pub mod bridge;
pub mod envelope;
pub mod subject;
pub mod trace;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::{DomainError, ErrorCode};
use crate::events::StreamEvent;
use crate::ids::IdGenerator;
use envelope::{Budget, BudgetSpec, Envelope};
use subject::{validate_subject, SubjectError, SubjectPattern};
use trace::{SpanKind, TraceSpan, TraceStore};

/// Bounded per-endpoint inbox size; oldest entries fall off.
pub const INBOX_CAP: usize = 1000;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),
    #[error("access denied for {from} -> {subject}: {reason}")]
    AccessDenied {
        from: String,
        subject: String,
        reason: String,
    },
    #[error("no endpoint registered on {0}")]
    EndpointNotFound(String),
    #[error("endpoint registration failed: {0}")]
    Registration(String),
    #[error("inbox read failed: {0}")]
    InboxRead(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<RelayError> for DomainError {
    fn from(err: RelayError) -> Self {
        let code = match &err {
            RelayError::InvalidSubject(_) => ErrorCode::InvalidSubject,
            RelayError::AccessDenied { .. } => ErrorCode::AccessDenied,
            RelayError::EndpointNotFound(_) => ErrorCode::EndpointNotFound,
            RelayError::Registration(_) => ErrorCode::RegistrationFailed,
            RelayError::InboxRead(_) => ErrorCode::InboxReadFailed,
            RelayError::Publish(_) => ErrorCode::PublishFailed,
        };
        DomainError::new(code, err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

pub type DeliveryCallback =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// How a subscriber receives envelopes.
#[derive(Clone)]
pub enum DeliveryTarget {
    /// Async callback; failures dead-letter but do not fail the publish.
    Callback(DeliveryCallback),
    /// Durable bounded FIFO read through the inbox API.
    Inbox,
    /// Forwarded to an adapter's egress channel via the registry.
    Adapter(String),
}

#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub pattern: SubjectPattern,
    pub target: DeliveryTarget,
    pub metadata: Value,
}

/// Pluggable access-rule hook (wired to Mesh access rules when enabled).
pub trait AccessPolicy: Send + Sync {
    /// `Err(reason)` denies the publish.
    fn check(&self, from: &str, subject: &str) -> Result<(), String>;
}

/// Egress seam implemented by the adapter registry.
#[async_trait]
pub trait AdapterEgress: Send + Sync {
    async fn deliver(&self, adapter_id: &str, envelope: &Envelope) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    New,
    Cur,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub message_id: String,
    pub envelope: Envelope,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inbox {
    entries: std::collections::VecDeque<InboxEntry>,
    metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    pub subject: String,
    pub metadata: Value,
    pub inbox_size: usize,
    pub new_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPage {
    pub messages: Vec<InboxEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadInboxOptions {
    pub limit: Option<usize>,
    pub status: Option<InboxStatus>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub from: String,
    pub reply_to: Option<String>,
    pub budget: Option<BudgetSpec>,
    pub trace_id: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub message_id: String,
    pub delivered_to: usize,
    pub trace_id: String,
}

pub struct Relay {
    ids: Arc<IdGenerator>,
    subscriptions: StdRwLock<Vec<Subscription>>,
    inboxes: StdMutex<HashMap<String, Inbox>>,
    traces: Option<Arc<TraceStore>>,
    access: StdRwLock<Option<Arc<dyn AccessPolicy>>>,
    egress: StdRwLock<Option<Arc<dyn AdapterEgress>>>,
    /// Every successful publish is mirrored here for the relay SSE stream.
    events_tx: broadcast::Sender<StreamEvent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(ids: Arc<IdGenerator>, traces: Option<Arc<TraceStore>>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            ids,
            subscriptions: StdRwLock::new(Vec::new()),
            inboxes: StdMutex::new(HashMap::new()),
            traces,
            access: StdRwLock::new(None),
            egress: StdRwLock::new(None),
            events_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn traces(&self) -> Option<&Arc<TraceStore>> {
        self.traces.as_ref()
    }

    pub fn set_access_policy(&self, policy: Arc<dyn AccessPolicy>) {
        *self.access.write().unwrap() = Some(policy);
    }

    pub fn set_adapter_egress(&self, egress: Arc<dyn AdapterEgress>) {
        *self.egress.write().unwrap() = Some(egress);
    }

    /// Subscribe a callback under a (possibly wildcarded) pattern.
    pub fn subscribe(
        &self,
        pattern: &str,
        callback: DeliveryCallback,
        metadata: Value,
    ) -> RelayResult<String> {
        let pattern = SubjectPattern::compile(pattern)?;
        let id = self.ids.next();
        self.subscriptions.write().unwrap().push(Subscription {
            id: id.clone(),
            pattern,
            target: DeliveryTarget::Callback(callback),
            metadata,
        });
        Ok(id)
    }

    /// Subscribe an adapter's egress under its subject prefix.
    pub fn subscribe_adapter(&self, adapter_id: &str, prefix: &str) -> RelayResult<String> {
        let pattern = SubjectPattern::compile(&format!("{prefix}.>"))?;
        let id = self.ids.next();
        self.subscriptions.write().unwrap().push(Subscription {
            id: id.clone(),
            pattern,
            target: DeliveryTarget::Adapter(adapter_id.to_string()),
            metadata: serde_json::json!({ "adapterId": adapter_id }),
        });
        Ok(id)
    }

    /// Remove a subscription by id. Idempotent.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subscriptions.write().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != subscription_id);
        subs.len() != before
    }

    /// Register a durable endpoint on a concrete subject.
    pub fn register_endpoint(&self, subject: &str, metadata: Value) -> RelayResult<EndpointView> {
        validate_subject(subject)?;
        let mut inboxes = self.inboxes.lock().unwrap();
        if inboxes.contains_key(subject) {
            return Err(RelayError::Registration(format!(
                "endpoint already exists on {subject}"
            )));
        }
        inboxes.insert(
            subject.to_string(),
            Inbox {
                entries: std::collections::VecDeque::new(),
                metadata: metadata.clone(),
            },
        );
        drop(inboxes);

        let pattern = SubjectPattern::compile(subject)?;
        self.subscriptions.write().unwrap().push(Subscription {
            id: self.ids.next(),
            pattern,
            target: DeliveryTarget::Inbox,
            metadata: metadata.clone(),
        });

        Ok(EndpointView {
            subject: subject.to_string(),
            metadata,
            inbox_size: 0,
            new_count: 0,
        })
    }

    /// Remove an endpoint and its inbox. Idempotent.
    pub fn unregister_endpoint(&self, subject: &str) -> bool {
        let existed = self.inboxes.lock().unwrap().remove(subject).is_some();
        if existed {
            let mut subs = self.subscriptions.write().unwrap();
            subs.retain(|s| {
                !(matches!(s.target, DeliveryTarget::Inbox) && s.pattern.as_str() == subject)
            });
        }
        existed
    }

    pub fn list_endpoints(&self) -> Vec<EndpointView> {
        let inboxes = self.inboxes.lock().unwrap();
        let mut endpoints: Vec<EndpointView> = inboxes
            .iter()
            .map(|(subject, inbox)| EndpointView {
                subject: subject.clone(),
                metadata: inbox.metadata.clone(),
                inbox_size: inbox.entries.len(),
                new_count: inbox
                    .entries
                    .iter()
                    .filter(|e| e.status == InboxStatus::New)
                    .count(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.subject.cmp(&b.subject));
        endpoints
    }

    #[allow(dead_code)] // API completeness
    pub fn get_endpoint(&self, subject: &str) -> Option<EndpointView> {
        let inboxes = self.inboxes.lock().unwrap();
        inboxes.get(subject).map(|inbox| EndpointView {
            subject: subject.to_string(),
            metadata: inbox.metadata.clone(),
            inbox_size: inbox.entries.len(),
            new_count: inbox
                .entries
                .iter()
                .filter(|e| e.status == InboxStatus::New)
                .count(),
        })
    }

    /// Bounded, optionally filtered, cursor-paginated inbox view.
    pub fn read_inbox(&self, subject: &str, opts: ReadInboxOptions) -> RelayResult<InboxPage> {
        let inboxes = self.inboxes.lock().unwrap();
        let inbox = inboxes
            .get(subject)
            .ok_or_else(|| RelayError::EndpointNotFound(subject.to_string()))?;

        let limit = opts.limit.unwrap_or(50).min(INBOX_CAP);
        let entries: Vec<&InboxEntry> = inbox
            .entries
            .iter()
            .skip_while(|e| {
                opts.cursor
                    .as_ref()
                    .is_some_and(|cursor| e.message_id.as_str() <= cursor.as_str())
            })
            .filter(|e| opts.status.map_or(true, |status| e.status == status))
            .collect();

        let page: Vec<InboxEntry> = entries.iter().take(limit).map(|e| (*e).clone()).collect();
        let next_cursor = (entries.len() > limit)
            .then(|| page.last().map(|e| e.message_id.clone()))
            .flatten();

        Ok(InboxPage {
            messages: page,
            next_cursor,
        })
    }

    /// Flip an inbox entry's status (`new` -> `cur`/`failed`).
    #[allow(dead_code)] // Reserved for inbox consumers
    pub fn mark_inbox(&self, subject: &str, message_id: &str, status: InboxStatus) -> bool {
        let mut inboxes = self.inboxes.lock().unwrap();
        let Some(inbox) = inboxes.get_mut(subject) else {
            return false;
        };
        for entry in &mut inbox.entries {
            if entry.message_id == message_id {
                entry.status = status;
                return true;
            }
        }
        false
    }

    /// Subscribe to the relay's event mirror (SSE stream).
    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events_tx.subscribe()
    }

    /// Publish an envelope: validate, trace, apply access rules and budget,
    /// then fan out to every matching subscriber.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Value,
        options: PublishOptions,
    ) -> RelayResult<PublishReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Publish("relay is shut down".to_string()));
        }
        validate_subject(subject)?;

        let now = Utc::now();
        let message_id = self.ids.next();
        let trace_id = options.trace_id.clone().unwrap_or_else(|| self.ids.next());
        let envelope = Envelope {
            message_id: message_id.clone(),
            subject: subject.to_string(),
            from: options.from.clone(),
            reply_to: options.reply_to.clone(),
            payload,
            trace_id: trace_id.clone(),
            parent_id: options.parent_id.clone(),
            published_at: now,
            budget: Budget::effective(options.budget, now),
        };

        let publish_span_id = self.record_span(
            &envelope,
            SpanKind::Publish,
            None,
            "ok",
            None,
            Value::Null,
        );

        if let Some(policy) = self.access.read().unwrap().clone() {
            if let Err(reason) = policy.check(&envelope.from, subject) {
                self.record_span(
                    &envelope,
                    SpanKind::DeadLetter,
                    publish_span_id.clone(),
                    "access_denied",
                    Some(reason.clone()),
                    Value::Null,
                );
                return Err(RelayError::AccessDenied {
                    from: envelope.from,
                    subject: subject.to_string(),
                    reason,
                });
            }
        }

        // Snapshot matching subscribers so concurrent (un)subscribes don't
        // tear the enumeration; the fan-out itself is concurrent.
        let matched: Vec<Subscription> = {
            let subs = self.subscriptions.read().unwrap();
            subs.iter()
                .filter(|s| s.pattern.matches(subject))
                .cloned()
                .collect()
        };

        let deliveries = matched.into_iter().map(|sub| {
            let envelope = envelope.clone();
            let publish_span_id = publish_span_id.clone();
            async move { self.deliver_one(sub, envelope, publish_span_id).await }
        });
        let delivered_to = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count();

        let _ = self.events_tx.send(StreamEvent::RelayMessage {
            subject: subject.to_string(),
            message_id: message_id.clone(),
            payload: envelope.payload.clone(),
        });

        Ok(PublishReceipt {
            message_id,
            delivered_to,
            trace_id,
        })
    }

    /// Deliver to one subscriber, emitting route/deliver/dead-letter spans.
    /// Returns whether the delivery counted.
    async fn deliver_one(
        &self,
        sub: Subscription,
        envelope: Envelope,
        publish_span_id: Option<String>,
    ) -> bool {
        let route_span_id = self.record_span(
            &envelope,
            SpanKind::Route,
            publish_span_id,
            "ok",
            None,
            serde_json::json!({ "pattern": sub.pattern.as_str() }),
        );

        if let Some(reason) = envelope.budget.rejection_reason(Utc::now()) {
            self.record_span(
                &envelope,
                SpanKind::DeadLetter,
                route_span_id,
                reason,
                None,
                Value::Null,
            );
            return false;
        }

        let start = Utc::now();
        let mut delivered_envelope = envelope.clone();
        delivered_envelope.budget = envelope.budget.after_delivery();

        let result: Result<(), String> = match &sub.target {
            DeliveryTarget::Callback(callback) => callback(delivered_envelope).await,
            DeliveryTarget::Inbox => {
                self.append_to_inbox(sub.pattern.as_str(), delivered_envelope);
                Ok(())
            }
            DeliveryTarget::Adapter(adapter_id) => {
                let egress = self.egress.read().unwrap().clone();
                match egress {
                    Some(egress) => egress.deliver(adapter_id, &delivered_envelope).await,
                    None => Err("adapter egress not wired".to_string()),
                }
            }
        };

        match result {
            Ok(()) => {
                let mut metadata = Value::Null;
                if let DeliveryTarget::Adapter(adapter_id) = &sub.target {
                    metadata = serde_json::json!({ "adapterId": adapter_id });
                }
                let span = TraceSpan {
                    trace_id: envelope.trace_id.clone(),
                    span_id: self.ids.next(),
                    parent_span_id: route_span_id,
                    message_id: envelope.message_id.clone(),
                    kind: SpanKind::Deliver,
                    subject: envelope.subject.clone(),
                    status: "ok".to_string(),
                    start_ts: start,
                    end_ts: Some(Utc::now()),
                    error: None,
                    metadata,
                };
                if let Some(traces) = &self.traces {
                    if let Err(e) = traces.record(&span) {
                        tracing::warn!(target: "relay", error = %e, "Failed to record span");
                    }
                }
                true
            }
            Err(reason) => {
                self.record_span(
                    &envelope,
                    SpanKind::DeadLetter,
                    route_span_id,
                    "delivery_failed",
                    Some(reason),
                    Value::Null,
                );
                false
            }
        }
    }

    fn append_to_inbox(&self, subject: &str, envelope: Envelope) {
        let mut inboxes = self.inboxes.lock().unwrap();
        if let Some(inbox) = inboxes.get_mut(subject) {
            if inbox.entries.len() >= INBOX_CAP {
                inbox.entries.pop_front();
            }
            inbox.entries.push_back(InboxEntry {
                message_id: envelope.message_id.clone(),
                envelope,
                status: InboxStatus::New,
                received_at: Utc::now(),
            });
        }
    }

    /// Record an instantaneous span; returns its id for parenting.
    fn record_span(
        &self,
        envelope: &Envelope,
        kind: SpanKind,
        parent_span_id: Option<String>,
        status: &str,
        error: Option<String>,
        metadata: Value,
    ) -> Option<String> {
        let traces = self.traces.as_ref()?;
        let span_id = self.ids.next();
        let span = TraceSpan {
            trace_id: envelope.trace_id.clone(),
            span_id: span_id.clone(),
            parent_span_id,
            message_id: envelope.message_id.clone(),
            kind,
            subject: envelope.subject.clone(),
            status: status.to_string(),
            start_ts: Utc::now(),
            end_ts: Some(Utc::now()),
            error,
            metadata,
        };
        if let Err(e) = traces.record(&span) {
            tracing::warn!(target: "relay", error = %e, "Failed to record span");
        }
        Some(span_id)
    }

    /// Idempotent shutdown: further publishes fail with `PUBLISH_FAILED`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(
            Arc::new(IdGenerator::new()),
            Some(Arc::new(TraceStore::open_in_memory().unwrap())),
        ))
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> DeliveryCallback {
        Arc::new(move |_envelope| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn deliver_spans_equal_delivered_to() {
        let relay = relay();
        let count = Arc::new(AtomicUsize::new(0));
        relay
            .subscribe("a.*", counting_callback(Arc::clone(&count)), Value::Null)
            .unwrap();
        relay
            .subscribe("a.>", counting_callback(Arc::clone(&count)), Value::Null)
            .unwrap();

        let receipt = relay
            .publish(
                "a.b",
                serde_json::json!({"n": 1}),
                PublishOptions {
                    from: "test.sender".to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.delivered_to, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let span = relay
            .traces()
            .unwrap()
            .get_span_by_message_id(&receipt.message_id)
            .unwrap()
            .unwrap();
        let spans = relay.traces().unwrap().get_trace(&span.trace_id).unwrap();
        let deliver_count = spans
            .iter()
            .filter(|s| s.kind == SpanKind::Deliver)
            .count();
        assert_eq!(deliver_count, receipt.delivered_to);
    }

    #[tokio::test]
    async fn invalid_subject_is_rejected_on_publish_and_subscribe() {
        let relay = relay();
        let err = relay
            .publish("a..b", Value::Null, PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidSubject(_)));

        let count = Arc::new(AtomicUsize::new(0));
        assert!(relay
            .subscribe("a.>.c", counting_callback(count), Value::Null)
            .is_err());
    }

    #[tokio::test]
    async fn exhausted_hops_dead_letter_and_skip_callback() {
        let relay = relay();
        let relay_for_callback = Arc::clone(&relay);
        let b_invoked = Arc::new(AtomicUsize::new(0));
        let b_invoked_inner = Arc::clone(&b_invoked);

        // Subscriber on A re-publishes to B with its post-delivery budget.
        relay
            .subscribe(
                "relay.agent.A",
                Arc::new(move |envelope: Envelope| {
                    let relay = Arc::clone(&relay_for_callback);
                    Box::pin(async move {
                        let _ = relay
                            .publish(
                                "relay.agent.B",
                                envelope.payload.clone(),
                                PublishOptions {
                                    from: "relay.agent.A".to_string(),
                                    budget: Some(envelope.budget.into()),
                                    trace_id: Some(envelope.trace_id.clone()),
                                    parent_id: Some(envelope.message_id.clone()),
                                    ..PublishOptions::default()
                                },
                            )
                            .await;
                        Ok(())
                    })
                }),
                Value::Null,
            )
            .unwrap();
        relay
            .subscribe("relay.agent.B", counting_callback(b_invoked_inner), Value::Null)
            .unwrap();

        let receipt = relay
            .publish(
                "relay.agent.A",
                serde_json::json!({"hop": 1}),
                PublishOptions {
                    from: "test".to_string(),
                    budget: Some(BudgetSpec {
                        max_hops: Some(1),
                        ..BudgetSpec::default()
                    }),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.delivered_to, 1);
        assert_eq!(b_invoked.load(Ordering::SeqCst), 0, "B callback never runs");

        let first = relay
            .traces()
            .unwrap()
            .get_span_by_message_id(&receipt.message_id)
            .unwrap()
            .unwrap();
        let spans = relay.traces().unwrap().get_trace(&first.trace_id).unwrap();
        let delivers: Vec<_> = spans.iter().filter(|s| s.kind == SpanKind::Deliver).collect();
        let dead: Vec<_> = spans
            .iter()
            .filter(|s| s.kind == SpanKind::DeadLetter)
            .collect();
        assert_eq!(delivers.len(), 1);
        assert_eq!(delivers[0].subject, "relay.agent.A");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].subject, "relay.agent.B");
        assert_eq!(dead[0].status, "hops_exhausted");
    }

    #[tokio::test]
    async fn callback_failure_dead_letters_but_publish_succeeds() {
        let relay = relay();
        relay
            .subscribe(
                "a.b",
                Arc::new(|_| Box::pin(async { Err("boom".to_string()) })),
                Value::Null,
            )
            .unwrap();

        let receipt = relay
            .publish(
                "a.b",
                Value::Null,
                PublishOptions {
                    from: "t".to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.delivered_to, 0);
    }

    #[tokio::test]
    async fn endpoint_inbox_receives_and_paginates() {
        let relay = relay();
        relay
            .register_endpoint("mesh.agent.x", serde_json::json!({"label": "x"}))
            .unwrap();

        for i in 0..5 {
            relay
                .publish(
                    "mesh.agent.x",
                    serde_json::json!({ "n": i }),
                    PublishOptions {
                        from: "t".to_string(),
                        ..PublishOptions::default()
                    },
                )
                .await
                .unwrap();
        }

        let page = relay
            .read_inbox(
                "mesh.agent.x",
                ReadInboxOptions {
                    limit: Some(2),
                    ..ReadInboxOptions::default()
                },
            )
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        let cursor = page.next_cursor.clone().unwrap();

        let rest = relay
            .read_inbox(
                "mesh.agent.x",
                ReadInboxOptions {
                    cursor: Some(cursor),
                    ..ReadInboxOptions::default()
                },
            )
            .unwrap();
        assert_eq!(rest.messages.len(), 3);
        assert!(rest.next_cursor.is_none());

        // Status filtering.
        let first_id = page.messages[0].message_id.clone();
        assert!(relay.mark_inbox("mesh.agent.x", &first_id, InboxStatus::Cur));
        let only_new = relay
            .read_inbox(
                "mesh.agent.x",
                ReadInboxOptions {
                    status: Some(InboxStatus::New),
                    ..ReadInboxOptions::default()
                },
            )
            .unwrap();
        assert_eq!(only_new.messages.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_endpoint_registration_fails() {
        let relay = relay();
        relay.register_endpoint("a.b", Value::Null).unwrap();
        let err = relay.register_endpoint("a.b", Value::Null).unwrap_err();
        assert!(matches!(err, RelayError::Registration(_)));

        assert!(relay.unregister_endpoint("a.b"));
        assert!(!relay.unregister_endpoint("a.b"));
    }

    #[tokio::test]
    async fn wildcard_endpoints_are_rejected() {
        let relay = relay();
        assert!(relay.register_endpoint("a.*", Value::Null).is_err());
        assert!(relay.register_endpoint("a.>", Value::Null).is_err());
    }

    #[tokio::test]
    async fn access_policy_denies_with_dead_letter() {
        struct DenyAll;
        impl AccessPolicy for DenyAll {
            fn check(&self, _from: &str, _subject: &str) -> Result<(), String> {
                Err("blocked".to_string())
            }
        }

        let relay = relay();
        relay.set_access_policy(Arc::new(DenyAll));
        let err = relay
            .publish(
                "a.b",
                Value::Null,
                PublishOptions {
                    from: "t".to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn closed_relay_rejects_publishes() {
        let relay = relay();
        relay.close();
        relay.close();
        let err = relay
            .publish("a.b", Value::Null, PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Publish(_)));
    }
}
