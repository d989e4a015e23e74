//! Adapter registry: pluggable external-channel components.
//!
//! Adapters are independent units keyed by id; the registry owns their
//! lifecycle and holds no implicit singletons. Hot reload is a
//! diff-and-reconcile over the adapters config file; individual adapter
//! failures are contained and reported, never fatal to the reload.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::envelope::Envelope;
use super::trace::{SpanKind, TraceSpan};
use super::{AdapterEgress, PublishOptions, PublishReceipt, Relay, RelayError};
use crate::error::{DomainError, ErrorCode};

/// An adapter that has not connected within this window is marked `error`.
pub const ADAPTER_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AdapterOpError {
    #[error("unknown adapter: {0}")]
    NotFound(String),
    #[error("enable failed for {id}: {reason}")]
    Enable { id: String, reason: String },
    #[error("disable failed for {id}: {reason}")]
    Disable { id: String, reason: String },
    #[error("reload failed: {0}")]
    Reload(String),
}

impl From<AdapterOpError> for DomainError {
    fn from(err: AdapterOpError) -> Self {
        let code = match &err {
            AdapterOpError::NotFound(_) => ErrorCode::NotFound,
            AdapterOpError::Enable { .. } => ErrorCode::EnableFailed,
            AdapterOpError::Disable { .. } => ErrorCode::DisableFailed,
            AdapterOpError::Reload(_) => ErrorCode::ReloadFailed,
        };
        DomainError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    Disabled,
    Starting,
    Connected,
    Disconnected,
    Error,
}

/// Inbound publishing surface handed to a started adapter.
#[derive(Clone)]
pub struct AdapterContext {
    relay: Arc<Relay>,
    adapter_id: String,
    subject_prefix: String,
    sink: Option<Arc<dyn InboundSink>>,
}

impl AdapterContext {
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Publish an inbound message under the adapter's subject prefix and
    /// hand it to the binding resolver.
    pub async fn publish_inbound(
        &self,
        subject_suffix: &str,
        payload: Value,
        reply_to: Option<String>,
    ) -> Result<PublishReceipt, RelayError> {
        let subject = format!("{}.{subject_suffix}", self.subject_prefix);
        let receipt = self
            .relay
            .publish(
                &subject,
                payload.clone(),
                PublishOptions {
                    from: self.subject_prefix.clone(),
                    reply_to,
                    ..PublishOptions::default()
                },
            )
            .await?;

        if let Some(traces) = self.relay.traces() {
            let span = TraceSpan {
                trace_id: receipt.trace_id.clone(),
                span_id: self.relay_span_id(),
                parent_span_id: None,
                message_id: receipt.message_id.clone(),
                kind: SpanKind::AdapterIngress,
                subject: subject.clone(),
                status: "ok".to_string(),
                start_ts: Utc::now(),
                end_ts: Some(Utc::now()),
                error: None,
                metadata: serde_json::json!({ "adapterId": self.adapter_id }),
            };
            if let Err(e) = traces.record(&span) {
                tracing::warn!(target: "relay", error = %e, "Failed to record ingress span");
            }
        }

        if let Some(sink) = &self.sink {
            let envelope = Envelope {
                message_id: receipt.message_id.clone(),
                subject,
                from: self.subject_prefix.clone(),
                reply_to: None,
                payload,
                trace_id: receipt.trace_id.clone(),
                parent_id: None,
                published_at: Utc::now(),
                budget: super::envelope::Budget::effective(None, Utc::now()),
            };
            sink.on_inbound(&self.adapter_id, &envelope).await;
        }
        Ok(receipt)
    }

    fn relay_span_id(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}

/// Consumer of inbound adapter traffic (the agent-binding bridge).
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn on_inbound(&self, adapter_id: &str, envelope: &Envelope);
}

/// A pluggable external-channel component.
#[async_trait]
pub trait RelayAdapter: Send + Sync {
    fn display_name(&self) -> String;
    fn subject_prefix(&self) -> String;
    async fn configure(&self, config: &Value) -> Result<(), String>;
    async fn start(&self, context: AdapterContext) -> Result<(), String>;
    /// Must be safe to call from any state.
    async fn stop(&self) -> Result<(), String>;
    /// Outbound delivery (relay -> external channel).
    async fn handle_message(&self, envelope: &Envelope) -> Result<(), String>;
}

pub type AdapterFactory = Arc<dyn Fn(&str, &Value) -> Arc<dyn RelayAdapter> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfigEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AdaptersConfig {
    adapters: Vec<AdapterConfigEntry>,
}

struct AdapterEntry {
    adapter: Arc<dyn RelayAdapter>,
    kind: String,
    config: Value,
    enabled: bool,
    status: AdapterStatus,
    error: Option<String>,
    subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterView {
    pub id: String,
    pub display_name: String,
    pub subject_prefix: String,
    pub status: AdapterStatus,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AdapterRegistry {
    relay: Arc<Relay>,
    config_path: PathBuf,
    factories: StdRwLock<HashMap<String, AdapterFactory>>,
    adapters: Mutex<HashMap<String, AdapterEntry>>,
    sink: StdRwLock<Option<Arc<dyn InboundSink>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").finish_non_exhaustive()
    }
}

impl AdapterRegistry {
    pub fn new(relay: Arc<Relay>, config_path: PathBuf) -> Self {
        Self {
            relay,
            config_path,
            factories: StdRwLock::new(HashMap::new()),
            adapters: Mutex::new(HashMap::new()),
            sink: StdRwLock::new(None),
        }
    }

    pub fn register_factory(&self, kind: &str, factory: AdapterFactory) {
        self.factories
            .write()
            .unwrap()
            .insert(kind.to_string(), factory);
    }

    pub fn set_inbound_sink(&self, sink: Arc<dyn InboundSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    /// Initial load: instantiate every configured adapter and start the
    /// enabled ones. Per-adapter failures are contained.
    pub async fn load(&self) {
        let config = self.read_config();
        let mut adapters = self.adapters.lock().await;
        for entry in config.adapters {
            if let Err(e) = self.instantiate(&mut adapters, &entry) {
                tracing::warn!(target: "relay", adapter = %entry.id, error = %e, "Skipping adapter");
            }
        }
        drop(adapters);

        let enabled: Vec<String> = {
            let adapters = self.adapters.lock().await;
            adapters
                .iter()
                .filter(|(_, e)| e.enabled)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in enabled {
            if let Err(e) = self.start_adapter(&id).await {
                tracing::warn!(target: "relay", adapter = %id, error = %e, "Adapter failed to start");
            }
        }
    }

    fn instantiate(
        &self,
        adapters: &mut HashMap<String, AdapterEntry>,
        entry: &AdapterConfigEntry,
    ) -> Result<(), String> {
        let factory = self
            .factories
            .read()
            .unwrap()
            .get(&entry.kind)
            .cloned()
            .ok_or_else(|| format!("no factory for adapter type {:?}", entry.kind))?;
        let adapter = factory(&entry.id, &entry.config);
        adapters.insert(
            entry.id.clone(),
            AdapterEntry {
                adapter,
                kind: entry.kind.clone(),
                config: entry.config.clone(),
                enabled: entry.enabled,
                status: AdapterStatus::Disabled,
                error: None,
                subscription_id: None,
            },
        );
        Ok(())
    }

    pub async fn list(&self) -> Vec<AdapterView> {
        let adapters = self.adapters.lock().await;
        let mut views: Vec<AdapterView> = adapters
            .iter()
            .map(|(id, entry)| AdapterView {
                id: id.clone(),
                display_name: entry.adapter.display_name(),
                subject_prefix: entry.adapter.subject_prefix(),
                status: entry.status,
                enabled: entry.enabled,
                error: entry.error.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Persist the enabled flag, then start the adapter. Idempotent.
    pub async fn enable(&self, id: &str) -> Result<AdapterView, AdapterOpError> {
        {
            let mut adapters = self.adapters.lock().await;
            let entry = adapters
                .get_mut(id)
                .ok_or_else(|| AdapterOpError::NotFound(id.to_string()))?;
            if entry.status == AdapterStatus::Connected {
                return Ok(view_of(id, entry));
            }
            entry.enabled = true;
        }
        self.persist_config().await.map_err(|reason| AdapterOpError::Enable {
            id: id.to_string(),
            reason,
        })?;

        self.start_adapter(id)
            .await
            .map_err(|reason| AdapterOpError::Enable {
                id: id.to_string(),
                reason,
            })?;

        let adapters = self.adapters.lock().await;
        let entry = adapters
            .get(id)
            .ok_or_else(|| AdapterOpError::NotFound(id.to_string()))?;
        Ok(view_of(id, entry))
    }

    /// Transition safely to `disconnected` from any state.
    pub async fn disable(&self, id: &str) -> Result<AdapterView, AdapterOpError> {
        {
            let mut adapters = self.adapters.lock().await;
            let entry = adapters
                .get_mut(id)
                .ok_or_else(|| AdapterOpError::NotFound(id.to_string()))?;
            entry.enabled = false;
        }
        self.persist_config().await.map_err(|reason| AdapterOpError::Disable {
            id: id.to_string(),
            reason,
        })?;
        self.stop_adapter(id).await;

        let adapters = self.adapters.lock().await;
        let entry = adapters
            .get(id)
            .ok_or_else(|| AdapterOpError::NotFound(id.to_string()))?;
        Ok(view_of(id, entry))
    }

    /// Re-read the adapters config file and reconcile running state.
    pub async fn reload(&self) -> Result<Vec<AdapterView>, AdapterOpError> {
        let config = self.read_config();
        let desired: HashMap<String, AdapterConfigEntry> = config
            .adapters
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        // Stop and drop adapters that left the config.
        let removed: Vec<String> = {
            let adapters = self.adapters.lock().await;
            adapters
                .keys()
                .filter(|id| !desired.contains_key(*id))
                .cloned()
                .collect()
        };
        for id in removed {
            self.stop_adapter(&id).await;
            self.adapters.lock().await.remove(&id);
        }

        for (id, entry) in &desired {
            let needs_recreate = {
                let adapters = self.adapters.lock().await;
                match adapters.get(id) {
                    None => true,
                    Some(existing) => {
                        existing.kind != entry.kind || existing.config != entry.config
                    }
                }
            };

            if needs_recreate {
                self.stop_adapter(id).await;
                let mut adapters = self.adapters.lock().await;
                adapters.remove(id);
                if let Err(e) = self.instantiate(&mut adapters, entry) {
                    tracing::warn!(target: "relay", adapter = %id, error = %e, "Reload skipped adapter");
                    continue;
                }
            } else {
                let mut adapters = self.adapters.lock().await;
                if let Some(existing) = adapters.get_mut(id) {
                    existing.enabled = entry.enabled;
                }
            }

            let (enabled, running) = {
                let adapters = self.adapters.lock().await;
                adapters
                    .get(id)
                    .map(|e| (e.enabled, e.status == AdapterStatus::Connected))
                    .unwrap_or((false, false))
            };
            if enabled && !running {
                if let Err(e) = self.start_adapter(id).await {
                    tracing::warn!(target: "relay", adapter = %id, error = %e, "Reload start failed");
                }
            } else if !enabled && running {
                self.stop_adapter(id).await;
            }
        }

        Ok(self.list().await)
    }

    async fn start_adapter(&self, id: &str) -> Result<(), String> {
        let (adapter, config, prefix) = {
            let mut adapters = self.adapters.lock().await;
            let entry = adapters.get_mut(id).ok_or("unknown adapter")?;
            if entry.status == AdapterStatus::Connected {
                return Ok(());
            }
            entry.status = AdapterStatus::Starting;
            entry.error = None;
            (
                Arc::clone(&entry.adapter),
                entry.config.clone(),
                entry.adapter.subject_prefix(),
            )
        };

        let context = AdapterContext {
            relay: Arc::clone(&self.relay),
            adapter_id: id.to_string(),
            subject_prefix: prefix.clone(),
            sink: self.sink.read().unwrap().clone(),
        };

        let result = tokio::time::timeout(ADAPTER_START_TIMEOUT, async {
            adapter.configure(&config).await?;
            adapter.start(context).await
        })
        .await;

        let mut adapters = self.adapters.lock().await;
        let entry = adapters.get_mut(id).ok_or("unknown adapter")?;
        match result {
            Ok(Ok(())) => {
                entry.status = AdapterStatus::Connected;
                if entry.subscription_id.is_none() {
                    entry.subscription_id = self
                        .relay
                        .subscribe_adapter(id, &prefix)
                        .map_err(|e| e.to_string())
                        .ok();
                }
                tracing::info!(target: "relay", adapter = %id, "Adapter connected");
                Ok(())
            }
            Ok(Err(reason)) => {
                entry.status = AdapterStatus::Error;
                entry.error = Some(reason.clone());
                Err(reason)
            }
            Err(_) => {
                let reason = "adapter start timed out".to_string();
                entry.status = AdapterStatus::Error;
                entry.error = Some(reason.clone());
                Err(reason)
            }
        }
    }

    /// Stop is safe from any state; failures are logged, not surfaced.
    async fn stop_adapter(&self, id: &str) {
        let (adapter, subscription) = {
            let mut adapters = self.adapters.lock().await;
            let Some(entry) = adapters.get_mut(id) else {
                return;
            };
            entry.status = AdapterStatus::Disconnected;
            (Arc::clone(&entry.adapter), entry.subscription_id.take())
        };
        if let Some(subscription_id) = subscription {
            self.relay.unsubscribe(&subscription_id);
        }
        if let Err(e) = adapter.stop().await {
            tracing::warn!(target: "relay", adapter = %id, error = %e, "Adapter stop reported an error");
        }
    }

    fn read_config(&self) -> AdaptersConfig {
        match std::fs::read_to_string(&self.config_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(target: "relay", error = %e, "Malformed adapters config");
                AdaptersConfig::default()
            }),
            Err(_) => AdaptersConfig::default(),
        }
    }

    /// Atomic write-temp-then-rename of the adapters config.
    async fn persist_config(&self) -> Result<(), String> {
        let config = {
            let adapters = self.adapters.lock().await;
            let mut entries: Vec<AdapterConfigEntry> = adapters
                .iter()
                .map(|(id, entry)| AdapterConfigEntry {
                    id: id.clone(),
                    kind: entry.kind.clone(),
                    enabled: entry.enabled,
                    config: entry.config.clone(),
                })
                .collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            AdaptersConfig { adapters: entries }
        };

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let contents = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
        let temp = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp, contents).map_err(|e| e.to_string())?;
        std::fs::rename(&temp, &self.config_path).map_err(|e| e.to_string())
    }

    /// Idempotent shutdown: stop every running adapter.
    pub async fn close(&self) {
        let ids: Vec<String> = {
            let adapters = self.adapters.lock().await;
            adapters.keys().cloned().collect()
        };
        for id in ids {
            self.stop_adapter(&id).await;
        }
    }
}

fn view_of(id: &str, entry: &AdapterEntry) -> AdapterView {
    AdapterView {
        id: id.to_string(),
        display_name: entry.adapter.display_name(),
        subject_prefix: entry.adapter.subject_prefix(),
        status: entry.status,
        enabled: entry.enabled,
        error: entry.error.clone(),
    }
}

#[async_trait]
impl AdapterEgress for AdapterRegistry {
    async fn deliver(&self, adapter_id: &str, envelope: &Envelope) -> Result<(), String> {
        let adapter = {
            let adapters = self.adapters.lock().await;
            let entry = adapters
                .get(adapter_id)
                .ok_or_else(|| format!("unknown adapter {adapter_id}"))?;
            if entry.status != AdapterStatus::Connected {
                return Err(format!("adapter {adapter_id} is not connected"));
            }
            Arc::clone(&entry.adapter)
        };

        let start = Utc::now();
        let result = adapter.handle_message(envelope).await;
        if let Some(traces) = self.relay.traces() {
            let span = TraceSpan {
                trace_id: envelope.trace_id.clone(),
                span_id: ulid::Ulid::new().to_string(),
                parent_span_id: None,
                message_id: envelope.message_id.clone(),
                kind: SpanKind::AdapterEgress,
                subject: envelope.subject.clone(),
                status: if result.is_ok() { "ok" } else { "error" }.to_string(),
                start_ts: start,
                end_ts: Some(Utc::now()),
                error: result.as_ref().err().cloned(),
                metadata: serde_json::json!({ "adapterId": adapter_id }),
            };
            if let Err(e) = traces.record(&span) {
                tracing::warn!(target: "relay", error = %e, "Failed to record egress span");
            }
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingAdapter;
    use super::*;
    use crate::ids::IdGenerator;
    use crate::relay::trace::TraceStore;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    async fn registry_with_adapter(
        temp: &TempDir,
        enabled: bool,
    ) -> (Arc<Relay>, Arc<AdapterRegistry>, Arc<RecordingAdapter>) {
        let relay = Arc::new(Relay::new(
            Arc::new(IdGenerator::new()),
            Some(Arc::new(TraceStore::open_in_memory().unwrap())),
        ));
        let config_path = temp.path().join("adapters.json");
        std::fs::write(
            &config_path,
            serde_json::to_string(&AdaptersConfig {
                adapters: vec![AdapterConfigEntry {
                    id: "chat-1".to_string(),
                    kind: "recording".to_string(),
                    enabled,
                    config: Value::Null,
                }],
            })
            .unwrap(),
        )
        .unwrap();

        let registry = Arc::new(AdapterRegistry::new(Arc::clone(&relay), config_path));
        let adapter = RecordingAdapter::new("relay.ext.chat1");
        let handle = Arc::clone(&adapter);
        registry.register_factory(
            "recording",
            Arc::new(move |_id, _config| Arc::clone(&handle) as Arc<dyn RelayAdapter>),
        );
        registry.load().await;
        (relay, registry, adapter)
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (_relay, registry, adapter) = registry_with_adapter(&temp, false).await;

        let view = registry.enable("chat-1").await.unwrap();
        assert_eq!(view.status, AdapterStatus::Connected);
        let again = registry.enable("chat-1").await.unwrap();
        assert_eq!(again.status, AdapterStatus::Connected);
        assert_eq!(adapter.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_is_safe_from_any_state() {
        let temp = TempDir::new().unwrap();
        let (_relay, registry, adapter) = registry_with_adapter(&temp, false).await;

        // Disable before ever starting.
        let view = registry.disable("chat-1").await.unwrap();
        assert_eq!(view.status, AdapterStatus::Disconnected);

        registry.enable("chat-1").await.unwrap();
        registry.disable("chat-1").await.unwrap();
        registry.disable("chat-1").await.unwrap();
        assert!(adapter.stops.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn connected_adapter_receives_egress_traffic() {
        let temp = TempDir::new().unwrap();
        let (relay, registry, adapter) = registry_with_adapter(&temp, true).await;
        relay.set_adapter_egress(Arc::clone(&registry) as Arc<dyn AdapterEgress>);

        let receipt = relay
            .publish(
                "relay.ext.chat1.inbound",
                serde_json::json!({"text": "hi"}),
                PublishOptions {
                    from: "test".to_string(),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.delivered_to, 1);
        assert_eq!(adapter.egress.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reload_reconciles_enabled_flag() {
        let temp = TempDir::new().unwrap();
        let (_relay, registry, adapter) = registry_with_adapter(&temp, true).await;
        assert_eq!(adapter.starts.load(Ordering::SeqCst), 1);

        // Flip the config file to disabled and reload.
        let config_path = temp.path().join("adapters.json");
        std::fs::write(
            &config_path,
            serde_json::json!({
                "adapters": [
                    { "id": "chat-1", "type": "recording", "enabled": false, "config": null }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let views = registry.reload().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, AdapterStatus::Disconnected);
        assert!(adapter.stops.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn reload_drops_removed_adapters() {
        let temp = TempDir::new().unwrap();
        let (_relay, registry, _adapter) = registry_with_adapter(&temp, true).await;

        std::fs::write(
            temp.path().join("adapters.json"),
            serde_json::json!({ "adapters": [] }).to_string(),
        )
        .unwrap();

        let views = registry.reload().await.unwrap();
        assert!(views.is_empty());
    }

    #[tokio::test]
    async fn inbound_publish_records_ingress_span() {
        let temp = TempDir::new().unwrap();
        let (relay, _registry, _adapter) = registry_with_adapter(&temp, true).await;

        let context = AdapterContext {
            relay: Arc::clone(&relay),
            adapter_id: "chat-1".to_string(),
            subject_prefix: "relay.ext.chat1".to_string(),
            sink: None,
        };
        let receipt = context
            .publish_inbound("msg", serde_json::json!({"text": "hello"}), None)
            .await
            .unwrap();

        let spans = relay
            .traces()
            .unwrap()
            .get_trace(&receipt.trace_id)
            .unwrap();
        assert!(spans.iter().any(|s| s.kind == SpanKind::AdapterIngress));
    }
}
