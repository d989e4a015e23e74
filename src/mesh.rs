//! Mesh: agent discovery, registry, manifests, health, and topology.

pub mod access;
pub mod discovery;
pub mod manifest;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use thiserror::Error;

use crate::boundary::{BoundaryError, BoundaryGuard};
use crate::error::{DomainError, ErrorCode};
use crate::ids::IdGenerator;
use crate::pulse::store::PulseStore;
use crate::relay::bindings::BindingStore;
use crate::relay::Relay;
use access::{evaluate, AccessRule};
use discovery::{DiscoveryCandidate, DiscoveryOptions, DiscoveryScanner};
use manifest::{AgentManifest, AgentRuntimeKind, Behavior, ManifestBudget, Persona};
use store::{DenialRecord, MeshStore, MeshStoreError};

/// A manifest heartbeat within this window counts as `active`.
const HEALTH_ACTIVE_SECS: i64 = 60;
/// Beyond this window a manifest is `stale`.
const HEALTH_STALE_MINS: i64 = 30;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("discover failed: {0}")]
    Discover(String),
    #[error("register failed: {0}")]
    Register(String),
    #[error("deny failed: {0}")]
    Deny(String),
    #[error("unregister failed: {0}")]
    Unregister(String),
    #[error(transparent)]
    Store(#[from] MeshStoreError),
}

impl From<MeshError> for DomainError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::Boundary(e) => e.into(),
            MeshError::NotFound(id) => {
                DomainError::new(ErrorCode::NotFound, format!("agent not found: {id}"))
            }
            MeshError::Discover(m) => DomainError::new(ErrorCode::DiscoverFailed, m),
            MeshError::Register(m) => DomainError::new(ErrorCode::RegisterFailed, m),
            MeshError::Deny(m) => DomainError::new(ErrorCode::DenyFailed, m),
            MeshError::Unregister(m) => DomainError::new(ErrorCode::UnregisterFailed, m),
            MeshError::Store(MeshStoreError::PathTaken(path)) => DomainError::new(
                ErrorCode::RegisterFailed,
                format!("a manifest is already registered for {path}"),
            ),
            MeshError::Store(e) => DomainError::internal(e.to_string()),
        }
    }
}

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Active,
    Inactive,
    Stale,
}

/// Health is derived from `lastSeenAt` on read, never persisted.
pub fn derive_health(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> HealthStatus {
    let idle = now - last_seen;
    if idle <= Duration::seconds(HEALTH_ACTIVE_SECS) {
        HealthStatus::Active
    } else if idle <= Duration::minutes(HEALTH_STALE_MINS) {
        HealthStatus::Inactive
    } else {
        HealthStatus::Stale
    }
}

/// Caller-supplied fields layered over detection hints at registration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOverrides {
    pub name: Option<String>,
    pub description: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub behavior: Option<Behavior>,
    pub budget: Option<ManifestBudget>,
    pub persona: Option<Persona>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilters {
    pub runtime: Option<AgentRuntimeKind>,
    pub capability: Option<String>,
    pub caller_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    pub enabled: bool,
    pub agent_count: usize,
    pub denial_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedAgent {
    #[serde(flatten)]
    pub manifest: AgentManifest,
    pub health: HealthStatus,
    pub last_seen_at: DateTime<Utc>,
    pub bound_adapter_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_subject: Option<String>,
    pub schedule_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceView {
    pub name: String,
    pub color: String,
    pub agents: Vec<EnrichedAgent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyView {
    pub namespaces: Vec<NamespaceView>,
    pub access_rules: Vec<AccessRule>,
}

const NAMESPACE_PALETTE: &[&str] = &[
    "#4f6df5", "#0ea47a", "#d97706", "#dc2626", "#7c3aed", "#0891b2", "#be185d",
];

pub struct MeshService {
    store: MeshStore,
    boundary: Arc<BoundaryGuard>,
    ids: Arc<IdGenerator>,
    scanner: DiscoveryScanner,
    relay: Option<Arc<Relay>>,
    pulse_store: StdRwLock<Option<Arc<PulseStore>>>,
    binding_store: StdRwLock<Option<Arc<BindingStore>>>,
    health_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MeshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService").finish_non_exhaustive()
    }
}

impl MeshService {
    pub fn new(
        store: MeshStore,
        boundary: Arc<BoundaryGuard>,
        ids: Arc<IdGenerator>,
        relay: Option<Arc<Relay>>,
    ) -> Self {
        Self {
            store,
            boundary,
            ids,
            scanner: DiscoveryScanner::new(),
            relay,
            pulse_store: StdRwLock::new(None),
            binding_store: StdRwLock::new(None),
            health_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Pulse initializes after Mesh; it injects its store for topology
    /// enrichment once ready.
    pub fn set_pulse_store(&self, pulse: Arc<PulseStore>) {
        *self.pulse_store.write().unwrap() = Some(pulse);
    }

    pub fn set_binding_store(&self, bindings: Arc<BindingStore>) {
        *self.binding_store.write().unwrap() = Some(bindings);
    }

    pub fn store(&self) -> &MeshStore {
        &self.store
    }

    // ==================== Discovery ====================

    /// Scan roots for candidates, filtering denied and already-registered
    /// paths.
    pub fn discover(
        &self,
        roots: &[PathBuf],
        opts: &DiscoveryOptions,
    ) -> MeshResult<Vec<DiscoveryCandidate>> {
        let mut validated = Vec::with_capacity(roots.len());
        for root in roots {
            validated.push(self.boundary.validate(root)?);
        }

        let candidates = self.scanner.discover(&validated, opts);
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.store.is_denied(&candidate.path)? {
                continue;
            }
            if self.store.get_manifest_by_path(&candidate.path)?.is_some() {
                continue;
            }
            kept.push(candidate);
        }
        Ok(kept)
    }

    // ==================== Registration ====================

    /// Register an agent at a path, whether or not it was discovered first.
    pub fn register(
        &self,
        path: &Path,
        overrides: ManifestOverrides,
        approver: &str,
    ) -> MeshResult<AgentManifest> {
        let project_path = self.boundary.validate(path)?;
        if self.store.get_manifest_by_path(&project_path)?.is_some() {
            return Err(MeshError::Register(format!(
                "a manifest is already registered for {}",
                project_path.display()
            )));
        }

        let hints = self.scanner.classify(&project_path).map(|(_, h)| h);
        let default_name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".to_string());

        let manifest = AgentManifest {
            id: self.ids.next(),
            name: overrides
                .name
                .or_else(|| hints.as_ref().map(|h| h.suggested_name.clone()))
                .unwrap_or(default_name),
            description: overrides
                .description
                .or_else(|| hints.as_ref().and_then(|h| h.description.clone())),
            runtime: hints
                .as_ref()
                .map(|h| h.detected_runtime)
                .unwrap_or_default(),
            capabilities: overrides
                .capabilities
                .or_else(|| hints.as_ref().and_then(|h| h.inferred_capabilities.clone()))
                .unwrap_or_default(),
            behavior: overrides.behavior.unwrap_or_default(),
            budget: overrides.budget.unwrap_or_default(),
            persona: overrides.persona,
            registered_at: Utc::now(),
            registered_by: approver.to_string(),
            project_path: project_path.clone(),
            scan_root: None,
            icon: overrides.icon,
            color: overrides.color,
        };

        manifest
            .write_to_project()
            .map_err(|e| MeshError::Register(format!("manifest write failed: {e}")))?;
        self.store.insert_manifest(&manifest)?;
        self.store.record_event("registered", &manifest.id)?;

        if let Some(relay) = &self.relay {
            let subject = manifest.relay_subject();
            if let Err(e) = relay.register_endpoint(
                &subject,
                serde_json::json!({ "agentId": manifest.id, "name": manifest.name }),
            ) {
                tracing::warn!(target: "mesh", error = %e, "Relay endpoint registration failed");
            }
        }

        Ok(manifest)
    }

    /// Apply overrides to an existing manifest, rewriting its file.
    pub fn update(&self, id: &str, overrides: ManifestOverrides) -> MeshResult<AgentManifest> {
        let mut manifest = self
            .store
            .get_manifest(id)?
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;

        if let Some(name) = overrides.name {
            manifest.name = name;
        }
        if let Some(description) = overrides.description {
            manifest.description = Some(description);
        }
        if let Some(capabilities) = overrides.capabilities {
            manifest.capabilities = capabilities;
        }
        if let Some(behavior) = overrides.behavior {
            manifest.behavior = behavior;
        }
        if let Some(budget) = overrides.budget {
            manifest.budget = budget;
        }
        if let Some(persona) = overrides.persona {
            manifest.persona = Some(persona);
        }
        if let Some(icon) = overrides.icon {
            manifest.icon = Some(icon);
        }
        if let Some(color) = overrides.color {
            manifest.color = Some(color);
        }

        manifest
            .write_to_project()
            .map_err(|e| MeshError::Register(format!("manifest write failed: {e}")))?;
        self.store.update_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Remove the manifest file, registry row, and relay endpoint.
    pub fn unregister(&self, id: &str) -> MeshResult<()> {
        let manifest = self
            .store
            .get_manifest(id)?
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;

        AgentManifest::remove_from_project(&manifest.project_path)
            .map_err(|e| MeshError::Unregister(format!("manifest removal failed: {e}")))?;
        self.store.delete_manifest(id)?;
        self.store.record_event("deregistered", id)?;

        if let Some(relay) = &self.relay {
            relay.unregister_endpoint(&manifest.relay_subject());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> MeshResult<AgentManifest> {
        self.store
            .get_manifest(id)?
            .ok_or_else(|| MeshError::NotFound(id.to_string()))
    }

    #[allow(dead_code)] // API completeness
    pub fn get_by_path(&self, path: &Path) -> MeshResult<Option<AgentManifest>> {
        Ok(self.store.get_manifest_by_path(path)?)
    }

    /// Filter-join over the registry; `caller_namespace` additionally
    /// filters by the access rule graph.
    pub fn list(&self, filters: &ListFilters) -> MeshResult<Vec<AgentManifest>> {
        let rules = self.store.list_access_rules()?;
        let manifests = self
            .store
            .list_manifests()?
            .into_iter()
            .filter(|m| filters.runtime.map_or(true, |r| m.runtime == r))
            .filter(|m| {
                filters
                    .capability
                    .as_ref()
                    .map_or(true, |c| m.capabilities.contains(c))
            })
            .filter(|m| {
                filters
                    .caller_namespace
                    .as_ref()
                    .map_or(true, |caller| evaluate(&rules, caller, m.namespace()))
            })
            .collect();
        Ok(manifests)
    }

    // ==================== Denials ====================

    pub fn deny(
        &self,
        path: &Path,
        reason: Option<String>,
        denier: Option<String>,
    ) -> MeshResult<DenialRecord> {
        let resolved = self.boundary.validate(path)?;
        let strategy = self
            .scanner
            .classify(&resolved)
            .map(|(name, _)| name)
            .unwrap_or_else(|| "manual".to_string());

        let record = DenialRecord {
            path: resolved.to_string_lossy().into_owned(),
            strategy,
            reason,
            denied_at: Utc::now(),
            denied_by: denier,
        };
        self.store.insert_denial(&record)?;
        self.store.record_event("denied", &record.path)?;
        Ok(record)
    }

    pub fn undeny(&self, path: &str) -> MeshResult<bool> {
        let removed = self.store.delete_denial(path)?;
        if removed {
            self.store.record_event("undenied", path)?;
        }
        Ok(removed)
    }

    pub fn list_denied(&self) -> MeshResult<Vec<DenialRecord>> {
        Ok(self.store.list_denials()?)
    }

    // ==================== Health ====================

    pub fn heartbeat(&self, id: &str) -> MeshResult<bool> {
        Ok(self.store.heartbeat(id, Utc::now())?)
    }

    #[allow(dead_code)] // API completeness
    pub fn health_of(&self, id: &str) -> MeshResult<HealthStatus> {
        let last_seen = self
            .store
            .last_seen(id)?
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;
        Ok(derive_health(last_seen, Utc::now()))
    }

    /// Background task that emits `health_changed` events on threshold
    /// crossings. Derived state is never persisted.
    pub fn spawn_health_task(self: &Arc<Self>) {
        let mesh = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut previous: HashMap<String, HealthStatus> = HashMap::new();
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if mesh.closed.load(Ordering::SeqCst) {
                    return;
                }
                let manifests = match mesh.store.list_manifests() {
                    Ok(manifests) => manifests,
                    Err(e) => {
                        tracing::warn!(target: "mesh", error = %e, "Health sweep read failed");
                        continue;
                    }
                };
                for manifest in manifests {
                    let Ok(Some(last_seen)) = mesh.store.last_seen(&manifest.id) else {
                        continue;
                    };
                    let health = derive_health(last_seen, Utc::now());
                    let changed = previous
                        .insert(manifest.id.clone(), health)
                        .is_some_and(|prior| prior != health);
                    if changed {
                        if let Err(e) = mesh.store.record_event("health_changed", &manifest.id) {
                            tracing::warn!(target: "mesh", error = %e, "Event write failed");
                        }
                    }
                }
            }
        });
        *self.health_task.lock().unwrap() = Some(handle);
    }

    // ==================== Status / topology ====================

    pub fn status(&self) -> MeshResult<MeshStatus> {
        Ok(MeshStatus {
            enabled: true,
            agent_count: self.store.list_manifests()?.len(),
            denial_count: self.store.list_denials()?.len(),
        })
    }

    pub fn inspect(&self, id: &str) -> MeshResult<EnrichedAgent> {
        let manifest = self.get(id)?;
        Ok(self.enrich(manifest))
    }

    /// Namespace-scoped topology: group, filter by access rules, enrich,
    /// and attach the rules between visible namespaces.
    pub fn get_topology(&self, caller_namespace: &str) -> MeshResult<TopologyView> {
        let rules = self.store.list_access_rules()?;
        let manifests = self.store.list_manifests()?;

        let mut grouped: HashMap<String, Vec<AgentManifest>> = HashMap::new();
        for manifest in manifests {
            grouped
                .entry(manifest.namespace().to_string())
                .or_default()
                .push(manifest);
        }

        let visible: Vec<String> = grouped
            .keys()
            .filter(|ns| {
                caller_namespace == "*" || evaluate(&rules, caller_namespace, ns)
            })
            .cloned()
            .collect();
        let visible_set: HashSet<&String> = visible.iter().collect();

        let mut namespaces: Vec<NamespaceView> = grouped
            .iter()
            .filter(|(ns, _)| visible_set.contains(ns))
            .map(|(ns, members)| NamespaceView {
                name: ns.clone(),
                color: namespace_color(ns),
                agents: members
                    .iter()
                    .map(|m| self.enrich(m.clone()))
                    .collect(),
            })
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));

        let access_rules = rules
            .into_iter()
            .filter(|rule| visible.iter().any(|ns| rule.mentions(ns)))
            .collect();

        Ok(TopologyView {
            namespaces,
            access_rules,
        })
    }

    /// Join health, relay, binding, and pulse facts onto a manifest.
    /// Enrichment sources that are absent yield safe defaults.
    fn enrich(&self, manifest: AgentManifest) -> EnrichedAgent {
        let last_seen = self
            .store
            .last_seen(&manifest.id)
            .ok()
            .flatten()
            .unwrap_or(manifest.registered_at);

        let bound_adapter_ids: Vec<String> = self
            .binding_store
            .read()
            .unwrap()
            .as_ref()
            .and_then(|bindings| bindings.for_agent_dir(&manifest.project_path).ok())
            .map(|bindings| {
                let mut ids: Vec<String> =
                    bindings.into_iter().map(|b| b.adapter_id).collect();
                ids.sort();
                ids.dedup();
                ids
            })
            .unwrap_or_default();

        let schedule_count = self
            .pulse_store
            .read()
            .unwrap()
            .as_ref()
            .and_then(|pulse| pulse.count_schedules_for_cwd(&manifest.project_path).ok())
            .unwrap_or(0);

        let relay_subject = self
            .relay
            .as_ref()
            .map(|_| manifest.relay_subject());

        EnrichedAgent {
            health: derive_health(last_seen, Utc::now()),
            last_seen_at: last_seen,
            bound_adapter_ids,
            relay_subject,
            schedule_count,
            manifest,
        }
    }

    /// Idempotent shutdown.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Bridges Mesh access rules into the Relay publish path.
///
/// Subjects under `mesh.agent.{id}` resolve to the owning manifest's
/// namespace; agent-to-agent traffic is then evaluated deny-first against
/// the rule set. Traffic that is not agent-to-agent passes through.
pub struct MeshAccessPolicy {
    store: MeshStore,
}

impl MeshAccessPolicy {
    pub fn new(store: MeshStore) -> Self {
        Self { store }
    }

    fn namespace_of(&self, subject: &str) -> Option<String> {
        let id = subject.strip_prefix("mesh.agent.")?;
        self.store
            .get_manifest(id)
            .ok()
            .flatten()
            .map(|m| m.namespace().to_string())
    }
}

impl crate::relay::AccessPolicy for MeshAccessPolicy {
    fn check(&self, from: &str, subject: &str) -> Result<(), String> {
        let Some(to_ns) = self.namespace_of(subject) else {
            return Ok(());
        };
        let Some(from_ns) = self.namespace_of(from) else {
            // System publishers (pulse, adapters, routes) are not
            // namespace-scoped.
            return Ok(());
        };
        let rules = self.store.list_access_rules().map_err(|e| e.to_string())?;
        if evaluate(&rules, &from_ns, &to_ns) {
            Ok(())
        } else {
            Err(format!("{from_ns} -> {to_ns} denied by access rules"))
        }
    }
}

fn namespace_color(namespace: &str) -> String {
    let hash: usize = namespace.bytes().map(usize::from).sum();
    NAMESPACE_PALETTE[hash % NAMESPACE_PALETTE.len()].to_string()
}
