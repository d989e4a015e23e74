//! The transport port: one wiring of every subsystem behind the operation
//! catalog both the HTTP adapter and in-process callers target.
//!
//! Route handlers are thin translators over this struct; MCP tools and
//! embedded hosts call the same surface directly. Feature-flag-disabled
//! subsystems answer with their `*_DISABLED` codes here, in one place.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::agent::AgentManager;
use crate::boundary::BoundaryGuard;
use crate::config::ServerConfig;
use crate::error::{DomainError, DomainResult, ErrorCode};
use crate::mesh::MeshService;
use crate::pulse::Pulse;
use crate::relay::adapters::AdapterRegistry;
use crate::relay::bindings::BindingStore;
use crate::relay::trace::TraceStore;
use crate::relay::Relay;
use crate::sync::SessionBroadcaster;
use crate::transcript::TranscriptReader;

#[derive(Clone)]
pub struct Operations {
    pub config: Arc<ServerConfig>,
    pub boundary: Arc<BoundaryGuard>,
    pub agent: Arc<AgentManager>,
    pub transcripts: Arc<TranscriptReader>,
    pub broadcaster: Arc<SessionBroadcaster>,
    pub relay: Option<Arc<Relay>>,
    pub adapters: Option<Arc<AdapterRegistry>>,
    pub bindings: Option<Arc<BindingStore>>,
    pub mesh: Option<Arc<MeshService>>,
    pub pulse: Option<Arc<Pulse>>,
}

impl Operations {
    pub fn relay(&self) -> DomainResult<&Arc<Relay>> {
        self.relay
            .as_ref()
            .ok_or_else(|| DomainError::new(ErrorCode::RelayDisabled, "relay is not enabled"))
    }

    pub fn traces(&self) -> DomainResult<&Arc<TraceStore>> {
        self.relay()?.traces().ok_or_else(|| {
            DomainError::new(ErrorCode::TracingDisabled, "trace store is not enabled")
        })
    }

    pub fn adapters(&self) -> DomainResult<&Arc<AdapterRegistry>> {
        self.adapters.as_ref().ok_or_else(|| {
            DomainError::new(ErrorCode::AdaptersDisabled, "adapters are not enabled")
        })
    }

    pub fn bindings(&self) -> DomainResult<&Arc<BindingStore>> {
        self.bindings.as_ref().ok_or_else(|| {
            DomainError::new(ErrorCode::BindingsDisabled, "bindings are not enabled")
        })
    }

    pub fn mesh(&self) -> DomainResult<&Arc<MeshService>> {
        self.mesh
            .as_ref()
            .ok_or_else(|| DomainError::new(ErrorCode::MeshDisabled, "mesh is not enabled"))
    }

    pub fn pulse(&self) -> DomainResult<&Arc<Pulse>> {
        self.pulse
            .as_ref()
            .ok_or_else(|| DomainError::new(ErrorCode::PulseDisabled, "pulse is not enabled"))
    }

    /// The `GET /api/config` payload: feature flags clients use to render
    /// disabled states.
    pub fn config_view(&self) -> Value {
        json!({
            "name": "DorkOS",
            "version": env!("CARGO_PKG_VERSION"),
            "port": self.config.port,
            "pulse": { "enabled": self.config.pulse_enabled },
            "relay": { "enabled": self.config.relay_enabled },
            "mesh": { "enabled": self.config.mesh_enabled },
            "tunnel": { "enabled": self.config.tunnel_enabled },
        })
    }

    /// Reverse-dependency-order shutdown. Every `close()` is idempotent,
    /// so calling this twice is harmless.
    pub async fn shutdown(&self) {
        if let Some(pulse) = &self.pulse {
            pulse.close();
        }
        if let Some(mesh) = &self.mesh {
            mesh.close();
        }
        if let Some(adapters) = &self.adapters {
            adapters.close().await;
        }
        if let Some(relay) = &self.relay {
            relay.close();
        }
        self.broadcaster.close();
        tracing::info!("Subsystems shut down");
    }
}
