//! DorkOS - multi-subsystem server exposing an LLM coding-agent runtime
//!
//! Subsystems initialize in dependency order (logger/ids, agent manager,
//! relay, mesh, pulse, broadcaster) and shut down in reverse; each close
//! is idempotent.

mod agent;
mod api;
mod boundary;
mod config;
mod error;
mod events;
mod ids;
mod logging;
mod mcp;
mod mesh;
mod pulse;
mod relay;
mod sync;
mod transcript;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use agent::context::ServerInfo;
use agent::runtime::DetachedRuntime;
use agent::AgentManager;
use boundary::BoundaryGuard;
use config::ServerConfig;
use ids::IdGenerator;
use mcp::McpRegistry;
use mesh::{MeshAccessPolicy, MeshService};
use pulse::store::PulseStore;
use pulse::Pulse;
use relay::adapters::AdapterRegistry;
use relay::bindings::BindingStore;
use relay::bridge::RelayAgentBridge;
use relay::trace::TraceStore;
use relay::{AdapterEgress, Relay};
use sync::SessionBroadcaster;
use transcript::TranscriptReader;
use transport::Operations;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(ServerConfig::from_env());

    std::fs::create_dir_all(&config.data_dir)?;
    let _log_guard = logging::init(&config)?;
    let _retention = logging::spawn_retention_sweep(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        pulse = config.pulse_enabled,
        relay = config.relay_enabled,
        mesh = config.mesh_enabled,
        "Starting DorkOS"
    );

    let ids = Arc::new(IdGenerator::new());
    let boundary = Arc::new(BoundaryGuard::new(&config.boundary_root)?);
    let transcripts = Arc::new(TranscriptReader::new(config.transcripts_dir.clone()));

    // The LLM runtime is an external collaborator; without one attached,
    // queries fail with a clear message but the server still serves.
    tracing::warn!("No LLM runtime attached; agent queries will be rejected");
    let agent = Arc::new(AgentManager::new(
        Arc::new(DetachedRuntime),
        Arc::clone(&boundary),
        ServerInfo::new(config.port),
        config.default_cwd.clone(),
    ));
    let _health_sweep = agent.spawn_health_sweep(std::time::Duration::from_secs(60));

    // Relay stack
    let (relay_handle, adapter_registry, binding_store) = if config.relay_enabled {
        std::fs::create_dir_all(config.data_dir.join("relay"))?;
        let traces = Arc::new(TraceStore::open(config.traces_db_path())?);
        let _prune = traces.spawn_prune_task();
        let relay_handle = Arc::new(Relay::new(Arc::clone(&ids), Some(traces)));

        let binding_store = Arc::new(BindingStore::open(config.bindings_db_path())?);
        let registry = Arc::new(AdapterRegistry::new(
            Arc::clone(&relay_handle),
            config.adapters_config_path(),
        ));
        relay_handle.set_adapter_egress(Arc::clone(&registry) as Arc<dyn AdapterEgress>);

        let bridge = RelayAgentBridge::new(
            Arc::clone(&relay_handle),
            Arc::clone(&binding_store),
            Arc::clone(&agent),
        );
        bridge.install();
        registry.set_inbound_sink(bridge);
        registry.load().await;

        (Some(relay_handle), Some(registry), Some(binding_store))
    } else {
        (None, None, None)
    };

    // Mesh
    let mesh_service = if config.mesh_enabled {
        std::fs::create_dir_all(config.data_dir.join("mesh"))?;
        let store = mesh::store::MeshStore::open(config.mesh_db_path())?;
        let service = Arc::new(MeshService::new(
            store.clone(),
            Arc::clone(&boundary),
            Arc::clone(&ids),
            relay_handle.clone(),
        ));
        if let Some(bindings) = &binding_store {
            service.set_binding_store(Arc::clone(bindings));
        }
        if let Some(relay_handle) = &relay_handle {
            relay_handle.set_access_policy(Arc::new(MeshAccessPolicy::new(store)));
        }
        service.spawn_health_task();
        Some(service)
    } else {
        None
    };

    // Pulse
    let pulse_service = if config.pulse_enabled {
        std::fs::create_dir_all(config.data_dir.join("pulse"))?;
        let store = Arc::new(PulseStore::open(config.pulse_db_path())?);
        if let Some(mesh_service) = &mesh_service {
            mesh_service.set_pulse_store(Arc::clone(&store));
        }
        let service = Pulse::new(
            store,
            Arc::clone(&agent),
            relay_handle.clone(),
            Arc::clone(&ids),
        );
        service.spawn_ticker();
        Some(service)
    } else {
        None
    };

    // MCP tool surface: each enabled subsystem contributes its slice.
    let mut registry = McpRegistry::new();
    registry.contribute(mcp::core_tools::tools(
        Arc::clone(&config),
        Arc::clone(&agent),
    ));
    if let Some(pulse_service) = &pulse_service {
        registry.contribute(mcp::pulse_tools::tools(Arc::clone(pulse_service)));
    }
    if let Some(relay_handle) = &relay_handle {
        registry.contribute(mcp::relay_tools::tools(Arc::clone(relay_handle)));
    }
    if let Some(adapter_registry) = &adapter_registry {
        registry.contribute(mcp::relay_tools::adapter_tools(Arc::clone(adapter_registry)));
    }
    if let Some(binding_store) = &binding_store {
        registry.contribute(mcp::relay_tools::binding_tools(Arc::clone(binding_store)));
    }
    if let Some(mesh_service) = &mesh_service {
        registry.contribute(mcp::mesh_tools::tools(Arc::clone(mesh_service)));
    }
    tracing::info!(tools = registry.tool_count(), "MCP tool surface assembled");
    agent.set_tool_server_factory(registry.into_factory());

    // Session broadcaster watches the runtime's transcript directory.
    let broadcaster = Arc::new(SessionBroadcaster::new(&config.transcripts_dir));

    let ops = Arc::new(Operations {
        config: Arc::clone(&config),
        boundary,
        agent,
        transcripts,
        broadcaster,
        relay: relay_handle,
        adapters: adapter_registry,
        bindings: binding_store,
        mesh: mesh_service,
        pulse: pulse_service,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let compression = CompressionLayer::new().gzip(true).br(true);

    let app = api::create_router(Arc::clone(&ops))
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("DorkOS listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ops.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
