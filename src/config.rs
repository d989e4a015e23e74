//! Server configuration assembled from environment variables.

use std::path::{Path, PathBuf};

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Root of durable state (`~/.dork` in production).
    pub data_dir: PathBuf,
    /// Default working directory for sessions that don't specify one.
    pub default_cwd: PathBuf,
    /// Boundary guard root; every user-supplied path must resolve inside it.
    pub boundary_root: PathBuf,
    /// Directory the LLM runtime writes session transcripts into.
    pub transcripts_dir: PathBuf,
    pub pulse_enabled: bool,
    pub relay_enabled: bool,
    pub mesh_enabled: bool,
    pub tunnel_enabled: bool,
    pub production: bool,
    pub log_filter: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let production = std::env::var("DORKOS_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());

        let data_dir = std::env::var("DORKOS_DATA_DIR").map_or_else(
            |_| {
                if production {
                    PathBuf::from(&home).join(".dork")
                } else {
                    PathBuf::from("./.temp/.dork")
                }
            },
            PathBuf::from,
        );

        let default_cwd = std::env::var("DORKOS_DEFAULT_CWD").map_or_else(
            |_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(&home)),
            PathBuf::from,
        );

        // The boundary defaults to the data dir's parent so sibling projects
        // are reachable but the wider filesystem is not.
        let boundary_root = std::env::var("DORKOS_BOUNDARY_ROOT").map_or_else(
            |_| {
                data_dir
                    .parent()
                    .map_or_else(|| PathBuf::from("/"), Path::to_path_buf)
            },
            PathBuf::from,
        );

        let transcripts_dir = std::env::var("DORKOS_TRANSCRIPTS_DIR").map_or_else(
            |_| PathBuf::from(&home).join(".dork-agent").join("projects"),
            PathBuf::from,
        );

        let log_filter = std::env::var("DORKOS_LOG").unwrap_or_else(|_| {
            if production {
                "dorkos=info,tower_http=warn".to_string()
            } else {
                "dorkos=debug,tower_http=debug".to_string()
            }
        });

        Self {
            port: std::env::var("DORKOS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4242),
            data_dir,
            default_cwd,
            boundary_root,
            transcripts_dir,
            pulse_enabled: env_flag("DORKOS_PULSE_ENABLED", true),
            relay_enabled: env_flag("DORKOS_RELAY_ENABLED", false),
            mesh_enabled: env_flag("DORKOS_MESH_ENABLED", false),
            tunnel_enabled: env_flag("DORKOS_TUNNEL_ENABLED", false),
            production,
            log_filter,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn mesh_db_path(&self) -> PathBuf {
        self.data_dir.join("mesh").join("mesh.db")
    }

    pub fn adapters_config_path(&self) -> PathBuf {
        self.data_dir.join("relay").join("adapters.json")
    }

    pub fn traces_db_path(&self) -> PathBuf {
        self.data_dir.join("relay").join("traces.db")
    }

    pub fn bindings_db_path(&self) -> PathBuf {
        self.data_dir.join("relay").join("bindings.db")
    }

    pub fn pulse_db_path(&self) -> PathBuf {
        self.data_dir.join("pulse").join("pulse.db")
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name).map_or(default, |v| {
        matches!(v.as_str(), "1" | "true" | "yes" | "on")
    })
}
