//! On-disk agent manifests.
//!
//! A registered agent carries a durable manifest file at
//! `{projectPath}/.dork/agent.json`, written atomically and pretty-printed
//! with two-space indentation and a trailing newline. The file content
//! round-trips exactly with the in-memory manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MANIFEST_DIR: &str = ".dork";
pub const MANIFEST_FILE: &str = "agent.json";

/// Runtime label detected for (or declared by) an agent project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRuntimeKind {
    ClaudeCode,
    Cursor,
    Codex,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Auto,
    Mention,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Behavior {
    pub response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_threshold: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestBudget {
    pub max_hops_per_message: u32,
    pub max_calls_per_hour: u32,
}

impl Default for ManifestBudget {
    fn default() -> Self {
        Self {
            max_hops_per_message: 8,
            max_calls_per_hour: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub enabled: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub runtime: AgentRuntimeKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub behavior: Behavior,
    #[serde(default)]
    pub budget: ManifestBudget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    pub registered_at: DateTime<Utc>,
    pub registered_by: String,
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl AgentManifest {
    /// Topology namespace: the name prefix up to the first dot.
    pub fn namespace(&self) -> &str {
        self.name.split('.').next().filter(|ns| !ns.is_empty()).unwrap_or("default")
    }

    /// Relay subject this agent is reachable on once registered.
    pub fn relay_subject(&self) -> String {
        format!("mesh.agent.{}", self.id)
    }

    pub fn manifest_path(project: &Path) -> PathBuf {
        project.join(MANIFEST_DIR).join(MANIFEST_FILE)
    }

    /// Serialize to the exact on-disk format: two-space pretty JSON plus a
    /// trailing newline.
    pub fn to_file_contents(&self) -> serde_json::Result<String> {
        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');
        Ok(contents)
    }

    /// Atomically write the manifest into the project's dot-config dir
    /// (write-temp then rename).
    pub fn write_to_project(&self) -> io::Result<()> {
        let dir = self.project_path.join(MANIFEST_DIR);
        fs::create_dir_all(&dir)?;
        let contents = self
            .to_file_contents()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let target = dir.join(MANIFEST_FILE);
        let temp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&temp, contents)?;
        fs::rename(&temp, &target)
    }

    /// Read a manifest from a project directory, if one exists. Parse
    /// failures surface as errors; a missing file is `None`.
    pub fn read_from_project(project: &Path) -> io::Result<Option<Self>> {
        let path = Self::manifest_path(project);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Remove the on-disk manifest. Idempotent.
    pub fn remove_from_project(project: &Path) -> io::Result<()> {
        match fs::remove_file(Self::manifest_path(project)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(project: &Path) -> AgentManifest {
        AgentManifest {
            id: "01J0000000000000000000AAAA".to_string(),
            name: "team.builder".to_string(),
            description: Some("builds things".to_string()),
            runtime: AgentRuntimeKind::ClaudeCode,
            capabilities: vec!["rust".to_string(), "ci".to_string()],
            behavior: Behavior::default(),
            budget: ManifestBudget::default(),
            persona: Some(Persona {
                enabled: true,
                text: "Terse and direct.".to_string(),
            }),
            registered_at: "2026-01-15T12:00:00Z".parse().unwrap(),
            registered_by: "user".to_string(),
            project_path: project.to_path_buf(),
            scan_root: None,
            icon: None,
            color: None,
        }
    }

    #[test]
    fn namespace_is_prefix_up_to_first_dot() {
        let temp = TempDir::new().unwrap();
        let mut manifest = sample(temp.path());
        assert_eq!(manifest.namespace(), "team");
        manifest.name = "solo".to_string();
        assert_eq!(manifest.namespace(), "solo");
    }

    #[test]
    fn file_round_trips_byte_exact() {
        let temp = TempDir::new().unwrap();
        let manifest = sample(temp.path());
        manifest.write_to_project().unwrap();

        let path = AgentManifest::manifest_path(temp.path());
        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.ends_with('\n'));
        assert!(on_disk.contains("  \"id\""), "two-space indentation");

        let parsed = AgentManifest::read_from_project(temp.path())
            .unwrap()
            .unwrap();
        assert_eq!(parsed, manifest);

        // Re-writing the parsed manifest reproduces the file exactly.
        parsed.write_to_project().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), on_disk);
    }

    #[test]
    fn read_missing_manifest_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(AgentManifest::read_from_project(temp.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manifest = sample(temp.path());
        manifest.write_to_project().unwrap();

        AgentManifest::remove_from_project(temp.path()).unwrap();
        AgentManifest::remove_from_project(temp.path()).unwrap();
        assert!(!AgentManifest::manifest_path(temp.path()).exists());
    }
}
