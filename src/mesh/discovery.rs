//! Agent discovery: a bounded depth-limited scan over configured roots.
//!
//! Each directory is classified by a chain of detection strategies; the
//! first match emits a candidate. Symlinks are not followed, and well-known
//! build outputs are pruned from the walk.

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::manifest::{AgentManifest, AgentRuntimeKind};

/// Directories never descended into.
const DEFAULT_EXCLUDED: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "__pycache__",
    ".venv",
    ".next",
    ".cache",
];

pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateHints {
    pub suggested_name: String,
    pub detected_runtime: AgentRuntimeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCandidate {
    pub path: PathBuf,
    pub strategy: String,
    pub hints: CandidateHints,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub max_depth: Option<usize>,
    pub excluded_dirs: Option<Vec<String>>,
}

pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, dir: &Path) -> Option<CandidateHints>;
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent".to_string())
}

/// `CLAUDE.md` marks a Claude Code project.
struct ClaudeCodeStrategy;

impl DetectionStrategy for ClaudeCodeStrategy {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    fn detect(&self, dir: &Path) -> Option<CandidateHints> {
        dir.join("CLAUDE.md").is_file().then(|| CandidateHints {
            suggested_name: dir_name(dir),
            detected_runtime: AgentRuntimeKind::ClaudeCode,
            inferred_capabilities: None,
            description: None,
        })
    }
}

/// `.cursor/` marks a Cursor project.
struct CursorStrategy;

impl DetectionStrategy for CursorStrategy {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn detect(&self, dir: &Path) -> Option<CandidateHints> {
        dir.join(".cursor").is_dir().then(|| CandidateHints {
            suggested_name: dir_name(dir),
            detected_runtime: AgentRuntimeKind::Cursor,
            inferred_capabilities: None,
            description: None,
        })
    }
}

/// `.codex/` marks a Codex project.
struct CodexStrategy;

impl DetectionStrategy for CodexStrategy {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn detect(&self, dir: &Path) -> Option<CandidateHints> {
        dir.join(".codex").is_dir().then(|| CandidateHints {
            suggested_name: dir_name(dir),
            detected_runtime: AgentRuntimeKind::Codex,
            inferred_capabilities: None,
            description: None,
        })
    }
}

/// An existing manifest file marks an already-registered agent for
/// auto-import; runtime and name come from the manifest itself.
struct ManifestStrategy;

impl DetectionStrategy for ManifestStrategy {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn detect(&self, dir: &Path) -> Option<CandidateHints> {
        let manifest = AgentManifest::read_from_project(dir).ok().flatten()?;
        Some(CandidateHints {
            suggested_name: manifest.name.clone(),
            detected_runtime: manifest.runtime,
            inferred_capabilities: (!manifest.capabilities.is_empty())
                .then(|| manifest.capabilities.clone()),
            description: manifest.description,
        })
    }
}

/// Best-effort fallback: an `AGENTS.md` next to source control smells like
/// an agent project, with lower confidence than the sentinel strategies.
struct HeuristicStrategy;

impl DetectionStrategy for HeuristicStrategy {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn detect(&self, dir: &Path) -> Option<CandidateHints> {
        (dir.join("AGENTS.md").is_file() && dir.join(".git").exists()).then(|| CandidateHints {
            suggested_name: dir_name(dir),
            detected_runtime: AgentRuntimeKind::Other,
            inferred_capabilities: None,
            description: Some("detected heuristically".to_string()),
        })
    }
}

pub struct DiscoveryScanner {
    strategies: Vec<Box<dyn DetectionStrategy>>,
}

impl DiscoveryScanner {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(ClaudeCodeStrategy),
                Box::new(CursorStrategy),
                Box::new(CodexStrategy),
                Box::new(ManifestStrategy),
                Box::new(HeuristicStrategy),
            ],
        }
    }

    /// Classify a single directory against the strategy chain.
    pub fn classify(&self, dir: &Path) -> Option<(String, CandidateHints)> {
        self.strategies
            .iter()
            .find_map(|s| s.detect(dir).map(|hints| (s.name().to_string(), hints)))
    }

    /// Walk the roots, emitting one candidate per matching directory.
    pub fn discover(&self, roots: &[PathBuf], opts: &DiscoveryOptions) -> Vec<DiscoveryCandidate> {
        let max_depth = opts.max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
        let excluded: HashSet<String> = DEFAULT_EXCLUDED
            .iter()
            .map(|s| (*s).to_string())
            .chain(opts.excluded_dirs.clone().unwrap_or_default())
            .collect();

        let mut candidates = Vec::new();
        for root in roots {
            let excluded = excluded.clone();
            let walker = WalkBuilder::new(root)
                .max_depth(Some(max_depth))
                .follow_links(false)
                .standard_filters(false)
                .filter_entry(move |entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map_or(true, |name| !excluded.contains(name))
                })
                .build();

            for entry in walker.flatten() {
                if !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    continue;
                }
                if let Some((strategy, hints)) = self.classify(entry.path()) {
                    candidates.push(DiscoveryCandidate {
                        path: entry.path().to_path_buf(),
                        strategy,
                        hints,
                        discovered_at: Utc::now(),
                    });
                }
            }
        }
        candidates
    }
}

impl Default for DiscoveryScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> DiscoveryScanner {
        DiscoveryScanner::new()
    }

    #[test]
    fn detects_claude_code_projects() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("proj-x");
        fs::create_dir(&project).unwrap();
        fs::write(project.join("CLAUDE.md"), "# agent").unwrap();

        let candidates = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions {
                max_depth: Some(2),
                ..DiscoveryOptions::default()
            },
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].strategy, "claude-code");
        assert_eq!(candidates[0].path, project);
        assert_eq!(candidates[0].hints.suggested_name, "proj-x");
    }

    #[test]
    fn detects_cursor_and_codex() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a").join(".cursor")).unwrap();
        fs::create_dir_all(temp.path().join("b").join(".codex")).unwrap();

        let mut candidates = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions::default(),
        );
        candidates.sort_by(|x, y| x.path.cmp(&y.path));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].strategy, "cursor");
        assert_eq!(candidates[1].strategy, "codex");
    }

    #[test]
    fn depth_bound_is_respected() {
        let temp = TempDir::new().unwrap();
        let deep = temp.path().join("a").join("b").join("c").join("proj");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("CLAUDE.md"), "x").unwrap();

        let shallow = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions {
                max_depth: Some(2),
                ..DiscoveryOptions::default()
            },
        );
        assert!(shallow.is_empty());

        let deep_enough = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions {
                max_depth: Some(5),
                ..DiscoveryOptions::default()
            },
        );
        assert_eq!(deep_enough.len(), 1);
    }

    #[test]
    fn excluded_dirs_are_pruned() {
        let temp = TempDir::new().unwrap();
        let hidden = temp.path().join("node_modules").join("pkg");
        fs::create_dir_all(&hidden).unwrap();
        fs::write(hidden.join("CLAUDE.md"), "x").unwrap();

        let candidates = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions::default(),
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn first_matching_strategy_wins() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("both");
        fs::create_dir_all(project.join(".cursor")).unwrap();
        fs::write(project.join("CLAUDE.md"), "x").unwrap();

        let candidates = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions::default(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].strategy, "claude-code");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let project = outside.path().join("proj");
        fs::create_dir(&project).unwrap();
        fs::write(project.join("CLAUDE.md"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        let candidates = scanner().discover(
            &[temp.path().to_path_buf()],
            &DiscoveryOptions::default(),
        );
        assert!(candidates.is_empty());
    }
}
