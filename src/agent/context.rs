//! System-prompt context assembly.
//!
//! Each send gets a suffix with an `<env>` block, a `<git_status>` block,
//! and, when the working directory carries a registered manifest with an
//! enabled persona, `<agent_identity>` and `<agent_persona>` blocks.

use chrono::Utc;
use std::fmt::Write;
use std::path::Path;

use crate::mesh::manifest::AgentManifest;

/// Static server facts rendered into every `<env>` block.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub product: &'static str,
    pub version: &'static str,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(port: u16) -> Self {
        Self {
            product: "DorkOS",
            version: env!("CARGO_PKG_VERSION"),
            port,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    pub branch: String,
    pub ahead: u32,
    pub behind: u32,
    pub dirty: u32,
    pub detached: bool,
}

/// Run `git status --porcelain=v2 --branch` in `cwd`. Any failure (not a
/// repo, git missing) yields `None` and the block renders as not-a-repo.
pub async fn collect_git_status(cwd: &Path) -> Option<GitStatus> {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain=v2", "--branch"])
        .current_dir(cwd)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(parse_porcelain_v2(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_porcelain_v2(stdout: &str) -> GitStatus {
    let mut status = GitStatus::default();
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            status.detached = rest == "(detached)";
            status.branch = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for part in rest.split_whitespace() {
                if let Some(n) = part.strip_prefix('+') {
                    status.ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix('-') {
                    status.behind = n.parse().unwrap_or(0);
                }
            }
        } else if line.starts_with(['1', '2', 'u', '?']) {
            status.dirty += 1;
        }
    }
    status
}

/// Assemble the full context suffix for a send.
pub async fn build_context(info: &ServerInfo, cwd: &Path) -> String {
    let mut out = String::new();

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let _ = write!(
        out,
        "<env>\nworking dir: {}\nproduct: {} v{}\nport: {}\nplatform: {}\narch: {}\nruntime: rust\nhostname: {}\ntimestamp: {}\n</env>",
        cwd.display(),
        info.product,
        info.version,
        info.port,
        std::env::consts::OS,
        std::env::consts::ARCH,
        hostname,
        Utc::now().to_rfc3339(),
    );

    out.push_str("\n\n");
    match collect_git_status(cwd).await {
        Some(git) => {
            let _ = write!(
                out,
                "<git_status>\nis git repo: true\nbranch: {}\nahead: {}\nbehind: {}\ndirty: {}\ndetached: {}\n</git_status>",
                git.branch, git.ahead, git.behind, git.dirty, git.detached,
            );
        }
        None => out.push_str("<git_status>\nis git repo: false\n</git_status>"),
    }

    // Manifest-read failures are swallowed; the blocks are simply omitted.
    if let Ok(Some(manifest)) = AgentManifest::read_from_project(cwd) {
        let _ = write!(
            out,
            "\n\n<agent_identity>\nname: {}\nid: {}\ncapabilities: {}\n</agent_identity>",
            manifest.name,
            manifest.id,
            manifest.capabilities.join(", "),
        );
        if let Some(persona) = manifest.persona.as_ref().filter(|p| p.enabled) {
            let _ = write!(out, "\n\n<agent_persona>\n{}\n</agent_persona>", persona.text);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn porcelain_v2_parses_branch_and_counts() {
        let stdout = "\
# branch.oid deadbeef
# branch.head main
# branch.ab +2 -1
1 .M N... 100644 100644 100644 0 0 src/lib.rs
? untracked.txt
";
        let status = parse_porcelain_v2(stdout);
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert_eq!(status.dirty, 2);
        assert!(!status.detached);
    }

    #[test]
    fn detached_head_is_flagged() {
        let status = parse_porcelain_v2("# branch.head (detached)\n");
        assert!(status.detached);
    }

    #[tokio::test]
    async fn non_repo_renders_as_not_a_repo() {
        let temp = TempDir::new().unwrap();
        let info = ServerInfo::new(4242);
        let context = build_context(&info, temp.path()).await;
        assert!(context.contains("<env>"));
        assert!(context.contains("is git repo: false"));
        assert!(!context.contains("<agent_identity>"));
    }

    #[tokio::test]
    async fn persona_blocks_render_when_enabled() {
        use crate::mesh::manifest::{
            AgentManifest, AgentRuntimeKind, Behavior, ManifestBudget, Persona,
        };
        let temp = TempDir::new().unwrap();
        let manifest = AgentManifest {
            id: "01TEST".to_string(),
            name: "ops.helper".to_string(),
            description: None,
            runtime: AgentRuntimeKind::Other,
            capabilities: vec!["triage".to_string()],
            behavior: Behavior::default(),
            budget: ManifestBudget::default(),
            persona: Some(Persona {
                enabled: true,
                text: "Speak plainly.".to_string(),
            }),
            registered_at: Utc::now(),
            registered_by: "test".to_string(),
            project_path: temp.path().to_path_buf(),
            scan_root: None,
            icon: None,
            color: None,
        };
        manifest.write_to_project().unwrap();

        let context = build_context(&ServerInfo::new(4242), temp.path()).await;
        assert!(context.contains("<agent_identity>"));
        assert!(context.contains("name: ops.helper"));
        assert!(context.contains("Speak plainly."));
    }
}
