//! Read-only access to the LLM runtime's on-disk session transcripts.
//!
//! The runtime writes one JSONL file per session under a per-project
//! directory whose name is derived deterministically from the working
//! directory. This reader performs no writes; it is injected into Pulse,
//! Mesh, the MCP tools, and the session broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Summary of a session, assembled from its transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    /// First user message, used as a display title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last assistant message, truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// One line of a transcript. The runtime's schema is open-ended, so the
/// message body stays a raw value; only the routing fields are typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

const PREVIEW_MAX_CHARS: usize = 200;

pub struct TranscriptReader {
    root: PathBuf,
}

impl TranscriptReader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-project transcript directory for a working directory.
    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.root.join(encode_cwd(cwd))
    }

    /// List session summaries for a working directory, newest first.
    pub fn list_sessions(&self, cwd: &Path) -> io::Result<Vec<SessionSummary>> {
        let dir = self.project_dir(cwd);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let created_at = entry
                .metadata()
                .and_then(|m| m.created().or_else(|_| m.modified()))
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let (title, preview) = summarize(&path)?;
            summaries.push(SessionSummary {
                id: id.to_string(),
                title,
                created_at,
                preview,
            });
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Read the full line-oriented message stream for a session, searching
    /// every project directory. Newest file wins on duplicate ids.
    pub fn read_transcript(&self, session_id: &str) -> io::Result<Vec<TranscriptRecord>> {
        let path = self
            .find_transcript(session_id)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "transcript not found"))?;

        let file = fs::File::open(&path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Malformed lines are skipped rather than failing the read.
            if let Ok(record) = serde_json::from_str::<TranscriptRecord>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Locate the transcript file for a session id across all projects.
    pub fn find_transcript(&self, session_id: &str) -> io::Result<Option<PathBuf>> {
        if !self.root.is_dir() {
            return Ok(None);
        }
        let file_name = format!("{session_id}.jsonl");
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;

        for project in fs::read_dir(&self.root)? {
            let project = project?;
            if !project.file_type()?.is_dir() {
                continue;
            }
            let candidate = project.path().join(&file_name);
            let Ok(meta) = candidate.metadata() else {
                continue;
            };
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(ts, _)| modified > *ts) {
                newest = Some((modified, candidate));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

/// Deterministic directory name for a working directory: every path
/// separator and dot collapses to `-`.
pub fn encode_cwd(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' | ':' => '-',
            other => other,
        })
        .collect()
}

/// Extract (first user message, last assistant message) from a transcript.
fn summarize(path: &Path) -> io::Result<(Option<String>, Option<String>)> {
    let file = fs::File::open(path)?;
    let mut title = None;
    let mut preview = None;

    for line in BufReader::new(file).lines() {
        let line = line?;
        let Ok(record) = serde_json::from_str::<TranscriptRecord>(&line) else {
            continue;
        };
        match record.kind.as_str() {
            "user" if title.is_none() => title = extract_text(&record.message),
            "assistant" => {
                if let Some(text) = extract_text(&record.message) {
                    preview = Some(truncate(&text, PREVIEW_MAX_CHARS));
                }
            }
            _ => {}
        }
    }
    Ok((title, preview))
}

/// Pull displayable text out of a message body: either a plain string
/// `content` or the first `text` block in a content array.
fn extract_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => blocks.iter().find_map(|block| {
            (block.get("type").and_then(Value::as_str) == Some("text"))
                .then(|| block.get("text").and_then(Value::as_str).map(String::from))
                .flatten()
        }),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_transcript(root: &Path, cwd: &Path, session_id: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join(encode_cwd(cwd));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{session_id}.jsonl"));
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn encode_cwd_is_deterministic() {
        assert_eq!(encode_cwd(Path::new("/ws/proj.x")), "-ws-proj-x");
        assert_eq!(
            encode_cwd(Path::new("/ws/proj.x")),
            encode_cwd(Path::new("/ws/proj.x"))
        );
    }

    #[test]
    fn lists_sessions_with_title_and_preview() {
        let temp = TempDir::new().unwrap();
        let cwd = Path::new("/ws/demo");
        write_transcript(
            temp.path(),
            cwd,
            "sess-1",
            &[
                r#"{"type":"user","message":{"content":"fix the bug"}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"on it"}]}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#,
            ],
        );

        let reader = TranscriptReader::new(temp.path().to_path_buf());
        let sessions = reader.list_sessions(cwd).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "sess-1");
        assert_eq!(sessions[0].title.as_deref(), Some("fix the bug"));
        assert_eq!(sessions[0].preview.as_deref(), Some("done"));
    }

    #[test]
    fn list_sessions_empty_for_unknown_cwd() {
        let temp = TempDir::new().unwrap();
        let reader = TranscriptReader::new(temp.path().to_path_buf());
        assert!(reader.list_sessions(Path::new("/nowhere")).unwrap().is_empty());
    }

    #[test]
    fn read_transcript_skips_malformed_lines() {
        let temp = TempDir::new().unwrap();
        write_transcript(
            temp.path(),
            Path::new("/ws/demo"),
            "sess-2",
            &[
                r#"{"type":"user","message":{"content":"hello"}}"#,
                "not json at all",
                r#"{"type":"assistant","message":{"content":"hi"}}"#,
            ],
        );

        let reader = TranscriptReader::new(temp.path().to_path_buf());
        let records = reader.read_transcript("sess-2").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "user");
    }

    #[test]
    fn read_transcript_missing_session_is_not_found() {
        let temp = TempDir::new().unwrap();
        let reader = TranscriptReader::new(temp.path().to_path_buf());
        let err = reader.read_transcript("ghost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
