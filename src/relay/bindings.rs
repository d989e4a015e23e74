//! Binding store: adapter-to-agent mappings.
//!
//! A binding routes inbound adapter traffic into an Agent Manager session
//! for a specific working directory. Persisted in SQLite; duplicates over
//! the (adapter, agent, filter) tuple are rejected; deletion is idempotent
//! and never touches in-flight runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::{DomainError, ErrorCode};

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("binding store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("a binding already exists for that adapter/agent/filter tuple")]
    Duplicate,
}

impl From<BindingError> for DomainError {
    fn from(err: BindingError) -> Self {
        DomainError::new(ErrorCode::BindingCreateFailed, err.to_string())
    }
}

pub type BindingResult<T> = Result<T, BindingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategy {
    PerChat,
    PerUser,
    Stateless,
}

impl SessionStrategy {
    fn as_str(self) -> &'static str {
        match self {
            Self::PerChat => "per-chat",
            Self::PerUser => "per-user",
            Self::Stateless => "stateless",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "per-chat" => Self::PerChat,
            "per-user" => Self::PerUser,
            _ => Self::Stateless,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub id: String,
    pub adapter_id: String,
    pub agent_id: String,
    pub agent_dir: PathBuf,
    pub session_strategy: SessionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Binding {
    /// Derive the Agent Manager session key for an inbound message.
    ///
    /// `stateless` gets a fresh key per message; `per-user` is stable over
    /// (adapter, chat); `per-chat` additionally folds in the channel type.
    pub fn session_key(&self, chat_id: Option<&str>, channel_type: Option<&str>) -> String {
        match self.session_strategy {
            SessionStrategy::Stateless => format!("relay-{}", uuid::Uuid::new_v4()),
            SessionStrategy::PerUser => {
                stable_key(&[&self.adapter_id, chat_id.unwrap_or("")])
            }
            SessionStrategy::PerChat => stable_key(&[
                &self.adapter_id,
                chat_id.unwrap_or(""),
                channel_type.unwrap_or(""),
            ]),
        }
    }

    /// Does this binding match an inbound message's routing fields?
    pub fn matches(&self, chat_id: Option<&str>, channel_type: Option<&str>) -> bool {
        let chat_ok = self
            .chat_id
            .as_deref()
            .map_or(true, |want| Some(want) == chat_id);
        let channel_ok = self
            .channel_type
            .as_deref()
            .map_or(true, |want| Some(want) == channel_type);
        chat_ok && channel_ok
    }
}

fn stable_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = format!("{digest:x}").chars().take(32).collect();
    format!("relay-{short}")
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bindings (
    id              TEXT PRIMARY KEY,
    adapter_id      TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    agent_dir       TEXT NOT NULL,
    session_strategy TEXT NOT NULL,
    chat_id         TEXT,
    channel_type    TEXT,
    label           TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_tuple
    ON bindings(adapter_id, agent_id, IFNULL(chat_id, ''), IFNULL(channel_type, ''));
";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBinding {
    pub adapter_id: String,
    pub agent_id: String,
    pub agent_dir: PathBuf,
    #[serde(default)]
    pub session_strategy: SessionStrategy,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for SessionStrategy {
    fn default() -> Self {
        Self::PerChat
    }
}

/// Thread-safe binding store handle.
#[derive(Clone, Debug)]
pub struct BindingStore {
    conn: Arc<Mutex<Connection>>,
}

impl BindingStore {
    pub fn open<P: AsRef<Path>>(path: P) -> BindingResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> BindingResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> BindingResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn get_all(&self) -> BindingResult<Vec<Binding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, adapter_id, agent_id, agent_dir, session_strategy, chat_id,
                    channel_type, label, created_at
             FROM bindings ORDER BY created_at ASC",
        )?;
        let bindings = stmt
            .query_map([], row_to_binding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    /// Bindings that route traffic for an adapter.
    pub fn for_adapter(&self, adapter_id: &str) -> BindingResult<Vec<Binding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, adapter_id, agent_id, agent_dir, session_strategy, chat_id,
                    channel_type, label, created_at
             FROM bindings WHERE adapter_id = ?1 ORDER BY created_at ASC",
        )?;
        let bindings = stmt
            .query_map(params![adapter_id], row_to_binding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    /// Bindings whose agent directory matches (used by Mesh topology).
    pub fn for_agent_dir(&self, agent_dir: &Path) -> BindingResult<Vec<Binding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, adapter_id, agent_id, agent_dir, session_strategy, chat_id,
                    channel_type, label, created_at
             FROM bindings WHERE agent_dir = ?1",
        )?;
        let bindings = stmt
            .query_map(params![agent_dir.to_string_lossy()], row_to_binding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    /// Atomic create; duplicates over the filter tuple are rejected.
    pub fn create(&self, new: NewBinding) -> BindingResult<Binding> {
        let binding = Binding {
            id: uuid::Uuid::new_v4().to_string(),
            label: new.label.unwrap_or_else(|| {
                format!("{} -> {}", new.adapter_id, new.agent_id)
            }),
            adapter_id: new.adapter_id,
            agent_id: new.agent_id,
            agent_dir: new.agent_dir,
            session_strategy: new.session_strategy,
            chat_id: new.chat_id,
            channel_type: new.channel_type,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bindings
             (id, adapter_id, agent_id, agent_dir, session_strategy, chat_id, channel_type, label, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                binding.id,
                binding.adapter_id,
                binding.agent_id,
                binding.agent_dir.to_string_lossy(),
                binding.session_strategy.as_str(),
                binding.chat_id,
                binding.channel_type,
                binding.label,
                binding.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                BindingError::Duplicate
            }
            other => BindingError::Sqlite(other),
        })?;
        Ok(binding)
    }

    /// Idempotent delete. In-flight runs are unaffected.
    pub fn delete(&self, id: &str) -> BindingResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM bindings WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<Binding> {
    let strategy: String = row.get(4)?;
    let created: String = row.get(8)?;
    Ok(Binding {
        id: row.get(0)?,
        adapter_id: row.get(1)?,
        agent_id: row.get(2)?,
        agent_dir: PathBuf::from(row.get::<_, String>(3)?),
        session_strategy: SessionStrategy::parse(&strategy),
        chat_id: row.get(5)?,
        channel_type: row.get(6)?,
        label: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_binding(chat_id: Option<&str>) -> NewBinding {
        NewBinding {
            adapter_id: "chat-1".to_string(),
            agent_id: "agent-a".to_string(),
            agent_dir: PathBuf::from("/ws/proj"),
            session_strategy: SessionStrategy::PerChat,
            chat_id: chat_id.map(String::from),
            channel_type: None,
            label: None,
        }
    }

    #[test]
    fn create_and_list() {
        let store = BindingStore::open_in_memory().unwrap();
        let binding = store.create(new_binding(Some("room-1"))).unwrap();
        assert_eq!(binding.adapter_id, "chat-1");
        assert!(!binding.id.is_empty());

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_strategy, SessionStrategy::PerChat);
    }

    #[test]
    fn duplicate_tuple_is_rejected() {
        let store = BindingStore::open_in_memory().unwrap();
        store.create(new_binding(Some("room-1"))).unwrap();
        let err = store.create(new_binding(Some("room-1"))).unwrap_err();
        assert!(matches!(err, BindingError::Duplicate));

        // A different filter tuple is a different binding.
        store.create(new_binding(Some("room-2"))).unwrap();
    }

    #[test]
    fn delete_is_idempotent() {
        let store = BindingStore::open_in_memory().unwrap();
        let binding = store.create(new_binding(None)).unwrap();
        assert!(store.delete(&binding.id).unwrap());
        assert!(!store.delete(&binding.id).unwrap());
    }

    #[test]
    fn session_keys_follow_strategy() {
        let mut binding = Binding {
            id: "b1".to_string(),
            adapter_id: "chat-1".to_string(),
            agent_id: "a".to_string(),
            agent_dir: PathBuf::from("/ws"),
            session_strategy: SessionStrategy::PerUser,
            chat_id: None,
            channel_type: None,
            label: "l".to_string(),
            created_at: Utc::now(),
        };

        let a = binding.session_key(Some("u1"), Some("dm"));
        let b = binding.session_key(Some("u1"), Some("group"));
        assert_eq!(a, b, "per-user ignores channel type");

        binding.session_strategy = SessionStrategy::PerChat;
        let c = binding.session_key(Some("u1"), Some("dm"));
        let d = binding.session_key(Some("u1"), Some("group"));
        assert_ne!(c, d, "per-chat folds in channel type");

        binding.session_strategy = SessionStrategy::Stateless;
        assert_ne!(
            binding.session_key(Some("u1"), None),
            binding.session_key(Some("u1"), None),
            "stateless is fresh every message"
        );
    }

    #[test]
    fn matches_honors_filters() {
        let mut binding = Binding {
            id: "b1".to_string(),
            adapter_id: "chat-1".to_string(),
            agent_id: "a".to_string(),
            agent_dir: PathBuf::from("/ws"),
            session_strategy: SessionStrategy::PerChat,
            chat_id: Some("room-1".to_string()),
            channel_type: None,
            label: "l".to_string(),
            created_at: Utc::now(),
        };

        assert!(binding.matches(Some("room-1"), Some("dm")));
        assert!(!binding.matches(Some("room-2"), None));

        binding.chat_id = None;
        assert!(binding.matches(Some("anything"), None));
    }
}
