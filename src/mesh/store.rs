//! Mesh durable storage: manifests, denials, events, and access rules.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::access::{AccessAction, AccessRule};
use super::manifest::AgentManifest;

#[derive(Error, Debug)]
pub enum MeshStoreError {
    #[error("mesh store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("manifest serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("a manifest is already registered for {0}")]
    PathTaken(String),
}

pub type MeshStoreResult<T> = Result<T, MeshStoreError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialRecord {
    pub path: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub denied_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshEvent {
    pub id: i64,
    pub kind: String,
    pub subject: String,
    pub ts: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS manifests (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    project_path  TEXT NOT NULL UNIQUE,
    json          TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS denials (
    path       TEXT PRIMARY KEY,
    strategy   TEXT NOT NULL,
    reason     TEXT,
    denied_at  TEXT NOT NULL,
    denied_by  TEXT
);
CREATE TABLE IF NOT EXISTS events (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    kind    TEXT NOT NULL,
    subject TEXT NOT NULL,
    ts      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS access_rules (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    from_ns  TEXT NOT NULL,
    to_ns    TEXT NOT NULL,
    action   TEXT NOT NULL,
    reason   TEXT
);
";

/// Thread-safe mesh store handle.
#[derive(Clone)]
pub struct MeshStore {
    conn: Arc<Mutex<Connection>>,
}

impl MeshStore {
    pub fn open<P: AsRef<Path>>(path: P) -> MeshStoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> MeshStoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Manifests ====================

    /// Exactly one manifest per project path; a second insert is rejected.
    pub fn insert_manifest(&self, manifest: &AgentManifest) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(manifest)?;
        conn.execute(
            "INSERT INTO manifests (id, name, project_path, json, registered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                manifest.id,
                manifest.name,
                manifest.project_path.to_string_lossy(),
                json,
                manifest.registered_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MeshStoreError::PathTaken(manifest.project_path.display().to_string())
            }
            other => MeshStoreError::Sqlite(other),
        })?;
        Ok(())
    }

    pub fn update_manifest(&self, manifest: &AgentManifest) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(manifest)?;
        conn.execute(
            "UPDATE manifests SET name = ?2, json = ?3 WHERE id = ?1",
            params![manifest.id, manifest.name, json],
        )?;
        Ok(())
    }

    pub fn get_manifest(&self, id: &str) -> MeshStoreResult<Option<AgentManifest>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT json FROM manifests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(MeshStoreError::from))
            .transpose()
    }

    pub fn get_manifest_by_path(&self, path: &Path) -> MeshStoreResult<Option<AgentManifest>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT json FROM manifests WHERE project_path = ?1",
                params![path.to_string_lossy()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(MeshStoreError::from))
            .transpose()
    }

    pub fn list_manifests(&self) -> MeshStoreResult<Vec<AgentManifest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT json FROM manifests ORDER BY name ASC")?;
        let manifests = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|j| serde_json::from_str(&j).ok())
            .collect();
        Ok(manifests)
    }

    pub fn delete_manifest(&self, id: &str) -> MeshStoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM manifests WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> MeshStoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE manifests SET last_seen_at = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    pub fn last_seen(&self, id: &str) -> MeshStoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let ts: Option<String> = conn
            .query_row(
                "SELECT last_seen_at FROM manifests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }))
    }

    // ==================== Denials ====================

    pub fn insert_denial(&self, record: &DenialRecord) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO denials (path, strategy, reason, denied_at, denied_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.path,
                record.strategy,
                record.reason,
                record.denied_at.to_rfc3339(),
                record.denied_by,
            ],
        )?;
        Ok(())
    }

    pub fn delete_denial(&self, path: &str) -> MeshStoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM denials WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn is_denied(&self, path: &Path) -> MeshStoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM denials WHERE path = ?1",
            params![path.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_denials(&self) -> MeshStoreResult<Vec<DenialRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path, strategy, reason, denied_at, denied_by
             FROM denials ORDER BY denied_at DESC",
        )?;
        let denials = stmt
            .query_map([], |row| {
                let denied_at: String = row.get(3)?;
                Ok(DenialRecord {
                    path: row.get(0)?,
                    strategy: row.get(1)?,
                    reason: row.get(2)?,
                    denied_at: DateTime::parse_from_rfc3339(&denied_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    denied_by: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(denials)
    }

    // ==================== Events ====================

    pub fn record_event(&self, kind: &str, subject: &str) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (kind, subject, ts) VALUES (?1, ?2, ?3)",
            params![kind, subject, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: usize) -> MeshStoreResult<Vec<MeshEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, subject, ts FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], |row| {
                let ts: String = row.get(3)?;
                Ok(MeshEvent {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    subject: row.get(2)?,
                    ts: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ==================== Access rules ====================

    pub fn add_access_rule(&self, rule: &AccessRule) -> MeshStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let action = match rule.action {
            AccessAction::Allow => "allow",
            AccessAction::Deny => "deny",
        };
        conn.execute(
            "INSERT INTO access_rules (from_ns, to_ns, action, reason) VALUES (?1, ?2, ?3, ?4)",
            params![rule.from, rule.to, action, rule.reason],
        )?;
        Ok(())
    }

    pub fn list_access_rules(&self) -> MeshStoreResult<Vec<AccessRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT from_ns, to_ns, action, reason FROM access_rules ORDER BY id")?;
        let rules = stmt
            .query_map([], |row| {
                let action: String = row.get(2)?;
                Ok(AccessRule {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    action: if action == "deny" {
                        AccessAction::Deny
                    } else {
                        AccessAction::Allow
                    },
                    reason: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::manifest::{AgentRuntimeKind, Behavior, ManifestBudget};
    use std::path::PathBuf;

    fn manifest(id: &str, name: &str, path: &str) -> AgentManifest {
        AgentManifest {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            runtime: AgentRuntimeKind::ClaudeCode,
            capabilities: vec![],
            behavior: Behavior::default(),
            budget: ManifestBudget::default(),
            persona: None,
            registered_at: Utc::now(),
            registered_by: "test".to_string(),
            project_path: PathBuf::from(path),
            scan_root: None,
            icon: None,
            color: None,
        }
    }

    #[test]
    fn one_manifest_per_project_path() {
        let store = MeshStore::open_in_memory().unwrap();
        store
            .insert_manifest(&manifest("m1", "a", "/ws/x"))
            .unwrap();
        let err = store
            .insert_manifest(&manifest("m2", "b", "/ws/x"))
            .unwrap_err();
        assert!(matches!(err, MeshStoreError::PathTaken(_)));
    }

    #[test]
    fn manifest_round_trips_through_store() {
        let store = MeshStore::open_in_memory().unwrap();
        let original = manifest("m1", "team.helper", "/ws/x");
        store.insert_manifest(&original).unwrap();

        let loaded = store.get_manifest("m1").unwrap().unwrap();
        assert_eq!(loaded, original);
        let by_path = store
            .get_manifest_by_path(Path::new("/ws/x"))
            .unwrap()
            .unwrap();
        assert_eq!(by_path.id, "m1");
    }

    #[test]
    fn heartbeat_updates_last_seen() {
        let store = MeshStore::open_in_memory().unwrap();
        store
            .insert_manifest(&manifest("m1", "a", "/ws/x"))
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        assert!(store.heartbeat("m1", later).unwrap());
        let seen = store.last_seen("m1").unwrap().unwrap();
        assert_eq!(seen.timestamp(), later.timestamp());
        assert!(!store.heartbeat("ghost", later).unwrap());
    }

    #[test]
    fn denial_round_trip_restores_pre_state() {
        let store = MeshStore::open_in_memory().unwrap();
        assert!(store.list_denials().unwrap().is_empty());

        store
            .insert_denial(&DenialRecord {
                path: "/ws/private".to_string(),
                strategy: "claude-code".to_string(),
                reason: Some("private".to_string()),
                denied_at: Utc::now(),
                denied_by: None,
            })
            .unwrap();
        assert!(store.is_denied(Path::new("/ws/private")).unwrap());
        assert_eq!(store.list_denials().unwrap().len(), 1);

        assert!(store.delete_denial("/ws/private").unwrap());
        assert!(!store.delete_denial("/ws/private").unwrap());
        assert!(store.list_denials().unwrap().is_empty());
    }

    #[test]
    fn events_are_recorded_newest_first() {
        let store = MeshStore::open_in_memory().unwrap();
        store.record_event("registered", "m1").unwrap();
        store.record_event("deregistered", "m1").unwrap();

        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "deregistered");
    }

    #[test]
    fn access_rules_round_trip() {
        let store = MeshStore::open_in_memory().unwrap();
        store
            .add_access_rule(&AccessRule {
                from: "team".to_string(),
                to: "*".to_string(),
                action: AccessAction::Allow,
                reason: Some("trusted".to_string()),
            })
            .unwrap();

        let rules = store.list_access_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, AccessAction::Allow);
        assert_eq!(rules[0].to, "*");
    }
}
