//! Pulse durable storage: schedules and runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::agent::runtime::PermissionMode;
use crate::events::Usage;

#[derive(Error, Debug)]
pub enum PulseStoreError {
    #[error("pulse store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

pub type PulseStoreResult<T> = Result<T, PulseStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    PendingApproval,
    Paused,
    Errored,
}

impl ScheduleStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingApproval => "pending_approval",
            Self::Paused => "paused",
            Self::Errored => "errored",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "pending_approval" => Self::PendingApproval,
            "paused" => Self::Paused,
            _ => Self::Errored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub prompt: String,
    pub permission_mode: PermissionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
    pub enabled: bool,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// A schedule dispatches only when enabled and active.
    pub fn can_run(&self) -> bool {
        self.enabled && self.status == ScheduleStatus::Active
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub prompt: String,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_runtime_ms: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub cwd: Option<PathBuf>,
    pub prompt: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub model: Option<String>,
    pub max_runtime_ms: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub schedule_id: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_cost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    pub schedule_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Terminal facts persisted when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub output: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub usage: Option<Usage>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schedules (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    cron            TEXT NOT NULL,
    timezone        TEXT,
    cwd             TEXT,
    prompt          TEXT NOT NULL,
    permission_mode TEXT NOT NULL,
    model           TEXT,
    max_runtime_ms  INTEGER,
    enabled         INTEGER NOT NULL DEFAULT 1,
    status          TEXT NOT NULL,
    approved_by     TEXT,
    created_by      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_run_at     TEXT
);
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    trigger     TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT,
    output      TEXT,
    error       TEXT,
    session_id  TEXT,
    token_cost  INTEGER,
    duration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_runs_schedule ON runs(schedule_id, created_at DESC);
";

/// Thread-safe pulse store handle.
#[derive(Clone)]
pub struct PulseStore {
    conn: Arc<Mutex<Connection>>,
}

impl PulseStore {
    pub fn open<P: AsRef<Path>>(path: P) -> PulseStoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> PulseStoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> PulseStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Schedules ====================

    pub fn create_schedule(
        &self,
        id: &str,
        new: &NewSchedule,
        status: ScheduleStatus,
        created_by: &str,
    ) -> PulseStoreResult<Schedule> {
        let now = Utc::now();
        let schedule = Schedule {
            id: id.to_string(),
            name: new.name.clone(),
            cron: new.cron.clone(),
            timezone: new.timezone.clone(),
            cwd: new.cwd.clone(),
            prompt: new.prompt.clone(),
            permission_mode: new.permission_mode,
            model: new.model.clone(),
            max_runtime_ms: new.max_runtime_ms,
            enabled: new.enabled.unwrap_or(true),
            status,
            approved_by: None,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules
             (id, name, cron, timezone, cwd, prompt, permission_mode, model, max_runtime_ms,
              enabled, status, approved_by, created_by, created_at, updated_at, last_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, NULL)",
            params![
                schedule.id,
                schedule.name,
                schedule.cron,
                schedule.timezone,
                schedule.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                schedule.prompt,
                serde_json::to_string(&schedule.permission_mode)
                    .unwrap_or_else(|_| "\"default\"".to_string()),
                schedule.model,
                schedule.max_runtime_ms.map(|v| v as i64),
                schedule.enabled,
                schedule.status.as_str(),
                schedule.approved_by,
                schedule.created_by,
                now.to_rfc3339(),
            ],
        )?;
        Ok(schedule)
    }

    pub fn get_schedule(&self, id: &str) -> PulseStoreResult<Schedule> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&select_schedules("WHERE id = ?1"))?;
        stmt.query_row(params![id], row_to_schedule)
            .optional()?
            .ok_or_else(|| PulseStoreError::ScheduleNotFound(id.to_string()))
    }

    pub fn list_schedules(&self) -> PulseStoreResult<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&select_schedules("ORDER BY created_at ASC"))?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    pub fn update_schedule(&self, id: &str, update: &ScheduleUpdate) -> PulseStoreResult<Schedule> {
        let mut schedule = self.get_schedule(id)?;
        if let Some(name) = &update.name {
            schedule.name = name.clone();
        }
        if let Some(cron) = &update.cron {
            schedule.cron = cron.clone();
        }
        if let Some(timezone) = &update.timezone {
            schedule.timezone = Some(timezone.clone());
        }
        if let Some(cwd) = &update.cwd {
            schedule.cwd = Some(cwd.clone());
        }
        if let Some(prompt) = &update.prompt {
            schedule.prompt = prompt.clone();
        }
        if let Some(mode) = update.permission_mode {
            schedule.permission_mode = mode;
        }
        if let Some(model) = &update.model {
            schedule.model = Some(model.clone());
        }
        if let Some(max_runtime) = update.max_runtime_ms {
            schedule.max_runtime_ms = Some(max_runtime);
        }
        if let Some(enabled) = update.enabled {
            schedule.enabled = enabled;
        }
        schedule.updated_at = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET name = ?2, cron = ?3, timezone = ?4, cwd = ?5, prompt = ?6,
                    permission_mode = ?7, model = ?8, max_runtime_ms = ?9, enabled = ?10,
                    updated_at = ?11
             WHERE id = ?1",
            params![
                schedule.id,
                schedule.name,
                schedule.cron,
                schedule.timezone,
                schedule.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                schedule.prompt,
                serde_json::to_string(&schedule.permission_mode)
                    .unwrap_or_else(|_| "\"default\"".to_string()),
                schedule.model,
                schedule.max_runtime_ms.map(|v| v as i64),
                schedule.enabled,
                schedule.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(schedule)
    }

    pub fn set_schedule_status(
        &self,
        id: &str,
        status: ScheduleStatus,
        approver: Option<&str>,
    ) -> PulseStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE schedules SET status = ?2, approved_by = COALESCE(?3, approved_by),
                    updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), approver, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(PulseStoreError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_last_run(&self, id: &str, at: DateTime<Utc>) -> PulseStoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: &str) -> PulseStoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Schedules targeting a working directory (topology enrichment).
    pub fn count_schedules_for_cwd(&self, cwd: &Path) -> PulseStoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM schedules WHERE cwd = ?1",
            params![cwd.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==================== Runs ====================

    pub fn create_run(
        &self,
        id: &str,
        schedule_id: &str,
        trigger: RunTrigger,
    ) -> PulseStoreResult<Run> {
        let now = Utc::now();
        let run = Run {
            id: id.to_string(),
            schedule_id: schedule_id.to_string(),
            trigger,
            status: RunStatus::Running,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            output: None,
            error: None,
            session_id: None,
            token_cost: None,
            duration_ms: None,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (id, schedule_id, trigger, status, created_at, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                run.id,
                run.schedule_id,
                trigger.as_str(),
                RunStatus::Running.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(run)
    }

    /// Persist a run's terminal state in one transaction.
    pub fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        completion: &RunCompletion,
    ) -> PulseStoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let started: Option<String> = tx
            .query_row(
                "SELECT started_at FROM runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let now = Utc::now();
        let duration_ms = started
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|s| (now - s.with_timezone(&Utc)).num_milliseconds().max(0) as i64);

        let updated = tx.execute(
            "UPDATE runs SET status = ?2, finished_at = ?3, output = ?4, error = ?5,
                    session_id = ?6, token_cost = ?7, duration_ms = ?8
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                now.to_rfc3339(),
                completion.output,
                completion.error,
                completion.session_id,
                completion.usage.map(|u| u.total() as i64),
                duration_ms,
            ],
        )?;
        if updated == 0 {
            return Err(PulseStoreError::RunNotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> PulseStoreResult<Run> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&select_runs("WHERE id = ?1"))?;
        stmt.query_row(params![id], row_to_run)
            .optional()?
            .ok_or_else(|| PulseStoreError::RunNotFound(id.to_string()))
    }

    pub fn count_running(&self, schedule_id: &str) -> PulseStoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE schedule_id = ?1 AND status = 'running'",
            params![schedule_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Paginated runs ordered newest first.
    pub fn list_runs(&self, query: &RunQuery) -> PulseStoreResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let limit = query.limit.unwrap_or(50) as i64;
        let offset = query.offset.unwrap_or(0) as i64;

        let mut stmt = conn.prepare(&select_runs(
            "WHERE (?1 IS NULL OR schedule_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
        ))?;
        let runs = stmt
            .query_map(
                params![
                    query.schedule_id,
                    query.status.map(RunStatus::as_str),
                    limit,
                    offset
                ],
                row_to_run,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

fn select_schedules(suffix: &str) -> String {
    format!(
        "SELECT id, name, cron, timezone, cwd, prompt, permission_mode, model, max_runtime_ms,
                enabled, status, approved_by, created_by, created_at, updated_at, last_run_at
         FROM schedules {suffix}"
    )
}

fn select_runs(suffix: &str) -> String {
    format!(
        "SELECT id, schedule_id, trigger, status, created_at, started_at, finished_at,
                output, error, session_id, token_cost, duration_ms
         FROM runs {suffix}"
    )
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let mode_json: String = row.get(6)?;
    let status: String = row.get(10)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        timezone: row.get(3)?,
        cwd: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        prompt: row.get(5)?,
        permission_mode: serde_json::from_str(&mode_json).unwrap_or_default(),
        model: row.get(7)?,
        max_runtime_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        enabled: row.get(9)?,
        status: ScheduleStatus::parse(&status),
        approved_by: row.get(11)?,
        created_by: row.get(12)?,
        created_at: parse_ts(&row.get::<_, String>(13)?),
        updated_at: parse_ts(&row.get::<_, String>(14)?),
        last_run_at: row.get::<_, Option<String>>(15)?.map(|s| parse_ts(&s)),
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let trigger: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Run {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        trigger: if trigger == "manual" {
            RunTrigger::Manual
        } else {
            RunTrigger::Scheduled
        },
        status: RunStatus::parse(&status),
        created_at: parse_ts(&row.get::<_, String>(4)?),
        started_at: row.get::<_, Option<String>>(5)?.map(|s| parse_ts(&s)),
        finished_at: row.get::<_, Option<String>>(6)?.map(|s| parse_ts(&s)),
        output: row.get(7)?,
        error: row.get(8)?,
        session_id: row.get(9)?,
        token_cost: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_schedule(name: &str) -> NewSchedule {
        NewSchedule {
            name: name.to_string(),
            cron: "0 * * * * *".to_string(),
            timezone: None,
            cwd: Some(PathBuf::from("/ws/proj")),
            prompt: "do the rounds".to_string(),
            permission_mode: PermissionMode::Default,
            model: None,
            max_runtime_ms: None,
            enabled: None,
        }
    }

    #[test]
    fn schedule_crud_round_trip() {
        let store = PulseStore::open_in_memory().unwrap();
        let schedule = store
            .create_schedule("s1", &new_schedule("nightly"), ScheduleStatus::Active, "me")
            .unwrap();
        assert!(schedule.can_run());

        let loaded = store.get_schedule("s1").unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.permission_mode, PermissionMode::Default);

        store
            .update_schedule(
                "s1",
                &ScheduleUpdate {
                    enabled: Some(false),
                    prompt: Some("new prompt".to_string()),
                    ..ScheduleUpdate::default()
                },
            )
            .unwrap();
        let updated = store.get_schedule("s1").unwrap();
        assert!(!updated.enabled);
        assert!(!updated.can_run());
        assert_eq!(updated.prompt, "new prompt");

        assert!(store.delete_schedule("s1").unwrap());
        assert!(!store.delete_schedule("s1").unwrap());
    }

    #[test]
    fn pending_approval_blocks_runs_until_approved() {
        let store = PulseStore::open_in_memory().unwrap();
        let schedule = store
            .create_schedule(
                "s1",
                &new_schedule("agent-made"),
                ScheduleStatus::PendingApproval,
                "agent",
            )
            .unwrap();
        assert!(!schedule.can_run());

        store
            .set_schedule_status("s1", ScheduleStatus::Active, Some("human"))
            .unwrap();
        let approved = store.get_schedule("s1").unwrap();
        assert!(approved.can_run());
        assert_eq!(approved.approved_by.as_deref(), Some("human"));
    }

    #[test]
    fn run_lifecycle_persists_completion_facts() {
        let store = PulseStore::open_in_memory().unwrap();
        store
            .create_schedule("s1", &new_schedule("n"), ScheduleStatus::Active, "me")
            .unwrap();
        store.create_run("r1", "s1", RunTrigger::Manual).unwrap();
        assert_eq!(store.count_running("s1").unwrap(), 1);

        store
            .finish_run(
                "r1",
                RunStatus::Completed,
                &RunCompletion {
                    output: Some("all done".to_string()),
                    session_id: Some("r1".to_string()),
                    usage: Some(Usage {
                        input_tokens: 100,
                        output_tokens: 20,
                    }),
                    ..RunCompletion::default()
                },
            )
            .unwrap();

        let run = store.get_run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.token_cost, Some(120));
        assert_eq!(run.session_id.as_deref(), Some("r1"));
        assert!(run.duration_ms.is_some());
        assert_eq!(store.count_running("s1").unwrap(), 0);
    }

    #[test]
    fn run_listing_is_paginated_newest_first() {
        let store = PulseStore::open_in_memory().unwrap();
        store
            .create_schedule("s1", &new_schedule("n"), ScheduleStatus::Active, "me")
            .unwrap();
        for i in 0..5 {
            store
                .create_run(&format!("r{i}"), "s1", RunTrigger::Scheduled)
                .unwrap();
        }

        let page = store
            .list_runs(&RunQuery {
                schedule_id: Some("s1".to_string()),
                limit: Some(2),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        let filtered = store
            .list_runs(&RunQuery {
                status: Some(RunStatus::Running),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 5);

        let offset = store
            .list_runs(&RunQuery {
                limit: Some(10),
                offset: Some(4),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(offset.len(), 1);
    }

    #[test]
    fn schedule_counts_by_cwd() {
        let store = PulseStore::open_in_memory().unwrap();
        store
            .create_schedule("s1", &new_schedule("a"), ScheduleStatus::Active, "me")
            .unwrap();
        store
            .create_schedule("s2", &new_schedule("b"), ScheduleStatus::Active, "me")
            .unwrap();
        assert_eq!(
            store.count_schedules_for_cwd(Path::new("/ws/proj")).unwrap(),
            2
        );
        assert_eq!(
            store.count_schedules_for_cwd(Path::new("/elsewhere")).unwrap(),
            0
        );
    }
}
