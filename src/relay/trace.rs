//! Persistent span storage and metrics aggregation.
//!
//! Spans are immutable once written. Metrics are computed on demand from
//! indexed reads over a rolling retention window; older spans are pruned by
//! a background job.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Spans older than this are pruned.
pub const TRACE_RETENTION_DAYS: i64 = 7;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpanKind {
    Publish,
    Route,
    Deliver,
    AdapterIngress,
    AdapterEgress,
    DeadLetter,
}

impl SpanKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Route => "route",
            Self::Deliver => "deliver",
            Self::AdapterIngress => "adapter-ingress",
            Self::AdapterEgress => "adapter-egress",
            Self::DeadLetter => "dead-letter",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(Self::Publish),
            "route" => Some(Self::Route),
            "deliver" => Some(Self::Deliver),
            "adapter-ingress" => Some(Self::AdapterIngress),
            "adapter-egress" => Some(Self::AdapterEgress),
            "dead-letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub message_id: String,
    pub kind: SpanKind,
    pub subject: String,
    pub status: String,
    pub start_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dead_letters_by_reason: HashMap<String, u64>,
    pub deliver_latency_by_prefix: HashMap<String, LatencyPercentiles>,
    pub deliver_latency_by_adapter: HashMap<String, LatencyPercentiles>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spans (
    trace_id        TEXT NOT NULL,
    span_id         TEXT NOT NULL,
    parent_span_id  TEXT,
    message_id      TEXT NOT NULL,
    kind            TEXT NOT NULL,
    subject         TEXT NOT NULL,
    status          TEXT NOT NULL,
    start_ts        TEXT NOT NULL,
    end_ts          TEXT,
    error           TEXT,
    metadata        TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (trace_id, span_id)
);
CREATE INDEX IF NOT EXISTS idx_spans_message_id ON spans(message_id);
CREATE INDEX IF NOT EXISTS idx_spans_subject ON spans(subject);
CREATE INDEX IF NOT EXISTS idx_spans_start_ts ON spans(start_ts);
";

/// Thread-safe trace store handle.
#[derive(Clone)]
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
}

impl TraceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> TraceResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> TraceResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Append-only write. A span id is never written twice.
    pub fn record(&self, span: &TraceSpan) -> TraceResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO spans
             (trace_id, span_id, parent_span_id, message_id, kind, subject, status, start_ts, end_ts, error, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                span.trace_id,
                span.span_id,
                span.parent_span_id,
                span.message_id,
                span.kind.as_str(),
                span.subject,
                span.status,
                span.start_ts.to_rfc3339(),
                span.end_ts.map(|ts| ts.to_rfc3339()),
                span.error,
                serde_json::to_string(&span.metadata).unwrap_or_else(|_| "null".to_string()),
            ],
        )?;
        Ok(())
    }

    /// First span recorded for a message id.
    pub fn get_span_by_message_id(&self, message_id: &str) -> TraceResult<Option<TraceSpan>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trace_id, span_id, parent_span_id, message_id, kind, subject, status,
                    start_ts, end_ts, error, metadata
             FROM spans WHERE message_id = ?1 ORDER BY start_ts ASC LIMIT 1",
        )?;
        let span = stmt
            .query_row(params![message_id], row_to_span)
            .optional()?;
        Ok(span)
    }

    /// All spans for a trace, ordered by start time.
    pub fn get_trace(&self, trace_id: &str) -> TraceResult<Vec<TraceSpan>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trace_id, span_id, parent_span_id, message_id, kind, subject, status,
                    start_ts, end_ts, error, metadata
             FROM spans WHERE trace_id = ?1 ORDER BY start_ts ASC",
        )?;
        let spans = stmt
            .query_map(params![trace_id], row_to_span)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(spans)
    }

    /// Aggregate counters and deliver-latency percentiles over the
    /// retention window.
    pub fn get_metrics(&self) -> TraceResult<RelayMetrics> {
        let cutoff = (Utc::now() - Duration::days(TRACE_RETENTION_DAYS)).to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let mut metrics = RelayMetrics::default();

        let mut stmt = conn.prepare(
            "SELECT kind, subject, status, start_ts, end_ts, metadata
             FROM spans WHERE start_ts >= ?1",
        )?;
        let mut latencies_by_prefix: HashMap<String, Vec<f64>> = HashMap::new();
        let mut latencies_by_adapter: HashMap<String, Vec<f64>> = HashMap::new();

        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        for row in rows {
            let (kind, subject, status, start_ts, end_ts, metadata) = row?;
            match SpanKind::parse(&kind) {
                Some(SpanKind::Publish) => metrics.published += 1,
                Some(SpanKind::Deliver) => {
                    metrics.delivered += 1;
                    if let Some(latency) = latency_ms(&start_ts, end_ts.as_deref()) {
                        let prefix = subject
                            .split('.')
                            .next()
                            .unwrap_or(&subject)
                            .to_string();
                        latencies_by_prefix.entry(prefix).or_default().push(latency);
                        if let Some(adapter) = serde_json::from_str::<Value>(&metadata)
                            .ok()
                            .and_then(|m| m.get("adapterId").and_then(Value::as_str).map(String::from))
                        {
                            latencies_by_adapter.entry(adapter).or_default().push(latency);
                        }
                    }
                }
                Some(SpanKind::DeadLetter) => {
                    *metrics.dead_letters_by_reason.entry(status).or_insert(0) += 1;
                }
                _ => {}
            }
        }

        metrics.deliver_latency_by_prefix = latencies_by_prefix
            .into_iter()
            .map(|(k, v)| (k, percentiles(v)))
            .collect();
        metrics.deliver_latency_by_adapter = latencies_by_adapter
            .into_iter()
            .map(|(k, v)| (k, percentiles(v)))
            .collect();
        Ok(metrics)
    }

    /// Delete spans older than the retention window. Returns rows removed.
    pub fn prune(&self) -> TraceResult<usize> {
        let cutoff = (Utc::now() - Duration::days(TRACE_RETENTION_DAYS)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM spans WHERE start_ts < ?1", params![cutoff])?;
        Ok(removed)
    }

    /// Daily prune job.
    pub fn spawn_prune_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                interval.tick().await;
                match store.prune() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(target: "relay", removed = n, "Pruned trace spans"),
                    Err(e) => tracing::warn!(target: "relay", error = %e, "Trace prune failed"),
                }
            }
        })
    }
}

fn row_to_span(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraceSpan> {
    let kind_str: String = row.get(4)?;
    let metadata_str: String = row.get(10)?;
    Ok(TraceSpan {
        trace_id: row.get(0)?,
        span_id: row.get(1)?,
        parent_span_id: row.get(2)?,
        message_id: row.get(3)?,
        kind: SpanKind::parse(&kind_str).unwrap_or(SpanKind::Publish),
        subject: row.get(5)?,
        status: row.get(6)?,
        start_ts: parse_ts(&row.get::<_, String>(7)?),
        end_ts: row.get::<_, Option<String>>(8)?.map(|ts| parse_ts(&ts)),
        error: row.get(9)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(Value::Null),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn latency_ms(start: &str, end: Option<&str>) -> Option<f64> {
    let start = DateTime::parse_from_rfc3339(start).ok()?;
    let end = DateTime::parse_from_rfc3339(end?).ok()?;
    Some((end - start).num_microseconds()? as f64 / 1000.0)
}

fn percentiles(mut values: Vec<f64>) -> LatencyPercentiles {
    if values.is_empty() {
        return LatencyPercentiles::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let at = |p: f64| {
        let idx = ((values.len() as f64 - 1.0) * p).round() as usize;
        values[idx.min(values.len() - 1)]
    };
    LatencyPercentiles {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
        count: values.len() as u64,
    }
}
