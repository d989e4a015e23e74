//! Pulse: cron-based scheduler dispatching agent runs.
//!
//! A tick task wakes every 30 seconds and dispatches schedules whose next
//! fire time has passed, evaluated in each schedule's timezone. Dispatch
//! goes through Relay when it is enabled, otherwise straight into the
//! Agent Manager with the run id as the session key.

pub mod store;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentManager, SendOptions};
use crate::error::{DomainError, ErrorCode};
use crate::events::StreamEvent;
use crate::ids::IdGenerator;
use crate::relay::bridge::{PULSE_REQUEST_PREFIX, PULSE_RESPONSE_PREFIX};
use crate::relay::trace::{SpanKind, TraceSpan};
use crate::relay::{PublishOptions, Relay};
use store::{
    NewSchedule, PulseStore, PulseStoreError, Run, RunCompletion, RunQuery, RunStatus, RunTrigger,
    Schedule, ScheduleStatus, ScheduleUpdate,
};

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
/// Concurrent runs allowed per schedule.
pub const CONCURRENCY_CAP: usize = 1;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    BadCron { expr: String, reason: String },
    #[error("unknown timezone: {0}")]
    BadTimezone(String),
    #[error("schedule is not runnable (must be enabled and active)")]
    NotRunnable,
    #[error("run is not cancellable: {0}")]
    NotCancellable(String),
    #[error("another run for this schedule is still in flight")]
    SkippedConcurrent,
    #[error(transparent)]
    Store(#[from] PulseStoreError),
}

impl From<PulseError> for DomainError {
    fn from(err: PulseError) -> Self {
        match err {
            PulseError::BadCron { .. } | PulseError::BadTimezone(_) => {
                DomainError::validation(err.to_string())
            }
            PulseError::NotRunnable | PulseError::SkippedConcurrent => {
                DomainError::validation(err.to_string())
            }
            PulseError::NotCancellable(m) => DomainError::new(ErrorCode::Cancelled, m),
            PulseError::Store(PulseStoreError::ScheduleNotFound(id)) => {
                DomainError::not_found(format!("schedule not found: {id}"))
            }
            PulseError::Store(PulseStoreError::RunNotFound(id)) => {
                DomainError::not_found(format!("run not found: {id}"))
            }
            PulseError::Store(e) => DomainError::internal(e.to_string()),
        }
    }
}

pub type PulseResult<T> = Result<T, PulseError>;

/// The `cron` crate wants a seconds field; classic five-field expressions
/// get a zero-second prefix.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_cron(expr: &str) -> PulseResult<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron(expr)).map_err(|e| PulseError::BadCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn parse_timezone(tz: Option<&str>) -> PulseResult<Tz> {
    match tz {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| PulseError::BadTimezone(name.to_string())),
    }
}

/// Has the schedule a fire time in `(after, now]`, evaluated in its
/// timezone?
pub fn is_due(schedule: &Schedule, after: DateTime<Utc>, now: DateTime<Utc>) -> PulseResult<bool> {
    let cron = parse_cron(&schedule.cron)?;
    let tz = parse_timezone(schedule.timezone.as_deref())?;
    let after = tz.from_utc_datetime(&after.naive_utc());
    let now = tz.from_utc_datetime(&now.naive_utc());
    Ok(cron.after(&after).take(1).any(|fire| fire <= now))
}

pub struct Pulse {
    store: Arc<PulseStore>,
    agent: Arc<AgentManager>,
    relay: Option<Arc<Relay>>,
    ids: Arc<IdGenerator>,
    cancel_tokens: StdMutex<HashMap<String, CancellationToken>>,
    tick_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pulse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pulse").finish_non_exhaustive()
    }
}

impl Pulse {
    pub fn new(
        store: Arc<PulseStore>,
        agent: Arc<AgentManager>,
        relay: Option<Arc<Relay>>,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            agent,
            relay,
            ids,
            cancel_tokens: StdMutex::new(HashMap::new()),
            tick_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<PulseStore> {
        &self.store
    }

    // ==================== Schedule CRUD ====================

    /// Create a schedule. Agent-created schedules (via MCP) always start
    /// `pending_approval`; user-created ones are active immediately.
    pub fn create_schedule(
        &self,
        new: NewSchedule,
        created_by: &str,
        created_by_agent: bool,
    ) -> PulseResult<Schedule> {
        parse_cron(&new.cron)?;
        parse_timezone(new.timezone.as_deref())?;
        let status = if created_by_agent {
            ScheduleStatus::PendingApproval
        } else {
            ScheduleStatus::Active
        };
        Ok(self
            .store
            .create_schedule(&self.ids.next(), &new, status, created_by)?)
    }

    pub fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> PulseResult<Schedule> {
        if let Some(cron) = &update.cron {
            parse_cron(cron)?;
        }
        if let Some(tz) = &update.timezone {
            parse_timezone(Some(tz))?;
        }
        Ok(self.store.update_schedule(id, &update)?)
    }

    pub fn delete_schedule(&self, id: &str) -> PulseResult<bool> {
        Ok(self.store.delete_schedule(id)?)
    }

    pub fn get_schedule(&self, id: &str) -> PulseResult<Schedule> {
        Ok(self.store.get_schedule(id)?)
    }

    pub fn list_schedules(&self) -> PulseResult<Vec<Schedule>> {
        Ok(self.store.list_schedules()?)
    }

    /// Approval flips `pending_approval` to `active`.
    pub fn approve_schedule(&self, id: &str, approver: &str) -> PulseResult<Schedule> {
        self.store
            .set_schedule_status(id, ScheduleStatus::Active, Some(approver))?;
        Ok(self.store.get_schedule(id)?)
    }

    /// Rejection deletes the schedule outright.
    pub fn reject_schedule(&self, id: &str) -> PulseResult<bool> {
        Ok(self.store.delete_schedule(id)?)
    }

    // ==================== Runs ====================

    pub fn list_runs(&self, query: &RunQuery) -> PulseResult<Vec<Run>> {
        Ok(self.store.list_runs(query)?)
    }

    pub fn get_run(&self, id: &str) -> PulseResult<Run> {
        Ok(self.store.get_run(id)?)
    }

    /// Manual trigger: bypasses cron, obeys the active-status rule and the
    /// concurrency cap.
    pub async fn run_now(self: &Arc<Self>, schedule_id: &str) -> PulseResult<Run> {
        let schedule = self.store.get_schedule(schedule_id)?;
        if !schedule.can_run() {
            return Err(PulseError::NotRunnable);
        }
        self.dispatch(&schedule, RunTrigger::Manual)
    }

    /// Signal an in-flight run to terminate; partial state is preserved.
    pub async fn cancel_run(&self, run_id: &str) -> PulseResult<Run> {
        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::Running {
            return Err(PulseError::NotCancellable(format!(
                "run {run_id} is not running"
            )));
        }

        let token = self.cancel_tokens.lock().unwrap().get(run_id).cloned();
        match token {
            Some(token) => token.cancel(),
            None => {
                return Err(PulseError::NotCancellable(format!(
                    "run {run_id} has no in-flight handle"
                )))
            }
        }

        // Relay-dispatched runs additionally get a cancellation envelope
        // on their response subject.
        if let Some(relay) = &self.relay {
            let subject = format!("{PULSE_RESPONSE_PREFIX}.{run_id}");
            let _ = relay
                .publish(
                    &subject,
                    serde_json::json!({ "type": "cancel" }),
                    PublishOptions {
                        from: PULSE_REQUEST_PREFIX.to_string(),
                        ..PublishOptions::default()
                    },
                )
                .await;
        }
        Ok(self.store.get_run(run_id)?)
    }

    // ==================== Tick and dispatch ====================

    pub fn spawn_ticker(self: &Arc<Self>) {
        let pulse = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if pulse.closed.load(Ordering::SeqCst) {
                    return;
                }
                pulse.tick(Utc::now()).await;
            }
        });
        *self.tick_task.lock().unwrap() = Some(handle);
    }

    /// One tick: dispatch every schedule with a due time since its last
    /// run (bounded by now).
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        let schedules = match self.store.list_schedules() {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::warn!(target: "pulse", error = %e, "Tick read failed");
                return;
            }
        };

        for schedule in schedules.into_iter().filter(Schedule::can_run) {
            let after = schedule.last_run_at.unwrap_or(schedule.created_at);
            match is_due(&schedule, after, now) {
                Ok(true) => {
                    if let Err(e) = self.store.set_last_run(&schedule.id, now) {
                        tracing::warn!(target: "pulse", error = %e, "last_run update failed");
                    }
                    match self.dispatch(&schedule, RunTrigger::Scheduled) {
                        Ok(run) => {
                            tracing::info!(target: "pulse", schedule = %schedule.id, run = %run.id, "Dispatched scheduled run");
                        }
                        Err(PulseError::SkippedConcurrent) => {}
                        Err(e) => {
                            tracing::warn!(target: "pulse", schedule = %schedule.id, error = %e, "Dispatch failed");
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(target: "pulse", schedule = %schedule.id, error = %e, "Cron evaluation failed");
                    let _ = self.store.set_schedule_status(
                        &schedule.id,
                        ScheduleStatus::Errored,
                        None,
                    );
                }
            }
        }
    }

    /// Create the run row and spawn its executor. Fails fast when the
    /// schedule's concurrency cap is reached.
    fn dispatch(self: &Arc<Self>, schedule: &Schedule, trigger: RunTrigger) -> PulseResult<Run> {
        if self.store.count_running(&schedule.id)? >= CONCURRENCY_CAP {
            self.record_skip(schedule);
            return Err(PulseError::SkippedConcurrent);
        }

        let run_id = self.ids.next();
        let run = self.store.create_run(&run_id, &schedule.id, trigger)?;

        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap()
            .insert(run_id.clone(), token.clone());

        let pulse = Arc::clone(self);
        let schedule = schedule.clone();
        tokio::spawn(async move {
            pulse.execute_run(&schedule, &run_id, token).await;
            pulse.cancel_tokens.lock().unwrap().remove(&run_id);
        });
        Ok(run)
    }

    /// A skipped trigger leaves a trace event behind.
    fn record_skip(&self, schedule: &Schedule) {
        tracing::warn!(target: "pulse", schedule = %schedule.id, "skipped_concurrent");
        let Some(traces) = self.relay.as_ref().and_then(|r| r.traces().cloned()) else {
            return;
        };
        let span = TraceSpan {
            trace_id: self.ids.next(),
            span_id: self.ids.next(),
            parent_span_id: None,
            message_id: self.ids.next(),
            kind: SpanKind::DeadLetter,
            subject: format!("{PULSE_REQUEST_PREFIX}.{}", schedule.id),
            status: "skipped_concurrent".to_string(),
            start_ts: Utc::now(),
            end_ts: Some(Utc::now()),
            error: None,
            metadata: serde_json::json!({ "scheduleId": schedule.id }),
        };
        if let Err(e) = traces.record(&span) {
            tracing::warn!(target: "pulse", error = %e, "Skip trace write failed");
        }
    }

    async fn execute_run(&self, schedule: &Schedule, run_id: &str, token: CancellationToken) {
        let result = match self.relay.clone() {
            Some(relay) => self.execute_via_relay(&relay, schedule, run_id, token).await,
            None => self.execute_direct(schedule, run_id, token).await,
        };

        let (status, completion) = result;
        if let Err(e) = self.store.finish_run(run_id, status, &completion) {
            tracing::warn!(target: "pulse", run = run_id, error = %e, "Run finalization failed");
        }
    }

    /// Direct dispatch: the run id doubles as the session key.
    async fn execute_direct(
        &self,
        schedule: &Schedule,
        run_id: &str,
        token: CancellationToken,
    ) -> (RunStatus, RunCompletion) {
        let mut completion = RunCompletion::default();
        let suffix = format!("Scheduled run id={} name={}", schedule.id, schedule.name);

        let stream = match self
            .agent
            .send_message(
                run_id,
                schedule.prompt.clone(),
                SendOptions {
                    cwd: schedule.cwd.clone(),
                    permission_mode: Some(schedule.permission_mode),
                    model: schedule.model.clone(),
                    system_prompt_append: Some(suffix),
                },
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                completion.error = Some(e.to_string());
                return (RunStatus::Failed, completion);
            }
        };
        tokio::pin!(stream);

        let deadline = schedule
            .max_runtime_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        let mut status = RunStatus::Completed;

        loop {
            let next = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, stream.next()).await,
                    None => Ok(stream.next().await),
                }
            };

            tokio::select! {
                () = token.cancelled() => {
                    self.agent.interrupt(run_id).await;
                    status = RunStatus::Cancelled;
                    break;
                }
                result = next => {
                    let event = match result {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(_) => {
                            self.agent.interrupt(run_id).await;
                            status = RunStatus::Cancelled;
                            completion.error = Some("run exceeded max runtime".to_string());
                            break;
                        }
                    };
                    match &event {
                        StreamEvent::SessionStatus { session_id } => {
                            completion.session_id = Some(session_id.clone());
                        }
                        StreamEvent::TextDelta { text } => match &mut completion.output {
                            Some(output) => output.push_str(text),
                            None => completion.output = Some(text.clone()),
                        },
                        StreamEvent::Done { usage } => {
                            completion.usage = *usage;
                        }
                        StreamEvent::Error { message, .. } => {
                            status = RunStatus::Failed;
                            completion.error = message.clone();
                        }
                        _ => {}
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
            }
        }

        completion.output = completion.output.map(|o| truncate_output(&o));
        (status, completion)
    }

    /// Relay dispatch: publish the request, then wait for the receipt the
    /// agent bridge publishes on the per-run response subject.
    async fn execute_via_relay(
        &self,
        relay: &Arc<Relay>,
        schedule: &Schedule,
        run_id: &str,
        token: CancellationToken,
    ) -> (RunStatus, RunCompletion) {
        let response_subject = format!("{PULSE_RESPONSE_PREFIX}.{run_id}");

        let (receipt_tx, receipt_rx) = oneshot::channel::<serde_json::Value>();
        let receipt_tx = Arc::new(StdMutex::new(Some(receipt_tx)));
        let subscription = relay.subscribe(
            &response_subject,
            Arc::new(move |envelope| {
                let receipt_tx = Arc::clone(&receipt_tx);
                Box::pin(async move {
                    if envelope.payload.get("type").and_then(serde_json::Value::as_str)
                        == Some("relay_receipt")
                    {
                        if let Some(tx) = receipt_tx.lock().unwrap().take() {
                            let _ = tx.send(envelope.payload.clone());
                        }
                    }
                    Ok(())
                })
            }),
            serde_json::json!({ "role": "pulse-run", "runId": run_id }),
        );
        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                return (
                    RunStatus::Failed,
                    RunCompletion {
                        error: Some(e.to_string()),
                        ..RunCompletion::default()
                    },
                )
            }
        };

        let request = serde_json::json!({
            "runId": run_id,
            "prompt": schedule.prompt,
            "cwd": schedule.cwd.as_ref().map(|p| p.to_string_lossy()),
            "permissionMode": schedule.permission_mode,
            "model": schedule.model,
            "maxRuntimeMs": schedule.max_runtime_ms,
            "systemPromptAppend": format!("Scheduled run id={} name={}", schedule.id, schedule.name),
        });
        let publish = relay
            .publish(
                &format!("{PULSE_REQUEST_PREFIX}.{}", schedule.id),
                request,
                PublishOptions {
                    from: format!("{PULSE_REQUEST_PREFIX}.{}", schedule.id),
                    reply_to: Some(response_subject.clone()),
                    ..PublishOptions::default()
                },
            )
            .await;
        if let Err(e) = publish {
            relay.unsubscribe(&subscription);
            return (
                RunStatus::Failed,
                RunCompletion {
                    error: Some(e.to_string()),
                    ..RunCompletion::default()
                },
            );
        }

        // The bridge enforces maxRuntime; the token covers cancellation.
        let receipt = tokio::select! {
            () = token.cancelled() => None,
            receipt = receipt_rx => receipt.ok(),
        };
        relay.unsubscribe(&subscription);

        let Some(receipt) = receipt else {
            return (RunStatus::Cancelled, RunCompletion::default());
        };

        let status = match receipt.get("status").and_then(serde_json::Value::as_str) {
            Some("completed") => RunStatus::Completed,
            Some("cancelled") => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        let completion = RunCompletion {
            output: receipt
                .get("output")
                .and_then(serde_json::Value::as_str)
                .map(|o| truncate_output(o)),
            error: (status == RunStatus::Failed)
                .then(|| {
                    receipt
                        .get("output")
                        .and_then(serde_json::Value::as_str)
                        .map(String::from)
                })
                .flatten(),
            session_id: receipt
                .get("sessionId")
                .and_then(serde_json::Value::as_str)
                .map(String::from),
            usage: receipt
                .get("usage")
                .cloned()
                .and_then(|u| serde_json::from_value(u).ok()),
        };
        (status, completion)
    }

    /// Idempotent shutdown: stop the ticker and cancel in-flight runs.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.tick_task.lock().unwrap().take() {
            handle.abort();
        }
        for (_, token) in self.cancel_tokens.lock().unwrap().drain() {
            token.cancel();
        }
    }
}

/// Output summaries keep the last assistant message, truncated.
fn truncate_output(output: &str) -> String {
    const MAX: usize = 2000;
    if output.chars().count() <= MAX {
        output.to_string()
    } else {
        let truncated: String = output.chars().take(MAX).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{manager_with, MockBehavior};
    use crate::agent::runtime::PermissionMode;
    use crate::relay::bridge::RelayAgentBridge;
    use crate::relay::bindings::BindingStore;
    use crate::relay::trace::TraceStore;
    use tempfile::TempDir;

    fn new_schedule(cwd: &std::path::Path) -> NewSchedule {
        NewSchedule {
            name: "nightly".to_string(),
            cron: "* * * * *".to_string(),
            timezone: None,
            cwd: Some(cwd.to_path_buf()),
            prompt: "summarize the day".to_string(),
            permission_mode: PermissionMode::BypassPermissions,
            model: None,
            max_runtime_ms: None,
            enabled: None,
        }
    }

    fn pulse_without_relay(temp: &TempDir) -> Arc<Pulse> {
        Pulse::new(
            Arc::new(PulseStore::open_in_memory().unwrap()),
            manager_with(MockBehavior::Echo, temp.path()),
            None,
            Arc::new(IdGenerator::new()),
        )
    }

    async fn wait_for_finish(pulse: &Pulse, run_id: &str) -> Run {
        for _ in 0..200 {
            let run = pulse.get_run(run_id).unwrap();
            if run.status != RunStatus::Running {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never finished");
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(normalize_cron("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron("0 * * * * *"), "0 * * * * *");
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("nonsense").is_err());
    }

    #[test]
    fn minutely_schedule_fires_once_per_minute() {
        let schedule = Schedule {
            id: "s".to_string(),
            name: "m".to_string(),
            cron: "* * * * *".to_string(),
            timezone: None,
            cwd: None,
            prompt: "p".to_string(),
            permission_mode: PermissionMode::Default,
            model: None,
            max_runtime_ms: None,
            enabled: true,
            status: ScheduleStatus::Active,
            approved_by: None,
            created_by: "t".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
        };

        // Ten 30s ticks over five minutes: due on every full minute only.
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut last_run = base;
        let mut fires = 0;
        for i in 1..=10 {
            let now = base + chrono::Duration::seconds(30 * i);
            if is_due(&schedule, last_run, now).unwrap() {
                fires += 1;
                last_run = now;
            }
        }
        assert_eq!(fires, 5);
    }

    #[test]
    fn timezone_is_validated() {
        assert!(parse_timezone(Some("America/New_York")).is_ok());
        assert!(matches!(
            parse_timezone(Some("Mars/Olympus")),
            Err(PulseError::BadTimezone(_))
        ));
    }

    #[tokio::test]
    async fn agent_created_schedules_need_approval() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse_without_relay(&temp);

        let schedule = pulse
            .create_schedule(new_schedule(temp.path()), "mcp-agent", true)
            .unwrap();
        assert_eq!(schedule.status, ScheduleStatus::PendingApproval);
        assert!(matches!(
            pulse.run_now(&schedule.id).await.unwrap_err(),
            PulseError::NotRunnable
        ));

        let approved = pulse.approve_schedule(&schedule.id, "human").unwrap();
        assert_eq!(approved.status, ScheduleStatus::Active);
        assert_eq!(approved.approved_by.as_deref(), Some("human"));

        let run = pulse.run_now(&schedule.id).await.unwrap();
        assert_eq!(run.trigger, RunTrigger::Manual);
        let finished = wait_for_finish(&pulse, &run.id).await;
        assert_eq!(finished.status, RunStatus::Completed);
        assert!(finished.session_id.is_some());
        assert!(finished.output.is_some());
    }

    #[tokio::test]
    async fn rejecting_deletes_the_schedule() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse_without_relay(&temp);
        let schedule = pulse
            .create_schedule(new_schedule(temp.path()), "mcp-agent", true)
            .unwrap();
        assert!(pulse.reject_schedule(&schedule.id).unwrap());
        assert!(pulse.get_schedule(&schedule.id).is_err());
    }

    #[tokio::test]
    async fn concurrency_cap_skips_second_dispatch() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse_without_relay(&temp);
        let schedule = pulse
            .create_schedule(new_schedule(temp.path()), "me", false)
            .unwrap();

        // Fake an in-flight run.
        pulse
            .store
            .create_run("stuck", &schedule.id, RunTrigger::Scheduled)
            .unwrap();
        let loaded = pulse.get_schedule(&schedule.id).unwrap();
        let err = pulse.dispatch(&loaded, RunTrigger::Manual).unwrap_err();
        assert!(matches!(err, PulseError::SkippedConcurrent));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_create() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse_without_relay(&temp);
        let mut bad = new_schedule(temp.path());
        bad.cron = "not a cron".to_string();
        assert!(matches!(
            pulse.create_schedule(bad, "me", false).unwrap_err(),
            PulseError::BadCron { .. }
        ));
    }

    #[tokio::test]
    async fn relay_dispatch_completes_through_bridge() {
        let temp = TempDir::new().unwrap();
        let relay = Arc::new(Relay::new(
            Arc::new(IdGenerator::new()),
            Some(Arc::new(TraceStore::open_in_memory().unwrap())),
        ));
        let agent = manager_with(MockBehavior::Echo, temp.path());
        let bridge = RelayAgentBridge::new(
            Arc::clone(&relay),
            Arc::new(BindingStore::open_in_memory().unwrap()),
            Arc::clone(&agent),
        );
        bridge.install();

        let pulse = Pulse::new(
            Arc::new(PulseStore::open_in_memory().unwrap()),
            agent,
            Some(Arc::clone(&relay)),
            Arc::new(IdGenerator::new()),
        );
        let schedule = pulse
            .create_schedule(new_schedule(temp.path()), "me", false)
            .unwrap();

        let run = pulse.run_now(&schedule.id).await.unwrap();
        let finished = wait_for_finish(&pulse, &run.id).await;
        assert_eq!(finished.status, RunStatus::Completed);
        assert!(finished.session_id.is_some());

        // The request left a publish trace on the schedule subject.
        let metrics = relay.traces().unwrap().get_metrics().unwrap();
        assert!(metrics.published >= 1);
    }

    #[tokio::test]
    async fn cancel_marks_run_cancelled() {
        let temp = TempDir::new().unwrap();
        // StaleResume behaves like Echo on fresh starts; use ToolUse with
        // default mode so the run parks waiting for an approval.
        let pulse = Pulse::new(
            Arc::new(PulseStore::open_in_memory().unwrap()),
            manager_with(
                MockBehavior::ToolUse {
                    name: "Bash".to_string(),
                },
                temp.path(),
            ),
            None,
            Arc::new(IdGenerator::new()),
        );
        let mut schedule = new_schedule(temp.path());
        schedule.permission_mode = PermissionMode::Default;
        let schedule = pulse.create_schedule(schedule, "me", false).unwrap();

        let run = pulse.run_now(&schedule.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pulse.cancel_run(&run.id).await.unwrap();

        let finished = wait_for_finish(&pulse, &run.id).await;
        assert_eq!(finished.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let pulse = pulse_without_relay(&temp);
        pulse.close();
        pulse.close();
    }
}
