//! Deterministic task scheduler.
//!
//! Timers (`once` / `interval` / `cron`) produce synthetic user turns that
//! feed the same reasoning loop as live input, or reminder messages emitted
//! verbatim to the session. A trigger fires only when the target session has
//! no active task; windows missed while the process was down compact into a
//! single catch-up execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use valet_domain::error::{Error, Result};
use valet_domain::trace::TraceEvent;
use valet_sessions::{SessionKey, TranscriptWriter};

use crate::cron::{cron_next_tz, parse_tz};
use crate::engine::{self, AgentEvent, TurnInput};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Once { run_at: DateTime<Utc> },
    Interval { minutes: u64 },
    Cron { expr: String, timezone: String },
}

/// What firing the task does: reinject a prompt through the reasoning loop,
/// or deliver a reminder verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum TaskAction {
    Prompt(String),
    Reminder(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    /// Target session id (`channel:chat_id:user_id`).
    pub session: String,
    pub trigger: Trigger,
    pub action: TaskAction,
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub fn new(
        name: impl Into<String>,
        session: impl Into<String>,
        trigger: Trigger,
        action: TaskAction,
    ) -> Self {
        let now = Utc::now();
        let mut task = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            session: session.into(),
            trigger,
            action,
            enabled: true,
            run_count: 0,
            fail_count: 0,
            created_at: now,
            last_run_at: None,
            next_run_at: None,
        };
        task.next_run_at = task.first_run(now);
        task
    }

    fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.trigger {
            // A past run_at is still due once (exactly one execution).
            Trigger::Once { run_at } => Some(*run_at),
            Trigger::Interval { minutes } => Some(now + Duration::minutes(*minutes as i64)),
            Trigger::Cron { expr, timezone } => cron_next_tz(expr, &now, parse_tz(timezone)),
        }
    }

    /// Compute the next window after a fire at `now`. Anchoring on `now`
    /// (not the missed window) is what compacts a backlog into one catch-up
    /// execution.
    pub fn next_after_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.trigger {
            Trigger::Once { .. } => None,
            Trigger::Interval { minutes } => Some(now + Duration::minutes(*minutes as i64)),
            Trigger::Cron { expr, timezone } => cron_next_tz(expr, &now, parse_tz(timezone)),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|t| t <= now)
    }

    /// Whether firing at `now` is catching up on more than one missed window.
    pub fn is_catch_up(&self, now: DateTime<Utc>) -> bool {
        let Some(due) = self.next_run_at else {
            return false;
        };
        match &self.trigger {
            Trigger::Once { .. } => false,
            Trigger::Interval { minutes } => now - due >= Duration::minutes(*minutes as i64),
            Trigger::Cron { expr, timezone } => {
                match cron_next_tz(expr, &due, parse_tz(timezone)) {
                    Some(window_after_due) => window_after_due <= now,
                    None => false,
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-file-backed schedule store.
pub struct ScheduleStore {
    path: Option<PathBuf>,
    tasks: RwLock<HashMap<Uuid, ScheduledTask>>,
}

impl ScheduleStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Load or create the store at `state_path/schedules.json`.
    pub fn open(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("schedules.json");
        let tasks: HashMap<Uuid, ScheduledTask> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(tasks = tasks.len(), path = %path.display(), "schedule store loaded");

        Ok(Self {
            path: Some(path),
            tasks: RwLock::new(tasks),
        })
    }

    pub fn add(&self, task: ScheduledTask) -> Result<Uuid> {
        SessionKey::parse(&task.session)?;
        let id = task.id;
        self.tasks.write().insert(id, task);
        self.persist();
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<ScheduledTask> {
        self.tasks.read().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self.tasks.write().remove(id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn set_enabled(&self, id: &Uuid, enabled: bool) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(id) else {
            return false;
        };
        task.enabled = enabled;
        drop(tasks);
        self.persist();
        true
    }

    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Tasks due at `now`, with their catch-up flag.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<(ScheduledTask, bool)> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| (t.clone(), t.is_catch_up(now)))
            .collect()
    }

    /// Record a fire: bump counters, advance (or disable) the trigger.
    pub fn record_fire(&self, id: &Uuid, now: DateTime<Utc>, failed: bool) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            task.run_count += 1;
            if failed {
                task.fail_count += 1;
            }
            task.last_run_at = Some(now);
            task.next_run_at = task.next_after_fire(now);
            if task.next_run_at.is_none() {
                // `once` triggers fire exactly one time.
                task.enabled = false;
            }
        }
        drop(tasks);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let tasks = self.tasks.read();
        match serde_json::to_string_pretty(&*tasks) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, "failed to persist schedule store");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize schedule store"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The scheduler tick loop. Spawned once at startup; runs until the
/// process exits.
pub async fn run_loop(state: Arc<AppState>) {
    let tick = std::time::Duration::from_secs(state.config.scheduler.tick_secs.max(1));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        tick_once(&state, Utc::now()).await;
    }
}

/// One scheduler pass: fire every due task whose session is idle.
pub async fn tick_once(state: &Arc<AppState>, now: DateTime<Utc>) {
    for (task, catch_up) in state.schedules.due(now) {
        let session = match SessionKey::parse(&task.session) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "scheduled task has invalid session, disabling");
                state.schedules.set_enabled(&task.id, false);
                continue;
            }
        };

        // Defer while the session is busy; the task stays due and the next
        // tick retries.
        if state.tasks.has_active(&session) {
            tracing::debug!(task = %task.name, "session busy, deferring scheduled task");
            continue;
        }

        TraceEvent::ScheduleFired {
            task_name: task.name.clone(),
            catch_up,
        }
        .emit();

        let failed = fire(state, &task, &session).await;
        state.schedules.record_fire(&task.id, now, failed);
    }
}

/// Execute one task. Returns true when the fire failed.
async fn fire(state: &Arc<AppState>, task: &ScheduledTask, session: &SessionKey) -> bool {
    match &task.action {
        TaskAction::Reminder(message) => {
            state.sessions.resolve_or_create(session);
            let turn = state.sessions.next_turn_index(session);
            let mut line = TranscriptWriter::line("assistant", message);
            line.turn = Some(turn);
            line.metadata = Some(serde_json::json!({ "reminder": true, "task": task.name }));
            if let Err(e) = state.transcripts.append(session, &[line]) {
                tracing::warn!(task = %task.name, error = %e, "failed to deliver reminder");
                return true;
            }
            false
        }
        TaskAction::Prompt(prompt) => {
            let (_task_id, mut rx) =
                engine::run_turn(state.clone(), TurnInput::text(session.clone(), prompt.clone()));
            // Drain events exactly as a transport would; the turn outcome
            // decides the fail counter.
            let mut failed = false;
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::Error { .. }) {
                    failed = true;
                }
            }
            failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn once_task(run_at: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask::new(
            "water plants",
            "cli:local:me",
            Trigger::Once { run_at },
            TaskAction::Reminder("water the plants".into()),
        )
    }

    #[test]
    fn once_in_the_past_is_due_exactly_once() {
        let now = Utc::now();
        let store = ScheduleStore::in_memory();
        let task = once_task(now - Duration::hours(2));
        let id = store.add(task).unwrap();

        let due = store.due(now);
        assert_eq!(due.len(), 1);

        store.record_fire(&id, now, false);
        // Exactly one execution: disabled, no future windows.
        let task = store.get(&id).unwrap();
        assert!(!task.enabled);
        assert!(task.next_run_at.is_none());
        assert_eq!(task.run_count, 1);
        assert!(store.due(now + Duration::days(365)).is_empty());
    }

    #[test]
    fn once_in_the_future_not_due_yet() {
        let now = Utc::now();
        let store = ScheduleStore::in_memory();
        store.add(once_task(now + Duration::hours(1))).unwrap();
        assert!(store.due(now).is_empty());
        assert_eq!(store.due(now + Duration::hours(2)).len(), 1);
    }

    #[test]
    fn interval_advances_from_fire_time() {
        let now = Utc::now();
        let store = ScheduleStore::in_memory();
        let task = ScheduledTask::new(
            "sync",
            "cli:local:me",
            Trigger::Interval { minutes: 30 },
            TaskAction::Prompt("check inbox".into()),
        );
        let id = store.add(task).unwrap();

        // Not due immediately.
        assert!(store.due(now).is_empty());

        // Simulate a long outage: many windows missed.
        let later = now + Duration::hours(6);
        let due = store.due(later);
        assert_eq!(due.len(), 1, "backlog compacts to a single due entry");
        assert!(due[0].1, "firing after missed windows is a catch-up");

        store.record_fire(&id, later, false);
        let task = store.get(&id).unwrap();
        // Next window anchors on the fire time, not the backlog.
        let next = task.next_run_at.unwrap();
        assert!(next > later + Duration::minutes(29));
        assert!(next <= later + Duration::minutes(31));
    }

    #[test]
    fn cron_task_computes_next_window() {
        let store = ScheduleStore::in_memory();
        let task = ScheduledTask::new(
            "daily digest",
            "cli:local:me",
            Trigger::Cron {
                expr: "0 9 * * *".into(),
                timezone: "UTC".into(),
            },
            TaskAction::Prompt("compile my digest".into()),
        );
        let id = store.add(task).unwrap();
        let task = store.get(&id).unwrap();
        let next = task.next_run_at.unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "09:00");
    }

    #[test]
    fn invalid_session_rejected() {
        let store = ScheduleStore::in_memory();
        let task = ScheduledTask::new(
            "bad",
            "not-a-session-key",
            Trigger::Interval { minutes: 5 },
            TaskAction::Reminder("x".into()),
        );
        assert!(store.add(task).is_err());
    }

    #[test]
    fn set_enabled_toggles() {
        let store = ScheduleStore::in_memory();
        let id = store.add(once_task(Utc::now() - Duration::minutes(1))).unwrap();
        assert!(store.set_enabled(&id, false));
        assert!(store.due(Utc::now()).is_empty());
        assert!(store.set_enabled(&id, true));
        assert_eq!(store.due(Utc::now()).len(), 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = ScheduleStore::open(dir.path()).unwrap();
            id = store.add(once_task(Utc::now() + Duration::hours(1))).unwrap();
        }
        let store = ScheduleStore::open(dir.path()).unwrap();
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn fail_counter_tracks_failures() {
        let store = ScheduleStore::in_memory();
        let task = ScheduledTask::new(
            "flaky",
            "cli:local:me",
            Trigger::Interval { minutes: 1 },
            TaskAction::Prompt("do it".into()),
        );
        let id = store.add(task).unwrap();
        let now = Utc::now();
        store.record_fire(&id, now, true);
        store.record_fire(&id, now, false);
        let task = store.get(&id).unwrap();
        assert_eq!(task.run_count, 2);
        assert_eq!(task.fail_count, 1);
    }
}
