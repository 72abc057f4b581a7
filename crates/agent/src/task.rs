//! Task state machine and interrupt signals.
//!
//! A task is one short-lived reasoning attempt scoped to a single user
//! turn. States walk `idle → compiling → reasoning → acting → observing →
//! (reasoning | completed | failed)`; terminal states are absorbing. Three
//! interrupt primitives can be raised from outside the task's executor at
//! any time: cancel (one-shot, dominates skip), skip (one-shot, consumed at
//! the next tool boundary), and user inserts (a queue drained between
//! iterations). All three are idempotent and safe under concurrent
//! set/observe.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use valet_domain::cancel::CancelToken;
use valet_domain::error::{Error, Result};
use valet_domain::trace::TraceEvent;
use valet_sessions::SessionKey;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Compiling,
    Reasoning,
    Acting,
    Observing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !matches!(self, TaskStatus::Idle) && !self.is_terminal()
    }

    fn allows(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false; // absorbing
        }
        // Any live state may finish (cancellation forces graceful
        // termination from wherever the loop happens to be).
        if next.is_terminal() && self != TaskStatus::Idle {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Idle, TaskStatus::Compiling)
                | (TaskStatus::Compiling, TaskStatus::Reasoning)
                | (TaskStatus::Reasoning, TaskStatus::Acting)
                | (TaskStatus::Acting, TaskStatus::Observing)
                | (TaskStatus::Observing, TaskStatus::Reasoning)
        )
    }

    fn label(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Compiling => "compiling",
            TaskStatus::Reasoning => "reasoning",
            TaskStatus::Acting => "acting",
            TaskStatus::Observing => "observing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TaskState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskState {
    pub task_id: String,
    pub session: SessionKey,
    status: Mutex<TaskStatus>,
    cancel: CancelToken,
    skip_requested: AtomicBool,
    skip_reason: Mutex<Option<String>>,
    inserts: Mutex<Vec<String>>,
    /// Sliding window of recent tool-call signatures for loop detection.
    signatures: Mutex<VecDeque<String>>,
    signature_window: usize,
}

impl TaskState {
    pub fn new(task_id: String, session: SessionKey, signature_window: usize) -> Self {
        Self {
            task_id,
            session,
            status: Mutex::new(TaskStatus::Idle),
            cancel: CancelToken::new(),
            skip_requested: AtomicBool::new(false),
            skip_reason: Mutex::new(None),
            inserts: Mutex::new(Vec::new()),
            signatures: Mutex::new(VecDeque::new()),
            signature_window,
        }
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    /// Transition to a new status; invalid transitions are rejected and
    /// terminal states are absorbing.
    pub fn transition(&self, next: TaskStatus) -> Result<()> {
        let mut status = self.status.lock();
        if !status.allows(next) {
            return Err(Error::InvalidTransition {
                from: status.label().into(),
                to: next.label().into(),
            });
        }
        TraceEvent::TaskTransition {
            task_id: self.task_id.clone(),
            from: status.label().into(),
            to: next.label().into(),
        }
        .emit();
        *status = next;
        Ok(())
    }

    // ── Interrupt primitives ───────────────────────────────────────

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Raise the one-shot cancel signal. Idempotent; first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel.reason()
    }

    /// Raise the one-shot skip signal. Cleared when consumed.
    pub fn request_skip(&self, reason: impl Into<String>) {
        {
            let mut guard = self.skip_reason.lock();
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        self.skip_requested.store(true, Ordering::Release);
    }

    pub fn skip_pending(&self) -> bool {
        self.skip_requested.load(Ordering::Acquire)
    }

    /// Consume the skip signal, clearing it. Returns the reason when a skip
    /// was pending.
    pub fn take_skip(&self) -> Option<String> {
        if self.skip_requested.swap(false, Ordering::AcqRel) {
            Some(
                self.skip_reason
                    .lock()
                    .take()
                    .unwrap_or_else(|| "user skipped this step".into()),
            )
        } else {
            None
        }
    }

    /// Queue a user insert; visible at the next iteration boundary.
    pub fn add_user_insert(&self, text: impl Into<String>) {
        self.inserts.lock().push(text.into());
    }

    /// Drain pending inserts in arrival order.
    pub fn drain_user_inserts(&self) -> Vec<String> {
        std::mem::take(&mut *self.inserts.lock())
    }

    // ── Loop detection ─────────────────────────────────────────────

    /// Record a tool-call signature and return how many times it now occurs
    /// within the sliding window.
    pub fn record_signature(&self, signature: &str) -> usize {
        let mut window = self.signatures.lock();
        window.push_back(signature.to_string());
        while window.len() > self.signature_window {
            window.pop_front();
        }
        window.iter().filter(|s| s.as_str() == signature).count()
    }

    /// Reset no-progress tracking after an endpoint rotation.
    pub fn reset_signatures(&self) {
        self.signatures.lock().clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TaskRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tracks the active task per session and enforces one-at-a-time execution.
///
/// Each session key maps to a `Semaphore(1)`; a turn holds the permit for
/// its duration, so a second message on the same session waits while other
/// sessions run in parallel. Interrupt operations address whatever task is
/// currently registered for the session.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<TaskState>>>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the session's task slot. Blocks while another turn runs.
    pub async fn acquire(&self, session: &SessionKey) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned().await.expect("session semaphore never closed")
    }

    /// Register a new active task for the session.
    pub fn begin(&self, task: Arc<TaskState>) {
        self.tasks
            .lock()
            .insert(task.session.to_string(), task);
    }

    /// Remove the active task (turn finished).
    pub fn finish(&self, session: &SessionKey) {
        self.tasks.lock().remove(&session.to_string());
    }

    pub fn get(&self, session: &SessionKey) -> Option<Arc<TaskState>> {
        self.tasks.lock().get(&session.to_string()).cloned()
    }

    pub fn has_active(&self, session: &SessionKey) -> bool {
        self.get(session)
            .map(|t| !t.status().is_terminal())
            .unwrap_or(false)
    }

    /// Raise cancel on the session's active task. Returns false when idle.
    pub fn cancel(&self, session: &SessionKey, reason: &str) -> bool {
        match self.get(session) {
            Some(task) => {
                task.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Raise skip on the session's active task.
    pub fn skip(&self, session: &SessionKey, reason: &str) -> bool {
        match self.get(session) {
            Some(task) => {
                task.request_skip(reason);
                true
            }
            None => false,
        }
    }

    /// Queue a user insert on the session's active task.
    pub fn insert(&self, session: &SessionKey, text: &str) -> bool {
        match self.get(session) {
            Some(task) => {
                task.add_user_insert(text);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("cli", "local", "me").unwrap()
    }

    fn task() -> TaskState {
        TaskState::new("t1".into(), key(), 10)
    }

    #[test]
    fn valid_transition_chain() {
        let t = task();
        t.transition(TaskStatus::Compiling).unwrap();
        t.transition(TaskStatus::Reasoning).unwrap();
        t.transition(TaskStatus::Acting).unwrap();
        t.transition(TaskStatus::Observing).unwrap();
        t.transition(TaskStatus::Reasoning).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.status().is_terminal());
    }

    #[test]
    fn idle_cannot_complete_directly() {
        let t = task();
        assert!(t.transition(TaskStatus::Completed).is_err());
        assert!(t.transition(TaskStatus::Reasoning).is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let t = task();
        t.transition(TaskStatus::Compiling).unwrap();
        t.transition(TaskStatus::Reasoning).unwrap();
        t.transition(TaskStatus::Failed).unwrap();
        assert!(t.transition(TaskStatus::Reasoning).is_err());
        assert!(t.transition(TaskStatus::Completed).is_err());
    }

    #[test]
    fn failure_allowed_from_any_live_state() {
        for chain in [
            vec![TaskStatus::Compiling],
            vec![TaskStatus::Compiling, TaskStatus::Reasoning],
            vec![
                TaskStatus::Compiling,
                TaskStatus::Reasoning,
                TaskStatus::Acting,
            ],
        ] {
            let t = task();
            for s in &chain {
                t.transition(*s).unwrap();
            }
            t.transition(TaskStatus::Failed).unwrap();
        }
    }

    #[test]
    fn cancel_is_idempotent_first_reason_wins() {
        let t = task();
        t.cancel("first");
        t.cancel("second");
        assert!(t.is_cancelled());
        assert_eq!(t.cancel_reason().as_deref(), Some("first"));
    }

    #[test]
    fn skip_is_one_shot() {
        let t = task();
        assert!(t.take_skip().is_none());

        t.request_skip("skip this tool");
        assert!(t.skip_pending());
        assert_eq!(t.take_skip().as_deref(), Some("skip this tool"));
        // Cleared after consumption.
        assert!(!t.skip_pending());
        assert!(t.take_skip().is_none());
    }

    #[test]
    fn inserts_drain_in_arrival_order() {
        let t = task();
        t.add_user_insert("msg1");
        t.add_user_insert("msg2");
        t.add_user_insert("msg3");
        assert_eq!(t.drain_user_inserts(), vec!["msg1", "msg2", "msg3"]);
        assert!(t.drain_user_inserts().is_empty());
    }

    #[test]
    fn signature_window_slides() {
        let t = TaskState::new("t1".into(), key(), 3);
        assert_eq!(t.record_signature("a"), 1);
        assert_eq!(t.record_signature("a"), 2);
        assert_eq!(t.record_signature("b"), 1);
        // Window is full; the oldest "a" falls out.
        assert_eq!(t.record_signature("a"), 2);
    }

    #[tokio::test]
    async fn registry_one_active_task_per_session() {
        let reg = Arc::new(TaskRegistry::new());

        let p1 = reg.acquire(&key()).await;
        let reg2 = reg.clone();
        let waiter = tokio::spawn(async move {
            let _p2 = reg2.acquire(&key()).await;
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn registry_sessions_run_in_parallel() {
        let reg = TaskRegistry::new();
        let other = SessionKey::new("cli", "other", "me").unwrap();
        let _p1 = reg.acquire(&key()).await;
        // A different session acquires immediately.
        let _p2 = reg.acquire(&other).await;
    }

    #[test]
    fn registry_control_ops_route_to_active_task() {
        let reg = TaskRegistry::new();
        assert!(!reg.cancel(&key(), "stop"));

        let t = Arc::new(task());
        reg.begin(t.clone());
        assert!(reg.cancel(&key(), "stop"));
        assert!(t.is_cancelled());
        assert!(reg.skip(&key(), "skip"));
        assert!(reg.insert(&key(), "extra"));
        assert_eq!(t.drain_user_inserts(), vec!["extra"]);

        reg.finish(&key());
        assert!(reg.get(&key()).is_none());
    }
}
