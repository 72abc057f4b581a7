//! Control operations exposed to host transports: `cancel`, `skip`,
//! `insert`, and `answer`. All address a session by its
//! `channel:chat_id:user_id` id and act on whatever task is currently
//! active there.

use std::sync::Arc;

use tokio::sync::mpsc;

use valet_domain::error::Result;
use valet_sessions::SessionKey;

use crate::engine::{self, AgentEvent, TurnInput};
use crate::state::AppState;

/// Outcome of an [`answer`] call.
pub enum AnswerOutcome {
    /// A task was active; the text was queued as a user insert and will be
    /// visible at the next iteration boundary.
    Inserted,
    /// The session was idle; a fresh turn was started.
    NewTurn {
        task_id: String,
        events: mpsc::Receiver<AgentEvent>,
    },
}

/// Cancel the session's active task. Returns false when the session is idle.
pub fn cancel(state: &Arc<AppState>, session_id: &str, reason: &str) -> Result<bool> {
    let key = SessionKey::parse(session_id)?;
    Ok(state.tasks.cancel(&key, reason))
}

/// Discard the active task's pending tool batch at the next tool boundary.
pub fn skip(state: &Arc<AppState>, session_id: &str) -> Result<bool> {
    let key = SessionKey::parse(session_id)?;
    Ok(state.tasks.skip(&key, "user skipped this step"))
}

/// Queue extra user input for the active task; it merges into the working
/// message list between iterations.
pub fn insert(state: &Arc<AppState>, session_id: &str, text: &str) -> Result<bool> {
    let key = SessionKey::parse(session_id)?;
    Ok(state.tasks.insert(&key, text))
}

/// Satisfy a model-issued clarification request: behaves like `insert` when
/// a task is active, otherwise starts a fresh turn with the text.
pub fn answer(state: &Arc<AppState>, session_id: &str, text: &str) -> Result<AnswerOutcome> {
    let key = SessionKey::parse(session_id)?;
    if state.tasks.insert(&key, text) {
        return Ok(AnswerOutcome::Inserted);
    }
    let (task_id, events) = engine::run_turn(state.clone(), TurnInput::text(key, text));
    Ok(AnswerOutcome::NewTurn { task_id, events })
}
