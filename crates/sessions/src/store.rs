//! The session store.
//!
//! Persists session state in `sessions.json` under the configured state
//! path. Each session key maps to a [`SessionEntry`] tracking turn counters,
//! token usage, and expiry. Sessions are never destroyed by inactivity;
//! long-idle sessions are only marked expired. The session's owning task is
//! the single writer; readers take cloned snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use valet_domain::error::{Error, Result};
use valet_domain::trace::TraceEvent;

use crate::key::SessionKey;

/// Idle time after which a session is marked expired (not deleted).
const EXPIRE_AFTER_DAYS: i64 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session tracked by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Turn indices are contiguous starting from this offset.
    #[serde(default)]
    pub turn_offset: u64,
    /// Next turn index to hand out.
    #[serde(default)]
    pub next_turn: u64,
    /// Marked after 30 idle days; data is retained.
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-file-backed session store.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load or create the store at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    /// Directory holding per-session transcripts.
    pub fn transcript_dir(&self) -> PathBuf {
        self.sessions_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf()
    }

    /// Look up a session by key (snapshot).
    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.sessions.read().get(&key.to_string()).cloned()
    }

    /// Resolve or create a session. Returns `(entry, is_new)`. Touching an
    /// expired session reactivates it: the expired flag clears and the turn
    /// offset jumps to the current counter.
    pub fn resolve_or_create(&self, key: &SessionKey) -> (SessionEntry, bool) {
        let id = key.to_string();
        {
            let mut sessions = self.sessions.write();
            if let Some(entry) = sessions.get_mut(&id) {
                if entry.expired {
                    entry.expired = false;
                    entry.turn_offset = entry.next_turn;
                }
                return (entry.clone(), false);
            }
        }

        let now = Utc::now();
        let entry = SessionEntry {
            session_id: id.clone(),
            created_at: now,
            updated_at: now,
            turn_offset: 0,
            next_turn: 0,
            expired: false,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        };

        self.sessions.write().insert(id.clone(), entry.clone());

        TraceEvent::SessionResolved {
            session_id: id,
            is_new: true,
        }
        .emit();

        (entry, true)
    }

    /// Hand out the next turn index for a session (contiguous, monotonic).
    pub fn next_turn_index(&self, key: &SessionKey) -> u64 {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&key.to_string()) {
            Some(entry) => {
                let turn = entry.next_turn;
                entry.next_turn += 1;
                entry.updated_at = Utc::now();
                turn
            }
            None => 0,
        }
    }

    /// Update token counters for a session.
    pub fn record_usage(&self, key: &SessionKey, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(&key.to_string()) {
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_tokens += input_tokens + output_tokens;
            entry.updated_at = Utc::now();
        }
    }

    /// Explicitly close (remove) a session. The transcript file stays.
    pub fn close(&self, key: &SessionKey) -> bool {
        self.sessions.write().remove(&key.to_string()).is_some()
    }

    /// Mark sessions idle for more than 30 days as expired. Returns how many
    /// were newly marked. No data is destroyed.
    pub fn mark_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(EXPIRE_AFTER_DAYS);
        let mut marked = 0;
        let mut sessions = self.sessions.write();
        for entry in sessions.values_mut() {
            if !entry.expired && entry.updated_at < cutoff {
                entry.expired = true;
                marked += 1;
            }
        }
        marked
    }

    /// List all session entries (snapshot).
    pub fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    /// Persist the current session state to disk.
    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| Error::Other(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.sessions_path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn key() -> SessionKey {
        SessionKey::new("cli", "local", "me").unwrap()
    }

    #[test]
    fn resolve_creates_then_reuses() {
        let (_dir, store) = store();
        let (entry, is_new) = store.resolve_or_create(&key());
        assert!(is_new);
        assert_eq!(entry.session_id, "cli:local:me");

        let (_, is_new) = store.resolve_or_create(&key());
        assert!(!is_new);
    }

    #[test]
    fn turn_indices_are_contiguous() {
        let (_dir, store) = store();
        store.resolve_or_create(&key());
        assert_eq!(store.next_turn_index(&key()), 0);
        assert_eq!(store.next_turn_index(&key()), 1);
        assert_eq!(store.next_turn_index(&key()), 2);
    }

    #[test]
    fn usage_accumulates() {
        let (_dir, store) = store();
        store.resolve_or_create(&key());
        store.record_usage(&key(), 100, 20);
        store.record_usage(&key(), 50, 10);
        let entry = store.get(&key()).unwrap();
        assert_eq!(entry.input_tokens, 150);
        assert_eq!(entry.output_tokens, 30);
        assert_eq!(entry.total_tokens, 180);
    }

    #[test]
    fn idle_sessions_marked_expired_not_deleted() {
        let (_dir, store) = store();
        store.resolve_or_create(&key());

        // Nothing is stale yet.
        assert_eq!(store.mark_expired(Utc::now()), 0);

        // 31 days in the future the session counts as idle.
        let future = Utc::now() + Duration::days(31);
        assert_eq!(store.mark_expired(future), 1);
        let entry = store.get(&key()).unwrap();
        assert!(entry.expired);
        // Data survives.
        assert_eq!(entry.session_id, "cli:local:me");
    }

    #[test]
    fn reactivation_resets_turn_offset() {
        let (_dir, store) = store();
        store.resolve_or_create(&key());
        store.next_turn_index(&key());
        store.next_turn_index(&key());

        let future = Utc::now() + Duration::days(31);
        store.mark_expired(future);

        let (entry, is_new) = store.resolve_or_create(&key());
        assert!(!is_new);
        assert!(!entry.expired);
        // Indices stay contiguous from the recorded offset.
        assert_eq!(entry.turn_offset, 2);
        assert_eq!(store.next_turn_index(&key()), 2);
    }

    #[test]
    fn close_removes_entry() {
        let (_dir, store) = store();
        store.resolve_or_create(&key());
        assert!(store.close(&key()));
        assert!(store.get(&key()).is_none());
        assert!(!store.close(&key()));
    }

    #[test]
    fn flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(dir.path()).unwrap();
            store.resolve_or_create(&key());
            store.record_usage(&key(), 10, 5);
            store.flush().unwrap();
        }
        let store = SessionStore::new(dir.path()).unwrap();
        let entry = store.get(&key()).unwrap();
        assert_eq!(entry.total_tokens, 15);
    }
}
