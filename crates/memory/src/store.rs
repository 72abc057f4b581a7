//! The memory store.
//!
//! A JSON-file-backed store with a single writer lock; readers take an
//! `Arc` snapshot and never block writers. Fact entries are deduplicated at
//! insert time by token-set overlap, and dimensioned kinds (persona traits)
//! retain only the newest entry per (kind, dimension).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use valet_domain::error::{Error, Result};
use valet_domain::trace::TraceEvent;

use crate::entry::{token_overlap, MemoryEntry, MemoryKind, MemoryPriority};

/// Snapshot type handed to readers.
pub type MemorySnapshot = Arc<Vec<MemoryEntry>>;

pub struct MemoryStore {
    /// Persisted file; `None` keeps the store purely in memory (tests).
    path: Option<PathBuf>,
    entries: RwLock<MemorySnapshot>,
    dedupe_threshold: f64,
}

impl MemoryStore {
    pub fn in_memory(dedupe_threshold: f64) -> Self {
        Self {
            path: None,
            entries: RwLock::new(Arc::new(Vec::new())),
            dedupe_threshold,
        }
    }

    /// Load or create the store at `state_path/memory/memories.json`.
    pub fn open(state_path: &std::path::Path, dedupe_threshold: f64) -> Result<Self> {
        let dir = state_path.join("memory");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        let path = dir.join("memories.json");

        let entries: Vec<MemoryEntry> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };

        tracing::info!(
            entries = entries.len(),
            path = %path.display(),
            "memory store loaded"
        );

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(Arc::new(entries)),
            dedupe_threshold,
        })
    }

    /// Lock-free read snapshot.
    pub fn snapshot(&self) -> MemorySnapshot {
        self.entries.read().clone()
    }

    /// Insert an entry, applying fact dedupe and dimension retention.
    /// Returns the stored entry's id.
    pub fn add(&self, entry: MemoryEntry) -> String {
        let id = entry.id.clone();
        let mut guard = self.entries.write();
        let mut next: Vec<MemoryEntry> = guard.as_ref().clone();

        // Dimension retention: newest wins per (kind, dimension).
        if let Some(dimension) = &entry.dimension {
            next.retain(|e| {
                let same_slot = e.kind == entry.kind && e.dimension.as_deref() == Some(dimension);
                !same_slot
            });
        }

        // Fact dedupe: drop older facts that overlap the incoming one.
        if entry.kind == MemoryKind::Fact {
            next.retain(|e| {
                if e.kind != MemoryKind::Fact {
                    return true;
                }
                let overlap = token_overlap(&e.content, &entry.content);
                if overlap >= self.dedupe_threshold {
                    TraceEvent::MemoryDeduped {
                        kept_id: entry.id.clone(),
                        dropped_id: e.id.clone(),
                        overlap,
                    }
                    .emit();
                    false
                } else {
                    true
                }
            });
        }

        next.push(entry);
        *guard = Arc::new(next);
        drop(guard);

        self.persist();
        id
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        self.snapshot().iter().find(|e| e.id == id).cloned()
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut guard = self.entries.write();
        let before = guard.len();
        let next: Vec<MemoryEntry> = guard.iter().filter(|e| e.id != id).cloned().collect();
        let removed = next.len() < before;
        *guard = Arc::new(next);
        drop(guard);
        if removed {
            self.persist();
        }
        removed
    }

    /// Keyword search: case-insensitive substring match on content or tags,
    /// filtered by kind/importance, ordered by importance descending.
    pub fn search(
        &self,
        query: Option<&str>,
        kind: Option<MemoryKind>,
        min_importance: f64,
        limit: usize,
    ) -> Vec<MemoryEntry> {
        let needle = query.map(|q| q.to_lowercase());
        let mut hits: Vec<MemoryEntry> = self
            .snapshot()
            .iter()
            .filter(|e| e.importance >= min_importance)
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| match &needle {
                None => true,
                Some(q) => {
                    q.split_whitespace().any(|word| {
                        e.content.to_lowercase().contains(word)
                            || e.tags.iter().any(|t| t.to_lowercase().contains(word))
                    })
                }
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        hits.truncate(limit);
        hits
    }

    /// Drop transient entries older than `max_age_days`. Returns how many
    /// were pruned.
    pub fn prune_transient(&self, now: DateTime<Utc>, max_age_days: i64) -> usize {
        let cutoff = now - Duration::days(max_age_days);
        let mut guard = self.entries.write();
        let before = guard.len();
        let next: Vec<MemoryEntry> = guard
            .iter()
            .filter(|e| !(e.priority == MemoryPriority::Transient && e.created_at < cutoff))
            .cloned()
            .collect();
        let pruned = before - next.len();
        *guard = Arc::new(next);
        drop(guard);
        if pruned > 0 {
            self.persist();
        }
        pruned
    }

    /// Entry counts per kind, for diagnostics.
    pub fn stats(&self) -> HashMap<MemoryKind, usize> {
        let mut stats = HashMap::new();
        for e in self.snapshot().iter() {
            *stats.entry(e.kind).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let snapshot = self.snapshot();
        match serde_json::to_string_pretty(snapshot.as_ref()) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, "failed to persist memory store");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize memory store"),
        }
    }
}
