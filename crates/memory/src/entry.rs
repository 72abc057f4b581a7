use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a memory entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Preference,
    Rule,
    Skill,
    PersonaTrait,
    Context,
    Error,
}

/// Retention class for a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPriority {
    Transient,
    ShortTerm,
    LongTerm,
    Permanent,
}

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub kind: MemoryKind,
    /// Relevance weight in [0, 1].
    pub importance: f64,
    pub priority: MemoryPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    /// For dimensioned kinds (persona traits): only the newest entry per
    /// (kind, dimension) is retained.
    #[serde(default)]
    pub dimension: Option<String>,
    /// Embedding vector for semantic retrieval, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, kind: MemoryKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            kind,
            importance: 0.5,
            priority: MemoryPriority::LongTerm,
            tags: Vec::new(),
            dimension: None,
            embedding: None,
            created_at: now,
            accessed_at: now,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_priority(mut self, priority: MemoryPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = Some(dimension.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Lowercased word set of a text, for overlap comparison.
pub fn token_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Token-set overlap between two texts: |A ∩ B| / min(|A|, |B|).
///
/// Containment rather than Jaccard, so a short fact repeated inside a longer
/// duplicate still counts as the same fact. Returns 0.0 when either side has
/// no tokens.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / set_a.len().min(set_b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_set_normalizes() {
        let set = token_set("The User likes Python, really likes it!");
        assert!(set.contains("python"));
        assert!(set.contains("user"));
        assert!(!set.contains(""));
    }

    #[test]
    fn identical_texts_fully_overlap() {
        assert_eq!(token_overlap("user likes tea", "user likes tea"), 1.0);
    }

    #[test]
    fn disjoint_texts_do_not_overlap() {
        assert_eq!(token_overlap("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn containment_counts_as_high_overlap() {
        // The short fact is fully contained in the longer one.
        let overlap = token_overlap(
            "birthday is March 15",
            "the user's birthday is March 15 every year",
        );
        assert!(overlap >= 0.9, "got {overlap}");
    }

    #[test]
    fn empty_text_overlap_is_zero() {
        assert_eq!(token_overlap("", "something"), 0.0);
    }

    #[test]
    fn importance_is_clamped() {
        let e = MemoryEntry::new("x", MemoryKind::Fact).with_importance(2.5);
        assert_eq!(e.importance, 1.0);
        let e = MemoryEntry::new("x", MemoryKind::Fact).with_importance(-1.0);
        assert_eq!(e.importance, 0.0);
    }
}
