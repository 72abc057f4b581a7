//! Memory retrieval for prompt injection.
//!
//! The prompt assembler depends only on the [`MemoryRetriever`] interface.
//! Two implementations exist: [`VectorRetriever`] ranks by embedding
//! similarity when embeddings are available and falls back to keywords when
//! they are not, and [`KeywordRetriever`] is the pure substring-match
//! fallback. Results are deduplicated and ordered by importance.

use std::path::Path;
use std::sync::Arc;

use crate::entry::MemoryEntry;
use crate::store::MemoryStore;

/// A snippet selected for injection.
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub content: String,
    pub importance: f64,
    /// True when ranked by embedding similarity rather than keywords.
    pub semantic: bool,
}

pub trait MemoryRetriever: Send + Sync {
    fn retrieve(&self, query: &str, max_items: usize, min_importance: f64)
        -> Vec<RetrievedMemory>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keyword retriever
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KeywordRetriever {
    store: Arc<MemoryStore>,
}

impl KeywordRetriever {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl MemoryRetriever for KeywordRetriever {
    fn retrieve(
        &self,
        query: &str,
        max_items: usize,
        min_importance: f64,
    ) -> Vec<RetrievedMemory> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        dedupe(
            self.store
                .search(Some(query), None, min_importance, max_items)
                .into_iter()
                .map(|e| RetrievedMemory {
                    content: e.content,
                    importance: e.importance,
                    semantic: false,
                })
                .collect(),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vector retriever
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Produces a query embedding. Returning `None` (no embedding backend
/// configured, or the call failed) triggers the keyword fallback.
pub type QueryEmbedder = Arc<dyn Fn(&str) -> Option<Vec<f32>> + Send + Sync>;

pub struct VectorRetriever {
    store: Arc<MemoryStore>,
    embedder: QueryEmbedder,
    fallback: KeywordRetriever,
}

impl VectorRetriever {
    pub fn new(store: Arc<MemoryStore>, embedder: QueryEmbedder) -> Self {
        Self {
            fallback: KeywordRetriever::new(store.clone()),
            store,
            embedder,
        }
    }
}

impl MemoryRetriever for VectorRetriever {
    fn retrieve(
        &self,
        query: &str,
        max_items: usize,
        min_importance: f64,
    ) -> Vec<RetrievedMemory> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let query_embedding = match (self.embedder)(query) {
            Some(v) if !v.is_empty() => v,
            _ => return self.fallback.retrieve(query, max_items, min_importance),
        };

        let snapshot = self.store.snapshot();
        let mut scored: Vec<(f32, &MemoryEntry)> = snapshot
            .iter()
            .filter(|e| e.importance >= min_importance)
            .filter_map(|e| {
                let emb = e.embedding.as_ref()?;
                Some((cosine_similarity(&query_embedding, emb), e))
            })
            .collect();

        if scored.is_empty() {
            return self.fallback.retrieve(query, max_items, min_importance);
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        dedupe(
            scored
                .into_iter()
                .take(max_items)
                .map(|(_, e)| RetrievedMemory {
                    content: e.content.clone(),
                    importance: e.importance,
                    semantic: true,
                })
                .collect(),
        )
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn dedupe(items: Vec<RetrievedMemory>) -> Vec<RetrievedMemory> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|m| seen.insert(m.content.clone()))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core memory file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read the core memory file, truncating tail-first so the most recent
/// lines survive when the file exceeds `max_chars`.
pub fn load_core_memory(path: &Path, max_chars: usize) -> String {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c.trim().to_string(),
        Err(_) => return String::new(),
    };
    if content.len() <= max_chars {
        return content;
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut current_len = 0;
    for line in content.lines().rev() {
        if current_len + line.len() + 1 > max_chars {
            break;
        }
        kept.push(line);
        current_len += line.len() + 1;
    }
    kept.reverse();
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{MemoryEntry, MemoryKind};

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::in_memory(0.7));
        store.add(
            MemoryEntry::new("user works on a Rust compiler", MemoryKind::Fact)
                .with_importance(0.9)
                .with_embedding(vec![1.0, 0.0]),
        );
        store.add(
            MemoryEntry::new("user prefers dark roast coffee", MemoryKind::Preference)
                .with_importance(0.7)
                .with_embedding(vec![0.0, 1.0]),
        );
        store.add(
            MemoryEntry::new("low value scratch", MemoryKind::Context).with_importance(0.1),
        );
        store
    }

    #[test]
    fn keyword_retrieval_matches_substring() {
        let retriever = KeywordRetriever::new(seeded_store());
        let hits = retriever.retrieve("coffee", 5, 0.5);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("dark roast"));
        assert!(!hits[0].semantic);
    }

    #[test]
    fn keyword_retrieval_empty_query() {
        let retriever = KeywordRetriever::new(seeded_store());
        assert!(retriever.retrieve("  ", 5, 0.0).is_empty());
    }

    #[test]
    fn vector_retrieval_ranks_by_similarity() {
        let store = seeded_store();
        let embedder: QueryEmbedder = Arc::new(|_q| Some(vec![0.9, 0.1]));
        let retriever = VectorRetriever::new(store, embedder);
        let hits = retriever.retrieve("compilers", 2, 0.5);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("Rust compiler"));
        assert!(hits[0].semantic);
    }

    #[test]
    fn vector_falls_back_to_keyword_without_embedder() {
        let store = seeded_store();
        let embedder: QueryEmbedder = Arc::new(|_q| None);
        let retriever = VectorRetriever::new(store, embedder);
        let hits = retriever.retrieve("coffee", 5, 0.5);
        assert_eq!(hits.len(), 1);
        assert!(!hits[0].semantic);
    }

    #[test]
    fn min_importance_filters() {
        let retriever = KeywordRetriever::new(seeded_store());
        let hits = retriever.retrieve("scratch", 5, 0.5);
        assert!(hits.is_empty());
    }

    #[test]
    fn core_memory_truncates_tail_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        let lines: Vec<String> = (0..20).map(|i| format!("- note {i}")).collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let loaded = load_core_memory(&path, 40);
        // The most recent lines survive.
        assert!(loaded.contains("note 19"));
        assert!(!loaded.contains("note 0\n"));
        assert!(loaded.len() <= 40);
    }

    #[test]
    fn core_memory_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_core_memory(&dir.path().join("nope.md"), 100), "");
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) > 0.99);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.01);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
