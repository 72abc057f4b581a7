//! Long-term memory: entries, the deduplicating store, and the retriever
//! interface the prompt assembler injects from.

pub mod entry;
pub mod retriever;
pub mod store;

pub use entry::{token_overlap, MemoryEntry, MemoryKind, MemoryPriority};
pub use retriever::{
    load_core_memory, KeywordRetriever, MemoryRetriever, RetrievedMemory, VectorRetriever,
};
pub use store::MemoryStore;
