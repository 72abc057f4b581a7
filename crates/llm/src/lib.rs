//! The LLM client layer: wire adapters for the three supported protocols
//! (Anthropic, OpenAI-compatible, Gemini), endpoint records with health
//! state, and the capability-aware failover client.

pub mod anthropic;
pub mod client;
pub mod endpoint;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod traits;
pub mod util;

pub use client::LlmClient;
pub use endpoint::{Endpoint, EndpointSet};
pub use traits::{ChatClient, ChatRequest, ChatResponse, WireAdapter};
