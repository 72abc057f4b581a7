use valet_domain::cancel::CancelToken;
use valet_domain::error::Result;
use valet_domain::message::{Message, ToolCall, ToolDefinition};
use valet_domain::stream::{BoxStream, ProviderEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A protocol-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// System prompt, carried separately because some protocols hoist it out
    /// of the message list.
    pub system: Option<String>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the endpoint choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the endpoint choose.
    pub max_tokens: Option<u32>,
    /// Request reasoning/thinking content from endpoints that support it.
    pub thinking: bool,
}

/// A protocol-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Reasoning content, when the endpoint emitted it.
    pub thinking: Option<String>,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage information.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// Why the model stopped (normalized: "stop", "tool_calls", ...).
    pub stop_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every wire adapter implements. Adapters translate between the
/// internal message/block model and one provider dialect's HTTP API.
#[async_trait::async_trait]
pub trait WireAdapter: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client trait (engine-facing)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The surface the reasoning engine talks to. `LlmClient` is the production
/// implementation; tests substitute a scripted backend.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Resolve an endpoint and run one completion, with failover.
    async fn chat(&self, req: ChatRequest, cancel: &CancelToken) -> Result<ChatResponse>;

    /// Resolve an endpoint and open a completion stream, with failover on
    /// connection-time errors. In-flight stream errors surface as events.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: &CancelToken,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>>;

    /// Advance the preferred endpoint (called by the engine after repeated
    /// failures). In-flight requests are unaffected.
    fn rotate(&self);

    /// Context window of the currently preferred endpoint, in tokens. Used
    /// for compression pacing decisions, not billing.
    fn context_window_tokens(&self) -> u32;
}
