use serde::Serialize;

/// Structured trace events emitted across all Valet crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LlmRequest {
        endpoint: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmFallback {
        from_endpoint: String,
        to_endpoint: String,
        reason: String,
    },
    EndpointUnhealthy {
        endpoint: String,
        reason: String,
    },
    SoftDegrade {
        endpoint: String,
        stripped_blocks: usize,
    },
    SessionResolved {
        session_id: String,
        is_new: bool,
    },
    TranscriptAppend {
        session_id: String,
        lines: usize,
    },
    TaskTransition {
        task_id: String,
        from: String,
        to: String,
    },
    ToolDispatched {
        tool_name: String,
        duration_ms: u64,
        is_error: bool,
    },
    ContextCompressed {
        groups_compacted: usize,
        tokens_before: u32,
        tokens_after: u32,
    },
    PromptAssembled {
        total_tokens: u32,
        sections_over_budget: usize,
    },
    ScheduleFired {
        task_name: String,
        catch_up: bool,
    },
    MemoryDeduped {
        kept_id: String,
        dropped_id: String,
        overlap: f64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "valet_event");
    }
}
