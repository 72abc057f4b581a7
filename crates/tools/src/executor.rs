//! The batch tool executor.
//!
//! `execute_batch` dispatches every tool-use block from one assistant turn.
//! Calls may run in parallel up to a configured ceiling (default 1); tools
//! not marked parallel-safe additionally serialize on a shared lock.
//! Results always come back in input order. Payloads beyond the guard
//! length are truncated with a stable overflow marker, unknown tools yield
//! `is_error` results, and cancellation substitutes a fixed payload for the
//! calls that have not started yet.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use valet_domain::cancel::CancelToken;
use valet_domain::message::ToolCall;
use valet_domain::trace::TraceEvent;

use crate::error::ToolError;
use crate::registry::{ToolRegistry, CALL_TOOL, TOOL_HELP};

/// Stable, detectable marker appended where a payload was cut.
pub const OVERFLOW_MARKER: &str = "\n[TRUNCATED: tool result exceeded limit]";

/// Payload substituted for calls skipped due to cancellation.
const CANCELLED_PAYLOAD: &str = "operation cancelled by user";

/// One tool result, paired to its originating call.
#[derive(Debug, Clone)]
pub struct ToolResultPayload {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    max_parallel: usize,
    guard_bytes: usize,
    /// Serializes tools that are not parallel-safe.
    serial_lock: Arc<Mutex<()>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_parallel: usize, guard_bytes: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
            guard_bytes,
            serial_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute a batch of tool calls. Results preserve input order
    /// regardless of completion order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancelToken,
    ) -> Vec<ToolResultPayload> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        let futures: Vec<_> = calls
            .iter()
            .map(|tc| {
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                async move {
                    // Poll cancellation before the call starts.
                    if cancel.is_cancelled() {
                        return ToolResultPayload {
                            call_id: tc.call_id.clone(),
                            tool_name: tc.tool_name.clone(),
                            content: CANCELLED_PAYLOAD.into(),
                            is_error: true,
                        };
                    }
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    if cancel.is_cancelled() {
                        return ToolResultPayload {
                            call_id: tc.call_id.clone(),
                            tool_name: tc.tool_name.clone(),
                            content: CANCELLED_PAYLOAD.into(),
                            is_error: true,
                        };
                    }
                    self.dispatch_one(tc, &cancel).await
                }
            })
            .collect();

        // join_all preserves input order.
        futures_util::future::join_all(futures).await
    }

    /// Execute a single call: resolve the registry-level tools
    /// (`call_tool`, `tool_help`), run the handler, guard the payload.
    async fn dispatch_one(&self, tc: &ToolCall, cancel: &CancelToken) -> ToolResultPayload {
        let started = Instant::now();
        let (effective_name, effective_args) = match self.resolve_indirection(tc) {
            Ok(resolved) => resolved,
            Err(err) => return self.error_payload(tc, err),
        };

        // tool_help is answered directly from the registry.
        if effective_name == TOOL_HELP {
            let name = effective_args
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            return match self.registry.help_for(name) {
                Some(help) => ToolResultPayload {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    content: self.guard_truncate(help),
                    is_error: false,
                },
                None => self.error_payload(tc, self.unknown_tool_error(name)),
            };
        }

        let registered = match self.registry.get(&effective_name) {
            Some(r) => r,
            None => {
                return self.error_payload(tc, self.unknown_tool_error(&effective_name));
            }
        };

        // Tools without a parallel-safe declaration serialize, whatever the
        // global ceiling says.
        let _serial_guard = if registered.spec.parallel_safe {
            None
        } else {
            Some(self.serial_lock.lock().await)
        };

        let result = registered.handler.call(effective_args, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let payload = match result {
            Ok(content) => ToolResultPayload {
                call_id: tc.call_id.clone(),
                tool_name: tc.tool_name.clone(),
                content: self.guard_truncate(content),
                is_error: false,
            },
            Err(err) => self.error_payload(tc, err),
        };

        TraceEvent::ToolDispatched {
            tool_name: effective_name,
            duration_ms,
            is_error: payload.is_error,
        }
        .emit();

        payload
    }

    /// Unwrap `call_tool` indirection into (name, arguments).
    fn resolve_indirection(&self, tc: &ToolCall) -> Result<(String, Value), ToolError> {
        if tc.tool_name != CALL_TOOL {
            return Ok((tc.tool_name.clone(), tc.arguments.clone()));
        }
        let name = tc
            .arguments
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::validation(CALL_TOOL, "missing required argument: name")
            })?;
        let arguments = tc
            .arguments
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));
        Ok((name.to_string(), arguments))
    }

    fn unknown_tool_error(&self, name: &str) -> ToolError {
        ToolError::not_found(name, format!("tool not found: '{name}'"))
            .with_retry_suggestion("check the tool catalog for available tools")
            .with_alternatives(self.registry.names().into_iter().take(8).collect())
    }

    fn error_payload(&self, tc: &ToolCall, err: ToolError) -> ToolResultPayload {
        ToolResultPayload {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
            content: self.guard_truncate(err.to_payload()),
            is_error: true,
        }
    }

    /// Truncate a payload at the guard length, at a char boundary, with the
    /// stable overflow marker appended.
    fn guard_truncate(&self, content: String) -> String {
        if content.len() <= self.guard_bytes {
            return content;
        }
        let mut end = self.guard_bytes;
        while !content.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        let mut truncated = content[..end].to_string();
        truncated.push_str(OVERFLOW_MARKER);
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorType;
    use crate::registry::{ToolHandler, ToolSpec};
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
            Ok(args
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("echo")
                .to_string())
        }
    }

    struct SleepHandler {
        millis: u64,
    }

    #[async_trait::async_trait]
    impl ToolHandler for SleepHandler {
        async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(args.get("id").and_then(|v| v.as_str()).unwrap_or("done").to_string())
        }
    }

    struct BigHandler;

    #[async_trait::async_trait]
    impl ToolHandler for BigHandler {
        async fn call(&self, _args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
            Ok("x".repeat(1_000))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl ToolHandler for FailingHandler {
        async fn call(&self, _args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
            Err(ToolError::new(ToolErrorType::Transient, "flaky", "backend hiccup")
                .with_retry_suggestion("try again"))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    fn executor_with(max_parallel: usize, guard: usize) -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(
            ToolSpec::new("echo", "echo", serde_json::json!({"type": "object"})).parallel_safe(),
            Arc::new(EchoHandler),
        );
        registry.register(
            ToolSpec::new("sleepy", "sleeps", serde_json::json!({"type": "object"}))
                .parallel_safe(),
            Arc::new(SleepHandler { millis: 150 }),
        );
        registry.register(
            ToolSpec::new("big", "large output", serde_json::json!({"type": "object"}))
                .parallel_safe(),
            Arc::new(BigHandler),
        );
        registry.register(
            ToolSpec::new("flaky", "fails", serde_json::json!({"type": "object"})).parallel_safe(),
            Arc::new(FailingHandler),
        );
        registry.register(
            ToolSpec::new("cat_echo", "catalog echo", serde_json::json!({"type": "object"}))
                .catalog()
                .parallel_safe()
                .detailed_help("send {text} and get it back"),
            Arc::new(EchoHandler),
        );
        ToolExecutor::new(registry, max_parallel, guard)
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let exec = executor_with(4, 10_000);
        let calls = vec![
            call("c1", "sleepy", serde_json::json!({"id": "first"})),
            call("c2", "echo", serde_json::json!({"text": "second"})),
        ];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert_eq!(results[0].call_id, "c1");
        assert_eq!(results[0].content, "first");
        assert_eq!(results[1].call_id, "c2");
        assert_eq!(results[1].content, "second");
    }

    #[tokio::test]
    async fn parallel_execution_overlaps() {
        let exec = executor_with(4, 10_000);
        let calls = vec![
            call("a", "sleepy", serde_json::json!({"id": "a"})),
            call("b", "sleepy", serde_json::json!({"id": "b"})),
            call("c", "sleepy", serde_json::json!({"id": "c"})),
        ];
        let started = Instant::now();
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        let elapsed = started.elapsed();
        assert_eq!(results.len(), 3);
        // Three 150 ms sleeps with parallelism 4 must overlap.
        assert!(
            elapsed < Duration::from_millis(400),
            "batch took {elapsed:?}, expected parallel execution"
        );
    }

    #[tokio::test]
    async fn serial_ceiling_one_runs_sequentially() {
        let exec = executor_with(1, 10_000);
        let calls = vec![
            call("a", "sleepy", serde_json::json!({"id": "a"})),
            call("b", "sleepy", serde_json::json!({"id": "b"})),
        ];
        let started = Instant::now();
        exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(started.elapsed() >= Duration::from_millis(280));
    }

    #[tokio::test]
    async fn unknown_tool_is_error_result_not_panic() {
        let exec = executor_with(1, 10_000);
        let calls = vec![call("c1", "nonexistent", serde_json::json!({}))];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("tool not found"));
        // Alternatives surfaced for the model.
        assert!(results[0].content.contains("alternative_tools"));
    }

    #[tokio::test]
    async fn oversized_payload_truncated_with_marker() {
        let exec = executor_with(1, 100);
        let calls = vec![call("c1", "big", serde_json::json!({}))];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(!results[0].is_error);
        assert!(results[0].content.ends_with(OVERFLOW_MARKER));
        assert!(results[0].content.len() < 1_000);
    }

    #[tokio::test]
    async fn structured_error_serialized_to_payload() {
        let exec = executor_with(1, 10_000);
        let calls = vec![call("c1", "flaky", serde_json::json!({}))];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(results[0].is_error);
        let v: Value = serde_json::from_str(&results[0].content).unwrap();
        assert_eq!(v["error_type"], "transient");
        assert_eq!(v["retry_suggestion"], "try again");
    }

    #[tokio::test]
    async fn cancellation_substitutes_remaining_results() {
        let exec = executor_with(1, 10_000);
        let cancel = CancelToken::new();
        cancel.cancel("stop");
        let calls = vec![
            call("c1", "echo", serde_json::json!({"text": "x"})),
            call("c2", "echo", serde_json::json!({"text": "y"})),
        ];
        let results = exec.execute_batch(&calls, &cancel).await;
        assert!(results.iter().all(|r| r.is_error));
        assert!(results.iter().all(|r| r.content == "operation cancelled by user"));
    }

    #[tokio::test]
    async fn call_tool_reaches_catalog() {
        let exec = executor_with(1, 10_000);
        let calls = vec![call(
            "c1",
            "call_tool",
            serde_json::json!({"name": "cat_echo", "arguments": {"text": "via catalog"}}),
        )];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(!results[0].is_error);
        assert_eq!(results[0].content, "via catalog");
    }

    #[tokio::test]
    async fn call_tool_missing_name_is_validation_error() {
        let exec = executor_with(1, 10_000);
        let calls = vec![call("c1", "call_tool", serde_json::json!({}))];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("validation"));
    }

    #[tokio::test]
    async fn tool_help_returns_detailed_docs() {
        let exec = executor_with(1, 10_000);
        let calls = vec![call("c1", "tool_help", serde_json::json!({"name": "cat_echo"}))];
        let results = exec.execute_batch(&calls, &CancelToken::new()).await;
        assert!(!results[0].is_error);
        assert_eq!(results[0].content, "send {text} and get it back");
    }
}
