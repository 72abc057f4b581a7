//! The reasoning engine — drives the think→act→observe loop.
//!
//! Entry point: [`run_turn`] spawns the async loop and returns a channel of
//! [`AgentEvent`]s for the transport layer. One iteration = one LLM call;
//! tool-call blocks are dispatched as a batch, results re-enter the loop,
//! and the task signals (cancel, skip, user inserts) are polled at every
//! suspension point: before each LLM call, during streaming, before the
//! tool batch, and between iterations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use valet_domain::cancel::CancelToken;
use valet_domain::error::{Error, Result};
use valet_domain::message::{Message, MessageContent, Role, ToolCall};
use valet_domain::stream::{BoxStream, ProviderEvent, Usage};
use valet_llm::traits::ChatRequest;
use valet_sessions::{SessionKey, TranscriptLine, TranscriptWriter};

use crate::state::AppState;
use crate::task::{TaskState, TaskStatus};

/// Single acknowledgement emitted when a task is cancelled.
pub const CANCEL_ACK: &str = "Stopped.";

/// Apology emitted when every endpoint is exhausted.
const ALL_ENDPOINTS_APOLOGY: &str =
    "I couldn't reach any language model right now. Please try again in a moment.";

const CANCEL_POLL_MS: u64 = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered event stream handed to the transport layer. Events from
/// iteration N precede iteration N+1; `done` is terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "iteration_start")]
    IterationStart { iteration: u32 },

    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    #[serde(rename = "tool_call_start")]
    ToolCallStart { call_id: String, tool_name: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "done")]
    Done { usage: Usage },
}

/// Input to one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub session: SessionKey,
    pub content: MessageContent,
}

impl TurnInput {
    pub fn text(session: SessionKey, text: impl Into<String>) -> Self {
        Self {
            session,
            content: MessageContent::Text(text.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn: acquire the session's task slot, build context, loop
/// LLM calls and tool batches, stream events.
///
/// Returns the task id and the event receiver. The task slot guarantees at
/// most one non-terminal task per session; a second turn on the same
/// session waits for the first to finish.
pub fn run_turn(state: Arc<AppState>, input: TurnInput) -> (String, mpsc::Receiver<AgentEvent>) {
    let (tx, rx) = mpsc::channel::<AgentEvent>(64);
    let task_id = uuid::Uuid::new_v4().to_string();
    let spawned_id = task_id.clone();

    tokio::spawn(async move {
        let permit = state.tasks.acquire(&input.session).await;
        let task = Arc::new(TaskState::new(
            spawned_id,
            input.session.clone(),
            state.config.engine.loop_window,
        ));
        state.tasks.begin(task.clone());

        let result = run_turn_inner(&state, &input, &task, &tx).await;

        state.tasks.finish(&input.session);
        drop(permit);

        if let Err(e) = result {
            tracing::error!(error = %e, "turn failed");
            let _ = task.transition(TaskStatus::Failed);
            let _ = tx
                .send(AgentEvent::Error {
                    message: e.to_string(),
                })
                .await;
            let _ = tx
                .send(AgentEvent::Done {
                    usage: Usage::default(),
                })
                .await;
        }
    });

    (task_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: &Arc<AppState>,
    input: &TurnInput,
    task: &Arc<TaskState>,
    tx: &mpsc::Sender<AgentEvent>,
) -> Result<()> {
    let engine_cfg = state.config.engine.clone();
    let cancel = task.cancel_token().clone();

    task.transition(TaskStatus::Compiling)?;

    // ── Session bookkeeping ────────────────────────────────────────
    state.sessions.resolve_or_create(&input.session);
    let turn_index = state.sessions.next_turn_index(&input.session);

    // ── Prompt + history ───────────────────────────────────────────
    let query_text = input.content.extract_all_text();
    let (system_prompt, _report) = state.prompt.assemble(&query_text);

    let history_lines = state.transcripts.read(&input.session)?;
    let mut messages = transcript_to_messages(&history_lines);
    messages.push(Message {
        role: Role::User,
        content: input.content.clone(),
    });
    persist(state, &input.session, "user", &query_text, turn_index, None);

    let tool_defs = state.executor.registry().direct_definitions();

    let mut total_usage = Usage::default();
    let mut empty_count: u32 = 0;
    let mut llm_failures: u32 = 0;
    let mut rotated = false;
    let mut loop_note_injected = false;

    for iteration in 1..=engine_cfg.max_iterations {
        // ── Suspension point: before each LLM call ─────────────────
        if cancel.is_cancelled() {
            return finish_cancelled(state, input, task, tx, &total_usage, turn_index).await;
        }

        if matches!(task.status(), TaskStatus::Compiling | TaskStatus::Observing) {
            task.transition(TaskStatus::Reasoning)?;
        }

        let _ = tx.send(AgentEvent::IterationStart { iteration }).await;

        // Keep the window healthy before calling out.
        messages = state
            .context
            .compress_if_needed(messages, state.llm.context_window_tokens(), &cancel)
            .await?;

        let req = ChatRequest {
            messages: messages.clone(),
            system: Some(system_prompt.clone()),
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
            thinking: engine_cfg.thinking,
        };

        let stream = match state.llm.chat_stream(req, &cancel).await {
            Ok(s) => s,
            Err(Error::Cancelled(_)) => {
                return finish_cancelled(state, input, task, tx, &total_usage, turn_index).await;
            }
            Err(e) => {
                llm_failures += 1;
                tracing::warn!(error = %e, failures = llm_failures, "LLM call failed");
                if llm_failures >= 2 && !rotated {
                    // Model switching: rotate and reset no-progress counters.
                    state.llm.rotate();
                    rotated = true;
                    empty_count = 0;
                    task.reset_signatures();
                    continue;
                }
                if llm_failures >= 3 {
                    return finish_failed(
                        state,
                        input,
                        task,
                        tx,
                        &total_usage,
                        turn_index,
                        ALL_ENDPOINTS_APOLOGY,
                    )
                    .await;
                }
                continue;
            }
        };

        // ── Consume the stream ─────────────────────────────────────
        let consumed = consume_stream(stream, &cancel, tx).await;
        if consumed.cancelled {
            return finish_cancelled(state, input, task, tx, &total_usage, turn_index).await;
        }
        if let Some(message) = consumed.error {
            llm_failures += 1;
            tracing::warn!(error = %message, failures = llm_failures, "LLM stream errored");
            if llm_failures >= 2 && !rotated {
                state.llm.rotate();
                rotated = true;
                empty_count = 0;
                task.reset_signatures();
                continue;
            }
            if llm_failures >= 3 {
                return finish_failed(
                    state,
                    input,
                    task,
                    tx,
                    &total_usage,
                    turn_index,
                    ALL_ENDPOINTS_APOLOGY,
                )
                .await;
            }
            continue;
        }

        let text_buf = consumed.text;
        let pending_tool_calls = consumed.tool_calls;
        if let Some(u) = &consumed.usage {
            total_usage.absorb(u);
        }

        // ── Final answer ───────────────────────────────────────────
        if pending_tool_calls.is_empty() {
            if text_buf.trim().is_empty() {
                empty_count += 1;
                if empty_count >= engine_cfg.empty_response_limit {
                    if !rotated {
                        state.llm.rotate();
                        rotated = true;
                        empty_count = 0;
                        task.reset_signatures();
                        continue;
                    }
                    return finish_failed(
                        state,
                        input,
                        task,
                        tx,
                        &total_usage,
                        turn_index,
                        "The model returned no usable content.",
                    )
                    .await;
                }
                continue;
            }

            persist(state, &input.session, "assistant", &text_buf, turn_index, None);
            state.sessions.record_usage(
                &input.session,
                total_usage.prompt_tokens as u64,
                total_usage.completion_tokens as u64,
            );
            task.transition(TaskStatus::Completed)?;
            let _ = tx
                .send(AgentEvent::Done {
                    usage: total_usage,
                })
                .await;
            return Ok(());
        }

        // ── Tool calls ─────────────────────────────────────────────
        llm_failures = 0;
        empty_count = 0;
        task.transition(TaskStatus::Acting)?;

        // Loop detection over canonicalised signatures.
        let mut warn_loop = false;
        for tc in &pending_tool_calls {
            let count = task.record_signature(&call_signature(tc));
            if count >= engine_cfg.loop_fail_threshold {
                return finish_failed(
                    state,
                    input,
                    task,
                    tx,
                    &total_usage,
                    turn_index,
                    "Stopped: the same tool call kept repeating without progress.",
                )
                .await;
            }
            if count >= engine_cfg.loop_warn_threshold {
                warn_loop = true;
            }
        }

        // ── Suspension point: before the tool batch ────────────────
        // Cancel dominates skip.
        if cancel.is_cancelled() {
            return finish_cancelled(state, input, task, tx, &total_usage, turn_index).await;
        }
        if let Some(reason) = task.take_skip() {
            tracing::info!(reason = %reason, "skipping pending tool batch");
            messages.push(Message::assistant_tool_use(&text_buf, &pending_tool_calls));
            persist_assistant_tool_use(state, input, &text_buf, &pending_tool_calls, turn_index);
            for tc in &pending_tool_calls {
                messages.push(Message::tool_result(&tc.call_id, "user skipped this step"));
                persist_tool_result(state, input, tc, "user skipped this step", false, turn_index);
            }
            task.transition(TaskStatus::Observing)?;
            drain_inserts(state, input, task, &mut messages, turn_index);
            continue;
        }

        messages.push(Message::assistant_tool_use(&text_buf, &pending_tool_calls));
        persist_assistant_tool_use(state, input, &text_buf, &pending_tool_calls, turn_index);

        for tc in &pending_tool_calls {
            let _ = tx
                .send(AgentEvent::ToolCallStart {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                })
                .await;
        }

        // The executor polls the cancel token between calls and preserves
        // input order in the results.
        let results = state.executor.execute_batch(&pending_tool_calls, &cancel).await;

        for (tc, result) in pending_tool_calls.iter().zip(&results) {
            messages.push(Message::tool_result_tagged(
                &result.call_id,
                &result.content,
                result.is_error,
            ));
            persist_tool_result(state, input, tc, &result.content, result.is_error, turn_index);
        }

        if cancel.is_cancelled() {
            return finish_cancelled(state, input, task, tx, &total_usage, turn_index).await;
        }

        if warn_loop && !loop_note_injected {
            let note = "[system note] You are repeating the same tool call with identical \
                        arguments. Do not call it again; use the results you already have \
                        or answer the user directly.";
            messages.push(Message::user(note));
            persist(state, &input.session, "user", note, turn_index, None);
            loop_note_injected = true;
        }

        task.transition(TaskStatus::Observing)?;

        // ── Suspension point: between iterations ───────────────────
        drain_inserts(state, input, task, &mut messages, turn_index);
    }

    finish_failed(
        state,
        input,
        task,
        tx,
        &total_usage,
        turn_index,
        &format!(
            "Stopped after {} iterations without reaching an answer.",
            engine_cfg.max_iterations
        ),
    )
    .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream consumption
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConsumedStream {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    cancelled: bool,
    error: Option<String>,
}

/// Drain one LLM response stream, forwarding deltas and assembling tool
/// calls. Polls the cancel token even while no events arrive.
async fn consume_stream(
    mut stream: BoxStream<'static, Result<ProviderEvent>>,
    cancel: &CancelToken,
    tx: &mpsc::Sender<AgentEvent>,
) -> ConsumedStream {
    let mut out = ConsumedStream {
        text: String::new(),
        tool_calls: Vec::new(),
        usage: None,
        cancelled: false,
        error: None,
    };
    // call_id -> (name, args buffer), for dialects that stream arguments.
    let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();

    let mut ticker = tokio::time::interval(Duration::from_millis(CANCEL_POLL_MS));
    loop {
        let event = tokio::select! {
            ev = stream.next() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = ticker.tick() => {
                if cancel.is_cancelled() {
                    out.cancelled = true;
                    return out;
                }
                continue;
            }
        };

        match event {
            Ok(ProviderEvent::Token { text }) => {
                let _ = tx.send(AgentEvent::TextDelta { text: text.clone() }).await;
                out.text.push_str(&text);
            }
            Ok(ProviderEvent::Thinking { text }) => {
                let _ = tx.send(AgentEvent::ThinkingDelta { text }).await;
            }
            Ok(ProviderEvent::ToolCallStarted { call_id, tool_name }) => {
                tc_bufs.insert(call_id, (tool_name, String::new()));
            }
            Ok(ProviderEvent::ToolCallDelta { call_id, delta }) => {
                if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            Ok(ProviderEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            }) => {
                tc_bufs.remove(&call_id);
                out.tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            Ok(ProviderEvent::Done { usage, .. }) => {
                out.usage = usage;
            }
            Ok(ProviderEvent::Error { message }) => {
                out.error = Some(message);
                return out;
            }
            Err(e) => {
                out.error = Some(e.to_string());
                return out;
            }
        }
    }

    // Assemble calls that streamed start/delta but never a finish event.
    for (call_id, (name, args_str)) in tc_bufs.drain() {
        let arguments = if args_str.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&args_str) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        out.tool_calls.push(ToolCall {
            call_id,
            tool_name: name,
            arguments,
        });
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Graceful cancellation: exactly one user-visible acknowledgement, then a
/// terminal state.
async fn finish_cancelled(
    state: &Arc<AppState>,
    input: &TurnInput,
    task: &Arc<TaskState>,
    tx: &mpsc::Sender<AgentEvent>,
    usage: &Usage,
    turn_index: u64,
) -> Result<()> {
    let _ = task.transition(TaskStatus::Completed);
    persist(
        state,
        &input.session,
        "assistant",
        CANCEL_ACK,
        turn_index,
        Some(serde_json::json!({ "cancelled": true })),
    );
    state.sessions.record_usage(
        &input.session,
        usage.prompt_tokens as u64,
        usage.completion_tokens as u64,
    );
    let _ = tx
        .send(AgentEvent::TextDelta {
            text: CANCEL_ACK.into(),
        })
        .await;
    let _ = tx.send(AgentEvent::Done { usage: usage.clone() }).await;
    Ok(())
}

/// Terminal failure: short user-visible message, error event, done.
async fn finish_failed(
    state: &Arc<AppState>,
    input: &TurnInput,
    task: &Arc<TaskState>,
    tx: &mpsc::Sender<AgentEvent>,
    usage: &Usage,
    turn_index: u64,
    message: &str,
) -> Result<()> {
    let _ = task.transition(TaskStatus::Failed);
    persist(
        state,
        &input.session,
        "assistant",
        message,
        turn_index,
        Some(serde_json::json!({ "failed": true })),
    );
    state.sessions.record_usage(
        &input.session,
        usage.prompt_tokens as u64,
        usage.completion_tokens as u64,
    );
    let _ = tx
        .send(AgentEvent::Error {
            message: message.to_string(),
        })
        .await;
    let _ = tx.send(AgentEvent::Done { usage: usage.clone() }).await;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonical signature of a tool call for loop detection. Object keys are
/// already sorted by `serde_json`, so identical arguments stringify
/// identically.
fn call_signature(tc: &ToolCall) -> String {
    format!("{}:{}", tc.tool_name, tc.arguments)
}

fn drain_inserts(
    state: &Arc<AppState>,
    input: &TurnInput,
    task: &Arc<TaskState>,
    messages: &mut Vec<Message>,
    turn_index: u64,
) {
    for text in task.drain_user_inserts() {
        persist(state, &input.session, "user", &text, turn_index, None);
        messages.push(Message::user(text));
    }
}

fn persist(
    state: &Arc<AppState>,
    session: &SessionKey,
    role: &str,
    content: &str,
    turn_index: u64,
    metadata: Option<serde_json::Value>,
) {
    let mut line = TranscriptWriter::line(role, content);
    line.turn = Some(turn_index);
    line.metadata = metadata;
    if let Err(e) = state.transcripts.append(session, &[line]) {
        tracing::warn!(error = %e, session = %session, "failed to persist transcript line");
    }
}

fn persist_assistant_tool_use(
    state: &Arc<AppState>,
    input: &TurnInput,
    text: &str,
    tool_calls: &[ToolCall],
    turn_index: u64,
) {
    let tc_json = serde_json::to_value(tool_calls).unwrap_or(Value::Null);
    persist(
        state,
        &input.session,
        "assistant",
        text,
        turn_index,
        Some(serde_json::json!({ "tool_calls": tc_json })),
    );
}

fn persist_tool_result(
    state: &Arc<AppState>,
    input: &TurnInput,
    tc: &ToolCall,
    content: &str,
    is_error: bool,
    turn_index: u64,
) {
    persist(
        state,
        &input.session,
        "tool",
        content,
        turn_index,
        Some(serde_json::json!({
            "call_id": tc.call_id,
            "tool_name": tc.tool_name,
            "is_error": is_error,
        })),
    );
}

/// Rebuild LLM messages from transcript lines. Assistant lines carrying
/// recorded tool calls become tool-use messages again; tool lines become
/// tool results keyed by their call id.
pub fn transcript_to_messages(lines: &[TranscriptLine]) -> Vec<Message> {
    let mut messages = Vec::new();

    for line in lines {
        match line.role.as_str() {
            "user" => messages.push(Message::user(&line.content)),
            "system" => messages.push(Message::system(&line.content)),
            "assistant" => {
                let tool_calls: Vec<ToolCall> = line
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tool_calls"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if tool_calls.is_empty() {
                    messages.push(Message::assistant(&line.content));
                } else {
                    messages.push(Message::assistant_tool_use(&line.content, &tool_calls));
                }
            }
            "tool" => {
                if let Some(meta) = &line.metadata {
                    if let Some(call_id) = meta.get("call_id").and_then(|v| v.as_str()) {
                        let is_error = meta
                            .get("is_error")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        messages.push(Message::tool_result_tagged(
                            call_id,
                            &line.content,
                            is_error,
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    messages
}
