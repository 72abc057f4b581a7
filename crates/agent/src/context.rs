//! Context manager — token estimation, message grouping, and compression
//! of older turns so the message list stays inside the endpoint's context
//! window.
//!
//! Estimation is a pacing heuristic, not billing: 1 token per 4 bytes of
//! non-CJK text, 1 token per 1.5 CJK characters, plus a fixed per-message
//! overhead. Compression summarises the oldest complete message groups
//! through the compiler endpoint pool into one synthetic assistant note;
//! the most recent groups are always kept verbatim.

use std::sync::Arc;

use valet_domain::cancel::CancelToken;
use valet_domain::config::ContextConfig;
use valet_domain::error::Result;
use valet_domain::message::{ContentBlock, Message, MessageContent, Role};
use valet_domain::trace::TraceEvent;
use valet_llm::traits::{ChatClient, ChatRequest};

/// Fixed token overhead per message (role, framing).
const PER_MESSAGE_OVERHEAD: u32 = 10;
/// Flat estimate for a media block (image/video/audio/document).
const MEDIA_BLOCK_TOKENS: u32 = 1_024;

/// Prefix of the synthetic note that replaces elided groups.
pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation: ";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK unified ideographs
        | 0x3400..=0x4DBF    // extension A
        | 0xF900..=0xFAFF    // compatibility ideographs
        | 0x3040..=0x30FF    // hiragana + katakana
        | 0xAC00..=0xD7AF    // hangul syllables
    )
}

/// Estimate tokens for a piece of text. Monotone in length.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut other_bytes: u64 = 0;
    let mut cjk_chars: u64 = 0;
    for c in text.chars() {
        if is_cjk(c) {
            cjk_chars += 1;
        } else {
            other_bytes += c.len_utf8() as u64;
        }
    }
    let other_tokens = other_bytes.div_ceil(4);
    // 1 token per 1.5 CJK chars = 2 tokens per 3 chars.
    let cjk_tokens = (cjk_chars * 2).div_ceil(3);
    (other_tokens + cjk_tokens) as u32
}

fn estimate_block(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens(name) + estimate_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
        _ => MEDIA_BLOCK_TOKENS,
    }
}

/// Estimate tokens for one message, including framing overhead.
pub fn estimate_message(msg: &Message) -> u32 {
    let content = match &msg.content {
        MessageContent::Text(t) => estimate_tokens(t),
        MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block).sum(),
    };
    content + PER_MESSAGE_OVERHEAD
}

/// Estimate tokens for a message list.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message).sum()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Grouping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Group messages so each assistant message carrying tool-use blocks is
/// glued to the tool-result message(s) answering it. Groups are the atomic
/// unit of inclusion or elision; order is never changed.
pub fn group_messages(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role == Role::Assistant && msg.has_tool_use() {
            let mut group = vec![msg.clone()];
            let mut j = i + 1;
            while j < messages.len() && answers_tool_use(&messages[j]) {
                group.push(messages[j].clone());
                j += 1;
            }
            groups.push(group);
            i = j;
        } else {
            groups.push(vec![msg.clone()]);
            i += 1;
        }
    }
    groups
}

fn answers_tool_use(msg: &Message) -> bool {
    msg.role == Role::Tool || msg.has_tool_result()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ContextManager {
    config: ContextConfig,
    compiler: Arc<dyn ChatClient>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, compiler: Arc<dyn ChatClient>) -> Self {
        Self { config, compiler }
    }

    /// Tokens above which compression kicks in, for a given window.
    pub fn threshold(&self, context_window: u32) -> u32 {
        let margin = (context_window as f64 * self.config.safety_margin_ratio) as u32;
        context_window.saturating_sub(margin)
    }

    /// Compress the message list when projected tokens exceed the window
    /// threshold. Re-running on an already-compressed list whose tokens are
    /// below threshold is a no-op.
    pub async fn compress_if_needed(
        &self,
        messages: Vec<Message>,
        context_window: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let tokens_before = estimate_messages(&messages);
        if tokens_before <= self.threshold(context_window) {
            return Ok(messages);
        }

        let groups = group_messages(&messages);
        let keep = self.config.keep_recent_groups;
        if groups.len() <= keep {
            // Nothing elidable; the recent groups alone exceed the budget.
            return Ok(messages);
        }

        let split = groups.len() - keep;
        let (to_compact, to_keep) = groups.split_at(split);
        let flat_compact: Vec<&Message> = to_compact.iter().flatten().collect();

        let summary = match self.summarize(&flat_compact, cancel).await {
            Ok(s) if !s.is_empty() => s,
            Ok(_) => return Ok(messages),
            Err(e) => {
                tracing::warn!(error = %e, "compression failed, continuing with full history");
                return Ok(messages);
            }
        };

        let mut result = vec![Message::assistant(format!("{SUMMARY_PREFIX}{summary}"))];
        for group in to_keep {
            result.extend(group.iter().cloned());
        }

        let tokens_after = estimate_messages(&result);
        TraceEvent::ContextCompressed {
            groups_compacted: to_compact.len(),
            tokens_before,
            tokens_after,
        }
        .emit();

        Ok(result)
    }

    /// Summarize elided messages with a dedicated LLM call.
    async fn summarize(&self, messages: &[&Message], cancel: &CancelToken) -> Result<String> {
        let conversation = build_conversation_text(messages);
        let prompt = format!(
            "You are a conversation summarizer. Summarize the following conversation \
             history into a concise summary that preserves:\n\
             1. The current goal or plan being worked on\n\
             2. Key decisions made\n\
             3. Open questions or threads\n\
             4. Important facts learned about the user or context\n\
             5. Tool state (running processes, pending work)\n\n\
             Be concise but preserve all actionable context. Write in present tense.\n\
             Omit greetings and pleasantries. Focus on substance.\n\n\
             CONVERSATION:\n{conversation}"
        );

        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            system: None,
            tools: vec![],
            temperature: Some(0.1),
            max_tokens: Some(self.config.summary_max_tokens),
            thinking: false,
        };

        let resp = self.compiler.chat(req, cancel).await?;
        Ok(resp.content.trim().to_string())
    }
}

fn build_conversation_text(messages: &[&Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let role_label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        buf.push_str(role_label);
        buf.push_str(": ");
        let content = msg.content.extract_all_text();
        // Long tool results are clipped to keep the summary prompt manageable.
        if content.len() > 2000 {
            let head_end = floor_boundary(&content, 1000);
            let tail_start = floor_boundary(&content, content.len() - 500);
            buf.push_str(&content[..head_end]);
            buf.push_str(" [...] ");
            buf.push_str(&content[tail_start..]);
        } else {
            buf.push_str(&content);
        }
        buf.push('\n');
    }
    buf
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::message::ToolCall;
    use valet_domain::stream::{BoxStream, ProviderEvent, Usage};
    use valet_llm::traits::ChatResponse;

    // ── Estimation ─────────────────────────────────────────────────

    #[test]
    fn estimate_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimate_ascii_quarter_bytes() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abc"), 1);
    }

    #[test]
    fn cjk_text_is_more_expensive_than_ascii() {
        let ascii = estimate_tokens(&"a".repeat(100));
        let cjk = estimate_tokens(&"你".repeat(100));
        assert!(cjk > ascii, "cjk {cjk} should exceed ascii {ascii}");
        // 100 CJK chars / 1.5 ≈ 67 tokens.
        assert_eq!(cjk, 67);
    }

    #[test]
    fn estimate_is_monotone_in_length() {
        let a = "hello 世界";
        let b = "hello 世界 and more";
        assert!(estimate_tokens(b) >= estimate_tokens(a));
    }

    #[test]
    fn message_overhead_applied() {
        let msgs = vec![Message::user("Hi"), Message::assistant("Hello")];
        assert!(estimate_messages(&msgs) >= 2 * PER_MESSAGE_OVERHEAD);
    }

    // ── Grouping ───────────────────────────────────────────────────

    fn tool_use_msg(call_id: &str) -> Message {
        Message::assistant_tool_use(
            "working",
            &[ToolCall {
                call_id: call_id.into(),
                tool_name: "search".into(),
                arguments: serde_json::json!({"q": "x"}),
            }],
        )
    }

    #[test]
    fn plain_messages_group_singly() {
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        let groups = group_messages(&msgs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn tool_use_glued_to_results() {
        let msgs = vec![
            Message::user("search files"),
            tool_use_msg("t1"),
            Message::tool_result("t1", "found 3 files"),
            Message::assistant("Found 3 files for you."),
        ];
        let groups = group_messages(&msgs);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn multiple_results_stay_in_group() {
        let msgs = vec![
            tool_use_msg("t1"),
            Message::tool_result("t1", "r1"),
            Message::tool_result("t2", "r2"),
        ];
        let groups = group_messages(&msgs);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn grouping_preserves_order() {
        let msgs = vec![
            Message::user("a"),
            tool_use_msg("t1"),
            Message::tool_result("t1", "r"),
            Message::user("b"),
        ];
        let flat: Vec<Message> = group_messages(&msgs).into_iter().flatten().collect();
        assert_eq!(flat.len(), msgs.len());
        assert_eq!(flat[0].content.text(), Some("a"));
        assert_eq!(flat[3].content.text(), Some("b"));
    }

    // ── Compression ────────────────────────────────────────────────

    struct FixedSummarizer;

    #[async_trait::async_trait]
    impl ChatClient for FixedSummarizer {
        async fn chat(
            &self,
            _req: ChatRequest,
            _cancel: &CancelToken,
        ) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: "earlier discussion covered project setup".into(),
                thinking: None,
                tool_calls: vec![],
                usage: Some(Usage::default()),
                model: "summarizer".into(),
                stop_reason: Some("stop".into()),
            })
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
            _cancel: &CancelToken,
        ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
            unimplemented!("compression uses blocking chat")
        }

        fn rotate(&self) {}

        fn context_window_tokens(&self) -> u32 {
            8_000
        }
    }

    fn manager() -> ContextManager {
        ContextManager::new(ContextConfig::default(), Arc::new(FixedSummarizer))
    }

    #[tokio::test]
    async fn short_conversation_untouched() {
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        let result = manager()
            .compress_if_needed(msgs.clone(), 100_000, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn long_conversation_compressed_with_groups_intact() {
        let mut msgs = Vec::new();
        for i in 0..20 {
            msgs.push(Message::user(format!("question {i} {}", "pad ".repeat(50))));
            msgs.push(tool_use_msg(&format!("t{i}")));
            msgs.push(Message::tool_result(format!("t{i}"), "result ".repeat(50)));
            msgs.push(Message::assistant(format!("answer {i} {}", "pad ".repeat(50))));
        }

        // Pick a window small enough to force compression.
        let result = manager()
            .compress_if_needed(msgs.clone(), 2_000, &CancelToken::new())
            .await
            .unwrap();

        assert!(result.len() < msgs.len());
        // First message is the synthetic summary note.
        assert_eq!(result[0].role, Role::Assistant);
        assert!(result[0]
            .content
            .text()
            .unwrap()
            .starts_with(SUMMARY_PREFIX));

        // No tool_use survives without its matching tool_result.
        for (i, msg) in result.iter().enumerate() {
            if msg.has_tool_use() {
                assert!(
                    result[i + 1..].iter().any(|m| m.has_tool_result()),
                    "tool_use at {i} lost its result"
                );
            }
        }
    }

    #[tokio::test]
    async fn compression_is_idempotent_below_threshold() {
        let mut msgs = Vec::new();
        for i in 0..20 {
            msgs.push(Message::user(format!("q {i} {}", "pad ".repeat(50))));
            msgs.push(Message::assistant(format!("a {i} {}", "pad ".repeat(50))));
        }
        let m = manager();
        let once = m
            .compress_if_needed(msgs, 2_000, &CancelToken::new())
            .await
            .unwrap();
        let tokens_once = estimate_messages(&once);
        // The compressed list is under threshold, so a second pass no-ops.
        assert!(tokens_once <= m.threshold(2_000));
        let twice = m
            .compress_if_needed(once.clone(), 2_000, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(once.len(), twice.len());
    }

    #[tokio::test]
    async fn recent_groups_kept_verbatim() {
        let mut msgs = Vec::new();
        for i in 0..30 {
            msgs.push(Message::user(format!("q{i} {}", "pad ".repeat(30))));
            msgs.push(Message::assistant(format!("a{i} {}", "pad ".repeat(30))));
        }
        let result = manager()
            .compress_if_needed(msgs.clone(), 1_500, &CancelToken::new())
            .await
            .unwrap();

        // The last keep_recent_groups messages survive verbatim.
        let keep = ContextConfig::default().keep_recent_groups;
        let tail_expected: Vec<String> = msgs[msgs.len() - keep..]
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect();
        let tail_actual: Vec<String> = result[result.len() - keep..]
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect();
        assert_eq!(tail_expected, tail_actual);
    }
}
