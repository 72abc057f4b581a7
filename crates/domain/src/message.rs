use serde::{Deserialize, Serialize};

/// Internal tool call format (protocol-agnostic).
/// Every wire adapter converts protocol-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (protocol-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Where media bytes live: inline base64 or a remote URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl MediaSource {
    pub fn media_type(&self) -> Option<&str> {
        match self {
            MediaSource::Base64 { media_type, .. } => Some(media_type.as_str()),
            MediaSource::Url { media_type, .. } => media_type.as_deref(),
        }
    }

    /// Render as a `data:` URL (OpenAI/Gemini dialects) or pass the URL through.
    pub fn to_data_url(&self) -> String {
        match self {
            MediaSource::Base64 { media_type, data } => {
                format!("data:{media_type};base64,{data}")
            }
            MediaSource::Url { url, .. } => url.clone(),
        }
    }
}

/// Closed sum of content block kinds. Wire adapters pattern-match on this;
/// unsupported kinds are soft-degraded by the LLM client before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: MediaSource },
    Video { source: MediaSource },
    Audio { source: MediaSource },
    Document { source: MediaSource },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::tool_result_tagged(tool_use_id, content, false)
    }
    pub fn tool_result_tagged(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }

    /// Assistant message carrying text (when non-empty) plus tool-use blocks.
    pub fn assistant_tool_use(text: &str, tool_calls: &[ToolCall]) -> Self {
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text: text.to_string() });
        }
        for tc in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// True when the message carries at least one tool-use block.
    pub fn has_tool_use(&self) -> bool {
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })))
    }

    /// True when the message carries at least one tool-result block.
    pub fn has_tool_result(&self) -> bool {
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })))
    }

    /// Extract tool calls from the tool-use blocks of this message.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        arguments: input.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text block, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Extract and join all text content, returning an owned String.
    ///
    /// For `Text` variant, returns the string directly.
    /// For `Blocks` variant, joins all `Text` blocks with `"\n"`.
    /// Non-text blocks are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_from_blocks_joins_with_newline() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "line one".into() },
            ContentBlock::ToolUse {
                id: "c1".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn tool_calls_extracted_in_order() {
        let msg = Message::assistant_tool_use(
            "working",
            &[
                ToolCall {
                    call_id: "a".into(),
                    tool_name: "read_file".into(),
                    arguments: serde_json::json!({"path": "/tmp/x"}),
                },
                ToolCall {
                    call_id: "b".into(),
                    tool_name: "exec".into(),
                    arguments: serde_json::json!({"command": "ls"}),
                },
            ],
        );
        assert!(msg.has_tool_use());
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "a");
        assert_eq!(calls[1].tool_name, "exec");
    }

    #[test]
    fn tool_result_message_shape() {
        let msg = Message::tool_result_tagged("tc_1", "no such file", true);
        assert_eq!(msg.role, Role::Tool);
        assert!(msg.has_tool_result());
        match &msg.content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { tool_use_id, is_error, .. } => {
                    assert_eq!(tool_use_id, "tc_1");
                    assert!(*is_error);
                }
                _ => panic!("expected ToolResult block"),
            },
            _ => panic!("expected Blocks content"),
        }
    }

    #[test]
    fn media_source_data_url() {
        let src = MediaSource::Base64 {
            media_type: "image/png".into(),
            data: "aGk=".into(),
        };
        assert_eq!(src.to_data_url(), "data:image/png;base64,aGk=");

        let url = MediaSource::Url {
            url: "https://example.com/cat.png".into(),
            media_type: None,
        };
        assert_eq!(url.to_data_url(), "https://example.com/cat.png");
    }

    #[test]
    fn content_block_serde_tagging() {
        let block = ContentBlock::ToolUse {
            id: "t1".into(),
            name: "search".into(),
            input: serde_json::json!({"q": "x"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ContentBlock::ToolUse { .. }));
    }
}
