//! OpenAI-style adapter.
//!
//! Works with OpenAI and any endpoint following the chat completions
//! contract (DeepSeek, Kimi, vLLM, Ollama, ...). Multimodal content uses
//! the content-array dialect: `image_url` (data URL or remote),
//! `input_audio`, and `video_url`. Reasoning content (`reasoning_content`)
//! is preserved when the endpoint emits it.

use serde_json::Value;

use valet_domain::config::{EndpointConfig, NetworkConfig};
use valet_domain::error::{Error, Result};
use valet_domain::message::{
    ContentBlock, MediaSource, Message, MessageContent, Role, ToolCall, ToolDefinition,
};
use valet_domain::stream::{BoxStream, ProviderEvent, Usage};

use crate::traits::{ChatRequest, ChatResponse, WireAdapter};
use crate::util::{build_http_client, classify_status, from_reqwest, resolve_api_key};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A wire adapter for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn from_config(cfg: &EndpointConfig, network: &NetworkConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let client = build_http_client(network, cfg.timeout_secs)?;
        Ok(Self {
            name: cfg.name.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.extend(req.messages.iter().map(msg_to_openai));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn user_block_to_openai(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(serde_json::json!({
            "type": "text",
            "text": text,
        })),
        ContentBlock::Image { source } => Some(serde_json::json!({
            "type": "image_url",
            "image_url": {"url": source.to_data_url()},
        })),
        ContentBlock::Audio { source } => {
            let format = source
                .media_type()
                .and_then(|mt| mt.split('/').nth(1))
                .unwrap_or("wav");
            match source {
                MediaSource::Base64 { data, .. } => Some(serde_json::json!({
                    "type": "input_audio",
                    "input_audio": {"data": data, "format": format},
                })),
                MediaSource::Url { url, .. } => Some(serde_json::json!({
                    "type": "input_audio",
                    "input_audio": {"data": url, "format": format},
                })),
            }
        }
        ContentBlock::Video { source } => Some(serde_json::json!({
            "type": "video_url",
            "video_url": {"url": source.to_data_url()},
        })),
        // No document dialect in chat completions; encoded as a data URL
        // image_url is wrong, so degrade to a file reference line.
        ContentBlock::Document { source } => Some(serde_json::json!({
            "type": "text",
            "text": format!("[attached document: {}]", source.to_data_url()),
        })),
        _ => None,
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => match &msg.content {
            MessageContent::Text(t) => serde_json::json!({
                "role": role_to_str(msg.role),
                "content": t,
            }),
            MessageContent::Blocks(blocks) => {
                let content: Vec<Value> = blocks.iter().filter_map(user_block_to_openai).collect();
                serde_json::json!({
                    "role": role_to_str(msg.role),
                    "content": content,
                })
            }
        },
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = block
                {
                    return serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    });
                }
            }
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": ""})
        }
        MessageContent::Text(t) => serde_json::json!({
            "role": "tool",
            "tool_call_id": "",
            "content": t,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(endpoint: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Endpoint {
            endpoint: endpoint.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Endpoint {
        endpoint: endpoint.into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let thinking = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);

    let stop_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        content,
        thinking,
        tool_calls,
        usage,
        model,
        stop_reason,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_openai_sse(data: &str) -> Vec<Result<ProviderEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(ProviderEvent::Done {
            usage: None,
            stop_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    // Usage-only chunk (stream_options.include_usage).
    let choice = match choice {
        Some(c) => c,
        None => {
            if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
                return vec![Ok(ProviderEvent::Done {
                    usage: Some(usage),
                    stop_reason: None,
                })];
            }
            return Vec::new();
        }
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut events = Vec::new();

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx_str = tc
                .get("index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                .to_string();

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                events.push(Ok(ProviderEvent::ToolCallStarted {
                    call_id: id.to_string(),
                    tool_name: name.to_string(),
                }));
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if !args.is_empty() {
                    events.push(Ok(ProviderEvent::ToolCallDelta {
                        call_id: idx_str,
                        delta: args.to_string(),
                    }));
                }
            }
        }
    }

    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ProviderEvent::Thinking {
                text: text.to_string(),
            }));
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ProviderEvent::Token {
                text: text.to_string(),
            }));
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        let usage = v.get("usage").and_then(parse_openai_usage);
        events.push(Ok(ProviderEvent::Done {
            usage,
            stop_reason: Some(fr.to_string()),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl WireAdapter for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, false);

        tracing::debug!(endpoint = %self.name, url = %url, "openai chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(classify_status(&self.name, status.as_u16(), &resp_text));
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.name, &resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, true);

        tracing::debug!(endpoint = %self.name, url = %url, "openai stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(&self.name, status.as_u16(), &err_text));
        }

        Ok(crate::sse::sse_response_stream(resp, parse_openai_sse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_with_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "exec", "arguments": "{\"command\": \"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 8, "total_tokens": 28}
        });
        let resp = parse_chat_response("ep", &body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn parse_response_reasoning_content() {
        let body = serde_json::json!({
            "model": "deepseek-reasoner",
            "choices": [{
                "message": {"content": "42", "reasoning_content": "thinking hard"},
                "finish_reason": "stop"
            }]
        });
        let resp = parse_chat_response("ep", &body).unwrap();
        assert_eq!(resp.content, "42");
        assert_eq!(resp.thinking.as_deref(), Some("thinking hard"));
    }

    #[test]
    fn parse_response_no_choices_errors() {
        let body = serde_json::json!({"choices": []});
        assert!(parse_chat_response("ep", &body).is_err());
    }

    #[test]
    fn sse_done_sentinel() {
        let events = parse_openai_sse("[DONE]");
        assert!(matches!(events[0], Ok(ProviderEvent::Done { .. })));
    }

    #[test]
    fn sse_text_delta() {
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": "hel"}}]
        });
        let events = parse_openai_sse(&chunk.to_string());
        match &events[0] {
            Ok(ProviderEvent::Token { text }) => assert_eq!(text, "hel"),
            other => panic!("expected Token, got {other:?}"),
        }
    }

    #[test]
    fn sse_usage_only_chunk() {
        let chunk = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        let events = parse_openai_sse(&chunk.to_string());
        match &events[0] {
            Ok(ProviderEvent::Done { usage, .. }) => {
                assert_eq!(usage.as_ref().unwrap().total_tokens, 7);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn image_block_becomes_data_url() {
        let block = ContentBlock::Image {
            source: MediaSource::Base64 {
                media_type: "image/jpeg".into(),
                data: "abc".into(),
            },
        };
        let v = user_block_to_openai(&block).unwrap();
        assert_eq!(v["type"], "image_url");
        assert_eq!(v["image_url"]["url"], "data:image/jpeg;base64,abc");
    }

    #[test]
    fn assistant_tool_use_round_trip_shape() {
        let msg = Message::assistant_tool_use(
            "on it",
            &[ToolCall {
                call_id: "c1".into(),
                tool_name: "search".into(),
                arguments: serde_json::json!({"q": "rust"}),
            }],
        );
        let v = assistant_to_openai(&msg);
        assert_eq!(v["content"], "on it");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "search");
        // Arguments are a JSON string in the OpenAI dialect.
        assert!(v["tool_calls"][0]["function"]["arguments"].is_string());
    }
}
