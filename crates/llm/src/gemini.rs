//! Gemini-style adapter.
//!
//! Implements the Gemini `generateContent` / `streamGenerateContent` APIs.
//! Auth is via an API key passed as a query parameter. Media (images, audio,
//! documents, video) is encoded as `inlineData` base64 parts or `fileData`
//! URIs.

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

/// A wire adapter for the Gemini generateContent API.
pub struct GeminiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
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

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_parts: Vec<String> = Vec::new();

        if let Some(system) = &req.system {
            system_parts.push(system.clone());
        }

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => contents.push(user_to_gemini(msg)),
                Role::Assistant => contents.push(assistant_to_gemini(msg)),
                Role::Tool => contents.push(tool_result_to_gemini(msg)),
            }
        }

        let mut body = serde_json::json!({
            "contents": contents,
        });

        if !system_parts.is_empty() {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system_parts.join("\n\n")}]
            });
        }

        if !req.tools.is_empty() {
            let function_declarations: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{
                "functionDeclarations": function_declarations,
            }]);
        }

        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn media_to_gemini_part(source: &MediaSource, default_mime: &str) -> Value {
    match source {
        MediaSource::Base64 { media_type, data } => serde_json::json!({
            "inlineData": {
                "mimeType": media_type,
                "data": data,
            }
        }),
        MediaSource::Url { url, media_type } => serde_json::json!({
            "fileData": {
                "mimeType": media_type.as_deref().unwrap_or(default_mime),
                "fileUri": url,
            }
        }),
    }
}

fn content_to_gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![serde_json::json!({"text": t})],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(serde_json::json!({"text": text})),
                ContentBlock::Image { source } => Some(media_to_gemini_part(source, "image/png")),
                ContentBlock::Video { source } => Some(media_to_gemini_part(source, "video/mp4")),
                ContentBlock::Audio { source } => Some(media_to_gemini_part(source, "audio/wav")),
                ContentBlock::Document { source } => {
                    Some(media_to_gemini_part(source, "application/pdf"))
                }
                _ => None,
            })
            .collect(),
    }
}

fn user_to_gemini(msg: &Message) -> Value {
    serde_json::json!({
        "role": "user",
        "parts": content_to_gemini_parts(&msg.content),
    })
}

fn assistant_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Text(t) => parts.push(serde_json::json!({"text": t})),
        MessageContent::Blocks(blocks) => {
            for b in blocks {
                match b {
                    ContentBlock::Text { text } => {
                        parts.push(serde_json::json!({"text": text}));
                    }
                    ContentBlock::ToolUse { id: _, name, input } => {
                        parts.push(serde_json::json!({
                            "functionCall": {
                                "name": name,
                                "args": input,
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }
    serde_json::json!({
        "role": "model",
        "parts": parts,
    })
}

fn tool_result_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Blocks(blocks) => {
            for b in blocks {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = b
                {
                    // Gemini keys functionResponse on the function name, not
                    // a call id; the call id carries it through the loop.
                    parts.push(serde_json::json!({
                        "functionResponse": {
                            "name": tool_use_id,
                            "response": {
                                "content": content,
                            }
                        }
                    }));
                }
            }
        }
        MessageContent::Text(t) => {
            parts.push(serde_json::json!({
                "functionResponse": {
                    "name": "unknown",
                    "response": {
                        "content": t,
                    }
                }
            }));
        }
    }
    serde_json::json!({
        "role": "user",
        "parts": parts,
    })
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_gemini_response(endpoint: &str, body: &Value, model: &str) -> Result<ChatResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Endpoint {
            endpoint: endpoint.into(),
            message: "no candidates in response".into(),
        })?;

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());

    let mut text_content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(parts) = parts {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                text_content.push_str(text);
            }
            if let Some(fc) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    call_id: format!("call_{}", uuid::Uuid::new_v4()),
                    tool_name: fc
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments: fc
                        .get("args")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
        }
    }

    let stop_reason = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(|s| match s {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            other => other.to_lowercase(),
        });

    let usage = body.get("usageMetadata").and_then(parse_gemini_usage);

    Ok(ChatResponse {
        content: text_content,
        thinking: None,
        tool_calls,
        usage,
        model: model.to_string(),
        stop_reason,
    })
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("promptTokenCount")?.as_u64()? as u32;
    let completion = v.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let total = v
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or((prompt + completion) as u64) as u32;
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a single Gemini streaming SSE data payload.
fn parse_gemini_sse(data: &str) -> Vec<Result<ProviderEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let candidate = match v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        Some(c) => c,
        None => return events,
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(Ok(ProviderEvent::Token {
                        text: text.to_string(),
                    }));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let call_id = format!("call_{}", uuid::Uuid::new_v4());
                let tool_name = fc
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let arguments = fc
                    .get("args")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                events.push(Ok(ProviderEvent::ToolCallStarted {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                }));
                events.push(Ok(ProviderEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }));
            }
        }
    }

    if let Some(fr) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        let usage = v.get("usageMetadata").and_then(parse_gemini_usage);
        let stop_reason = match fr {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            other => other.to_lowercase(),
        };
        events.push(Ok(ProviderEvent::Done {
            usage,
            stop_reason: Some(stop_reason),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl WireAdapter for GeminiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = self.generate_url();
        let body = self.build_body(req);

        tracing::debug!(endpoint = %self.name, "gemini chat request");

        let resp = self
            .client
            .post(&url)
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
        parse_gemini_response(&self.name, &resp_json, &self.model)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        let url = self.stream_url();
        let body = self.build_body(req);

        tracing::debug!(endpoint = %self.name, "gemini stream request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(&self.name, status.as_u16(), &err_text));
        }

        Ok(crate::sse::sse_response_stream(resp, parse_gemini_sse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_text() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "hello"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        });
        let resp = parse_gemini_response("ep", &body, "gemini-2.0-flash").unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn parse_response_function_call() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "read_file", "args": {"path": "/tmp/x"}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let resp = parse_gemini_response("ep", &body, "m").unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "read_file");
        assert!(resp.tool_calls[0].call_id.starts_with("call_"));
    }

    #[test]
    fn parse_response_no_candidates_errors() {
        let body = serde_json::json!({"candidates": []});
        assert!(parse_gemini_response("ep", &body, "m").is_err());
    }

    #[test]
    fn audio_block_encodes_inline_data() {
        let content = MessageContent::Blocks(vec![ContentBlock::Audio {
            source: MediaSource::Base64 {
                media_type: "audio/wav".into(),
                data: "UklGRg==".into(),
            },
        }]);
        let parts = content_to_gemini_parts(&content);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "audio/wav");
    }

    #[test]
    fn document_url_encodes_file_data() {
        let content = MessageContent::Blocks(vec![ContentBlock::Document {
            source: MediaSource::Url {
                url: "https://example.com/a.pdf".into(),
                media_type: None,
            },
        }]);
        let parts = content_to_gemini_parts(&content);
        assert_eq!(parts[0]["fileData"]["mimeType"], "application/pdf");
        assert_eq!(parts[0]["fileData"]["fileUri"], "https://example.com/a.pdf");
    }

    #[test]
    fn sse_function_call_emits_start_and_finish() {
        let data = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "exec", "args": {}}}]}
            }]
        });
        let events = parse_gemini_sse(&data.to_string());
        assert!(matches!(events[0], Ok(ProviderEvent::ToolCallStarted { .. })));
        assert!(matches!(events[1], Ok(ProviderEvent::ToolCallFinished { .. })));
    }
}
