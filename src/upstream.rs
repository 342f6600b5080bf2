//! OpenAI-chat-completions upstream adapter: encodes a neutral request,
//! opens the SSE stream and yields neutral segments.

use crate::chat::service::{
    ChatService, ChatServiceError, ChatStreamError, RawUpstreamError, SegmentStream,
};
use crate::chat::{
    ChatRequest, ChatSegment, FinishReason, NeutralContent, ReasoningEffort, Role, TokenUsage,
};
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct OpenAiUpstream {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    upstream_model: String,
}

impl OpenAiUpstream {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        upstream_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            upstream_model: upstream_model.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChatService for OpenAiUpstream {
    async fn chat_streamed(&self, request: &ChatRequest) -> Result<SegmentStream, ChatStreamError> {
        let body = encode_request(request, &self.upstream_model);
        let url = join_url(&self.base_url, "/v1/chat/completions");

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                ChatServiceError::new(FinishReason::UpstreamError, err.to_string())
            })?;

        let status = StatusCode::from_u16(resp.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RawUpstreamError { status, body }.into());
        }

        let mut events = resp.bytes_stream().eventsource();
        let (tx, rx) = mpsc::channel::<Result<ChatSegment, ChatStreamError>>(64);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                            continue;
                        };
                        for segment in decode_chunk(&value) {
                            if tx.send(Ok(segment)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(ChatServiceError::new(
                                FinishReason::UpstreamError,
                                err.to_string(),
                            )
                            .into()))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Neutral request to upstream chat-completions JSON. Upstream is always
/// asked to stream and to report usage in-band.
pub fn encode_request(request: &ChatRequest, upstream_model: &str) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.effective_system_prompt() {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for msg in &request.messages {
        match msg.role {
            Role::Tool => {
                for content in &msg.contents {
                    if let NeutralContent::ToolCallResponse {
                        tool_call_id,
                        response,
                        ..
                    } = content
                    {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": response
                        }));
                    }
                }
            }
            role => {
                let role_name = match role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                let mut obj = Map::new();
                obj.insert("role".to_string(), json!(role_name));

                let mut parts = Vec::new();
                let mut tool_calls = Vec::new();
                let mut reasoning = String::new();
                let mut reasoning_opaque = String::new();
                for content in &msg.contents {
                    match content {
                        NeutralContent::Text {
                            text,
                            cache_control,
                        } => {
                            let mut part = Map::new();
                            part.insert("type".to_string(), json!("text"));
                            part.insert("text".to_string(), json!(text));
                            if let Some(cc) = cache_control {
                                part.insert("cache_control".to_string(), cc.clone());
                            }
                            parts.push(Value::Object(part));
                        }
                        NeutralContent::Error { text } => {
                            parts.push(json!({ "type": "text", "text": text }));
                        }
                        NeutralContent::Think { text, signature } => {
                            reasoning.push_str(text);
                            if let Some(sig) = signature {
                                reasoning_opaque.push_str(sig);
                            }
                        }
                        NeutralContent::FileUrl { url } => {
                            parts.push(json!({
                                "type": "image_url",
                                "image_url": { "url": url }
                            }));
                        }
                        NeutralContent::FileBlob { data, media_type } => {
                            parts.push(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{media_type};base64,{data}") }
                            }));
                        }
                        NeutralContent::FileRef { id } => {
                            parts.push(json!({ "type": "file", "file": { "file_id": id } }));
                        }
                        NeutralContent::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": arguments }
                            }));
                        }
                        NeutralContent::ToolCallResponse { .. } => {}
                    }
                }

                // A single plain text part collapses to string content.
                let content = match parts.as_slice() {
                    [Value::Object(part)]
                        if part.len() == 2 && part.contains_key("text") =>
                    {
                        part.get("text").cloned().unwrap_or(Value::Null)
                    }
                    [] => Value::Null,
                    _ => Value::Array(parts),
                };
                if !reasoning.is_empty() {
                    obj.insert("reasoning_content".to_string(), json!(reasoning));
                }
                if !reasoning_opaque.is_empty() {
                    obj.insert("reasoning_opaque".to_string(), json!(reasoning_opaque));
                }
                if !content.is_null() {
                    obj.insert("content".to_string(), content);
                }
                if !tool_calls.is_empty() {
                    obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                messages.push(Value::Object(obj));
            }
        }
    }

    let mut body = Map::new();
    body.insert("model".to_string(), json!(upstream_model));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), json!(true));
    body.insert(
        "stream_options".to_string(),
        json!({ "include_usage": true }),
    );
    if let Some(temperature) = request.config.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max) = request.config.max_output_tokens {
        body.insert("max_completion_tokens".to_string(), json!(max));
    }
    if request.config.reasoning_effort != ReasoningEffort::Default {
        let effort = match request.config.reasoning_effort {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Default => unreachable!(),
        };
        body.insert("reasoning_effort".to_string(), json!(effort));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(seed) = request.seed {
        body.insert("seed".to_string(), json!(seed));
    }
    if let Some(user) = &request.end_user_id {
        body.insert("user".to_string(), json!(user));
    }
    if !request.tools.is_empty() {
        body.insert(
            "tools".to_string(),
            Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters
                            }
                        })
                    })
                    .collect(),
            ),
        );
    }
    Value::Object(body)
}

/// One upstream SSE chunk to neutral segments.
pub fn decode_chunk(value: &Value) -> Vec<ChatSegment> {
    let mut out = Vec::new();

    if let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    {
        if let Some(delta) = choice.get("delta") {
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                if !reasoning.is_empty() {
                    out.push(ChatSegment::from_think(reasoning));
                }
            }
            if let Some(sig) = delta.get("reasoning_opaque").and_then(|v| v.as_str()) {
                if !sig.is_empty() {
                    out.push(ChatSegment::from_signature(sig));
                }
            }
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(ChatSegment::from_text(text));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    out.push(ChatSegment::ToolCall {
                        index,
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string()),
                        name: call
                            .get("function")
                            .and_then(|v| v.get("name"))
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string()),
                        arguments: call
                            .get("function")
                            .and_then(|v| v.get("arguments"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    });
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            out.push(ChatSegment::from_finish_reason(FinishReason::from_openai(
                reason,
            )));
        }
    }

    if let Some(usage) = value.get("usage").filter(|v| v.is_object()) {
        out.push(ChatSegment::from_usage(parse_usage(usage)));
    }

    out
}

fn parse_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        reasoning_tokens: usage
            .get("completion_tokens_details")
            .and_then(|v| v.get("reasoning_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|v| v.get("cached_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    format!("{}/{}", base, path)
}
