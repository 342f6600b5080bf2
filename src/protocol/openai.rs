//! Chat-completions dialect: request decoding and outward re-encoding.
//!
//! Streaming uses data-only SSE frames terminated by `[DONE]`. Reasoning is
//! exposed through the widely-adopted `reasoning_content` extension field,
//! with opaque signatures in `reasoning_opaque`.

use crate::chat::segment::{combined_text, combined_think, full_tool_calls};
use crate::chat::{
    ChatConfig, ChatRequest, ChatSegment, ChatTool, FinishReason, NeutralContent, NeutralMessage,
    NeutralSystemMessage, ReasoningEffort, Role, SystemBlock, TokenUsage,
};
use crate::protocol::{SseFrame, value_to_json_string, value_to_text};
use serde_json::{Map, Value, json};

pub fn decode_request(value: &Value) -> Result<ChatRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "chat request must be object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing model".to_string())?
        .to_string();

    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    let mut messages = Vec::new();
    for raw_msg in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "missing messages".to_string())?
    {
        let msg_obj = match raw_msg.as_object() {
            Some(v) => v,
            None => continue,
        };
        let role = msg_obj
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("user");

        match role {
            "system" | "developer" => {
                let text = value_to_text(msg_obj.get("content").unwrap_or(&Value::Null));
                if !text.is_empty() {
                    system_blocks.push(SystemBlock {
                        text,
                        cache_control: None,
                    });
                }
                continue;
            }
            "tool" => {
                let mut msg = NeutralMessage::new(Role::Tool);
                msg.contents.push(NeutralContent::ToolCallResponse {
                    tool_call_id: msg_obj
                        .get("tool_call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    response: value_to_text(msg_obj.get("content").unwrap_or(&Value::Null)),
                    duration_ms: 0,
                    is_success: true,
                });
                messages.push(msg);
                continue;
            }
            _ => {}
        }

        let mut msg = NeutralMessage::new(if role == "assistant" {
            Role::Assistant
        } else {
            Role::User
        });

        if let Some(reasoning) = msg_obj.get("reasoning_content").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                msg.contents.push(NeutralContent::Think {
                    text: reasoning.to_string(),
                    signature: msg_obj
                        .get("reasoning_opaque")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                });
            }
        }

        if let Some(content) = msg_obj.get("content") {
            if let Some(s) = content.as_str() {
                if !s.is_empty() {
                    msg.contents.push(NeutralContent::text(s));
                }
            } else if let Some(arr) = content.as_array() {
                for item in arr {
                    let Some(item_obj) = item.as_object() else {
                        continue;
                    };
                    match item_obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = item_obj.get("text").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    msg.contents.push(NeutralContent::Text {
                                        text: text.to_string(),
                                        cache_control: item_obj.get("cache_control").cloned(),
                                    });
                                }
                            }
                        }
                        "image_url" => {
                            if let Some(url) = item_obj
                                .get("image_url")
                                .and_then(|v| v.get("url"))
                                .and_then(|v| v.as_str())
                            {
                                msg.contents.push(NeutralContent::FileUrl {
                                    url: url.to_string(),
                                });
                            }
                        }
                        "file" => {
                            if let Some(id) = item_obj
                                .get("file")
                                .and_then(|v| v.get("file_id"))
                                .and_then(|v| v.as_str())
                            {
                                msg.contents
                                    .push(NeutralContent::FileRef { id: id.to_string() });
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(tool_calls) = msg_obj.get("tool_calls").and_then(|v| v.as_array()) {
            for tool_call in tool_calls {
                let Some(tc_obj) = tool_call.as_object() else {
                    continue;
                };
                let id = tc_obj
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let name = tc_obj
                    .get("function")
                    .and_then(|v| v.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let arguments = tc_obj
                    .get("function")
                    .and_then(|v| v.get("arguments"))
                    .map(value_to_json_string)
                    .unwrap_or_else(|| "{}".to_string());
                if !id.is_empty() && !name.is_empty() {
                    msg.contents.push(NeutralContent::ToolCall {
                        id,
                        name,
                        arguments,
                    });
                }
            }
        }

        messages.push(msg);
    }

    let tools = obj
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_tool_definition).collect())
        .unwrap_or_default();

    let reasoning_effort = obj
        .get("reasoning_effort")
        .and_then(|v| v.as_str())
        .map(ReasoningEffort::from_str_loose)
        .unwrap_or_default();

    Ok(ChatRequest {
        messages,
        system: if system_blocks.is_empty() {
            None
        } else {
            Some(NeutralSystemMessage {
                blocks: system_blocks,
            })
        },
        config: ChatConfig {
            model,
            temperature: obj.get("temperature").and_then(|v| v.as_f64()),
            max_output_tokens: obj
                .get("max_completion_tokens")
                .or_else(|| obj.get("max_tokens"))
                .and_then(|v| v.as_u64()),
            reasoning_effort,
            ..Default::default()
        },
        tools,
        streamed: obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        seed: obj.get("seed").and_then(|v| v.as_i64()),
        end_user_id: obj
            .get("user")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn parse_tool_definition(value: &Value) -> Option<ChatTool> {
    let function = value.get("function")?;
    Some(ChatTool {
        name: function.get("name")?.as_str()?.to_string(),
        description: function
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        parameters: function.get("parameters").cloned(),
    })
}

/// Incremental re-encoder for one streamed response. All chunks in a stream
/// share one id and creation timestamp.
pub struct ChatCompletionEncoder {
    id: String,
    created: i64,
    model: String,
    usage: Option<TokenUsage>,
}

impl ChatCompletionEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            usage: None,
        }
    }

    fn chunk(&self, delta: Value) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }]
        })
    }

    /// Encodes one segment. Usage is withheld until the final chunk; finish
    /// segments produce nothing because the orchestrator owns the final
    /// reason.
    pub fn encode(&mut self, segment: &ChatSegment) -> Vec<SseFrame> {
        match segment {
            ChatSegment::Text { text } => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![SseFrame::data(self.chunk(json!({ "content": text })))]
                }
            }
            ChatSegment::Think { think, signature } => {
                let mut delta = Map::new();
                if !think.is_empty() {
                    delta.insert("reasoning_content".to_string(), json!(think));
                }
                if let Some(sig) = signature {
                    if !sig.is_empty() {
                        delta.insert("reasoning_opaque".to_string(), json!(sig));
                    }
                }
                if delta.is_empty() {
                    Vec::new()
                } else {
                    vec![SseFrame::data(self.chunk(Value::Object(delta)))]
                }
            }
            ChatSegment::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let mut call = Map::new();
                call.insert("index".to_string(), json!(index));
                if let Some(id) = id {
                    call.insert("id".to_string(), json!(id));
                    call.insert("type".to_string(), json!("function"));
                }
                let mut function = Map::new();
                if let Some(name) = name {
                    function.insert("name".to_string(), json!(name));
                }
                if !arguments.is_empty() {
                    function.insert("arguments".to_string(), json!(arguments));
                }
                call.insert("function".to_string(), Value::Object(function));
                vec![SseFrame::data(
                    self.chunk(json!({ "tool_calls": [Value::Object(call)] })),
                )]
            }
            ChatSegment::Usage { usage } => {
                self.usage = Some(*usage);
                Vec::new()
            }
            ChatSegment::Finish { .. } => Vec::new(),
            _ => Vec::new(),
        }
    }

    /// Terminal chunk with the mapped finish reason, then `[DONE]`.
    pub fn finish(&mut self, finish_reason: FinishReason, usage: Option<TokenUsage>) -> Vec<SseFrame> {
        let usage = usage.or(self.usage);
        let mut done = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": {}, "finish_reason": finish_reason.to_openai() }]
        });
        if let Some(usage) = usage {
            done["usage"] = usage_value(&usage);
        }
        vec![SseFrame::data(done), SseFrame::Done]
    }
}

/// Mid-stream error chunk in the OpenAI error envelope. The stream still
/// ends with `[DONE]` after this.
pub fn error_frame(error_type: &str, code: &str, message: &str) -> SseFrame {
    SseFrame::data(json!({
        "error": {
            "message": message,
            "type": error_type,
            "param": Value::Null,
            "code": code,
        }
    }))
}

/// Non-streamed `chat.completion` object for an already-merged segment list.
pub fn full_completion(
    model: &str,
    segments: &[ChatSegment],
    finish_reason: FinishReason,
    usage: &TokenUsage,
) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert(
        "content".to_string(),
        combined_text(segments).map(Value::String).unwrap_or(Value::Null),
    );
    if let Some(think) = combined_think(segments) {
        message.insert("reasoning_content".to_string(), json!(think));
    }
    let calls = full_tool_calls(segments);
    if !calls.is_empty() {
        message.insert(
            "tool_calls".to_string(),
            Value::Array(
                calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments }
                        })
                    })
                    .collect(),
            ),
        );
    }

    json!({
        "id": format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason.to_openai()
        }],
        "usage": usage_value(usage)
    })
}

fn usage_value(usage: &TokenUsage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.input_tokens + usage.output_tokens,
        "completion_tokens_details": { "reasoning_tokens": usage.reasoning_tokens },
        "prompt_tokens_details": { "cached_tokens": usage.cache_tokens }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_collects_system_and_messages() {
        let req = decode_request(&json!({
            "model": "gpt-test",
            "stream": true,
            "temperature": 0.5,
            "max_tokens": 100,
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello", "reasoning_content": "greeting" },
                { "role": "tool", "tool_call_id": "call_1", "content": "42" }
            ]
        }))
        .expect("valid request");
        assert_eq!(req.config.model, "gpt-test");
        assert!(req.streamed);
        assert_eq!(req.config.max_output_tokens, Some(100));
        assert_eq!(req.effective_system_prompt().as_deref(), Some("be brief"));
        assert_eq!(req.messages.len(), 3);
        assert!(matches!(
            req.messages[1].contents[0],
            NeutralContent::Think { .. }
        ));
        assert!(matches!(
            req.messages[2].contents[0],
            NeutralContent::ToolCallResponse { .. }
        ));
    }

    #[test]
    fn decode_rejects_missing_model() {
        assert!(decode_request(&json!({ "messages": [] })).is_err());
    }

    #[test]
    fn decode_reads_array_content_and_images() {
        let req = decode_request(&json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "what is this" },
                    { "type": "image_url", "image_url": { "url": "https://x/cat.png" } }
                ]
            }]
        }))
        .expect("valid request");
        assert_eq!(req.messages[0].contents.len(), 2);
        assert!(matches!(
            req.messages[0].contents[1],
            NeutralContent::FileUrl { .. }
        ));
    }

    #[test]
    fn stream_chunks_share_id_and_end_with_done() {
        let mut enc = ChatCompletionEncoder::new("m");
        let first = enc.encode(&ChatSegment::from_text("a"));
        let second = enc.encode(&ChatSegment::from_text("b"));
        let (SseFrame::Data(a), SseFrame::Data(b)) = (&first[0], &second[0]) else {
            panic!("expected data frames");
        };
        assert_eq!(a["id"], b["id"]);
        assert_eq!(a["choices"][0]["delta"]["content"], "a");

        let frames = enc.finish(FinishReason::Success, None);
        assert_eq!(frames.len(), 2);
        let SseFrame::Data(done) = &frames[0] else {
            panic!("expected data frame");
        };
        assert_eq!(done["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[1], SseFrame::Done);
    }

    #[test]
    fn usage_is_withheld_until_final_chunk() {
        let mut enc = ChatCompletionEncoder::new("m");
        let mid = enc.encode(&ChatSegment::from_usage(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        }));
        assert!(mid.is_empty());
        let frames = enc.finish(FinishReason::Length, None);
        let SseFrame::Data(done) = &frames[0] else {
            panic!("expected data frame");
        };
        assert_eq!(done["usage"]["prompt_tokens"], 10);
        assert_eq!(done["usage"]["total_tokens"], 15);
        assert_eq!(done["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn tool_call_fragments_carry_index() {
        let mut enc = ChatCompletionEncoder::new("m");
        let frames = enc.encode(&ChatSegment::ToolCall {
            index: 1,
            id: Some("call_9".into()),
            name: Some("lookup".into()),
            arguments: "{\"q\":".into(),
        });
        let SseFrame::Data(chunk) = &frames[0] else {
            panic!("expected data frame");
        };
        let call = &chunk["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 1);
        assert_eq!(call["id"], "call_9");
        assert_eq!(call["function"]["name"], "lookup");
    }

    #[test]
    fn full_completion_reassembles_merged_segments() {
        let body = full_completion(
            "m",
            &[
                ChatSegment::from_think("because"),
                ChatSegment::from_text("answer"),
                ChatSegment::ToolCall {
                    index: 0,
                    id: Some("call_1".into()),
                    name: Some("f".into()),
                    arguments: "{}".into(),
                },
            ],
            FinishReason::ToolCalls,
            &TokenUsage {
                input_tokens: 7,
                output_tokens: 3,
                ..Default::default()
            },
        );
        assert_eq!(body["choices"][0]["message"]["content"], "answer");
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "because");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "f"
        );
    }
}
