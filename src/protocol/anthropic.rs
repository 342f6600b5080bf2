//! Messages dialect: request decoding and outward re-encoding.
//!
//! Streaming frames carry an `event:` name and follow the block lifecycle:
//! `message_start`, then per content block `content_block_start`, deltas and
//! `content_block_stop`, then `message_delta` and `message_stop`. Block
//! indices are assigned monotonically and an open block is always closed
//! before the next one starts.

use crate::chat::segment::full_tool_calls;
use crate::chat::{
    ChatConfig, ChatRequest, ChatSegment, ChatTool, FinishReason, NeutralContent, NeutralMessage,
    NeutralSystemMessage, Role, SystemBlock, TokenUsage,
};
use crate::protocol::{SseFrame, value_to_text};
use serde_json::{Value, json};

pub const ERROR_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_NOT_FOUND: &str = "not_found_error";
pub const ERROR_PERMISSION: &str = "permission_error";
pub const ERROR_API: &str = "api_error";

pub fn decode_request(value: &Value) -> Result<ChatRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "messages request must be object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "model is required".to_string())?
        .to_string();
    let max_tokens = obj
        .get("max_tokens")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "max_tokens is required".to_string())?;

    let system = match obj.get("system") {
        Some(Value::String(s)) if !s.is_empty() => Some(NeutralSystemMessage {
            blocks: vec![SystemBlock {
                text: s.clone(),
                cache_control: None,
            }],
        }),
        Some(Value::Array(arr)) => {
            let blocks: Vec<SystemBlock> = arr
                .iter()
                .filter_map(|item| {
                    let text = item.get("text")?.as_str()?.to_string();
                    Some(SystemBlock {
                        text,
                        cache_control: item.get("cache_control").cloned(),
                    })
                })
                .collect();
            if blocks.is_empty() {
                None
            } else {
                Some(NeutralSystemMessage { blocks })
            }
        }
        _ => None,
    };

    let mut messages = Vec::new();
    for raw_msg in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "messages is required".to_string())?
    {
        let Some(msg_obj) = raw_msg.as_object() else {
            continue;
        };
        let role = if msg_obj.get("role").and_then(|v| v.as_str()) == Some("assistant") {
            Role::Assistant
        } else {
            Role::User
        };
        let mut msg = NeutralMessage::new(role);
        let mut tool_results = Vec::new();

        match msg_obj.get("content") {
            Some(Value::String(s)) => {
                if !s.is_empty() {
                    msg.contents.push(NeutralContent::text(s));
                }
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    let Some(block_obj) = block.as_object() else {
                        continue;
                    };
                    match block_obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = block_obj.get("text").and_then(|v| v.as_str()) {
                                msg.contents.push(NeutralContent::Text {
                                    text: text.to_string(),
                                    cache_control: block_obj.get("cache_control").cloned(),
                                });
                            }
                        }
                        "thinking" => {
                            if let Some(text) = block_obj.get("thinking").and_then(|v| v.as_str())
                            {
                                msg.contents.push(NeutralContent::Think {
                                    text: text.to_string(),
                                    signature: block_obj
                                        .get("signature")
                                        .and_then(|v| v.as_str())
                                        .map(|s| s.to_string()),
                                });
                            }
                        }
                        "tool_use" => {
                            let id = block_obj
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            let name = block_obj
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            if !id.is_empty() && !name.is_empty() {
                                msg.contents.push(NeutralContent::ToolCall {
                                    id,
                                    name,
                                    arguments: block_obj
                                        .get("input")
                                        .map(|v| v.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                });
                            }
                        }
                        "tool_result" => {
                            tool_results.push(NeutralContent::ToolCallResponse {
                                tool_call_id: block_obj
                                    .get("tool_use_id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                response: value_to_text(
                                    block_obj.get("content").unwrap_or(&Value::Null),
                                ),
                                duration_ms: 0,
                                is_success: !block_obj
                                    .get("is_error")
                                    .and_then(|v| v.as_bool())
                                    .unwrap_or(false),
                            });
                        }
                        "image" => {
                            if let Some(source) = block_obj.get("source") {
                                match source.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                                    "base64" => {
                                        if let (Some(data), Some(media_type)) = (
                                            source.get("data").and_then(|v| v.as_str()),
                                            source.get("media_type").and_then(|v| v.as_str()),
                                        ) {
                                            msg.contents.push(NeutralContent::FileBlob {
                                                data: data.to_string(),
                                                media_type: media_type.to_string(),
                                            });
                                        }
                                    }
                                    "url" => {
                                        if let Some(url) =
                                            source.get("url").and_then(|v| v.as_str())
                                        {
                                            msg.contents.push(NeutralContent::FileUrl {
                                                url: url.to_string(),
                                            });
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        // Tool results arrive inside a user turn but are a distinct role in
        // the neutral model.
        if !tool_results.is_empty() {
            let mut tool_msg = NeutralMessage::new(Role::Tool);
            tool_msg.contents = tool_results;
            messages.push(tool_msg);
        }
        if !msg.contents.is_empty() {
            messages.push(msg);
        }
    }

    let tools: Vec<ChatTool> = obj
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tool| {
                    Some(ChatTool {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        parameters: tool.get("input_schema").cloned(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let thinking_budget_tokens = obj
        .get("thinking")
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("enabled"))
        .and_then(|t| t.get("budget_tokens"))
        .and_then(|v| v.as_u64());

    Ok(ChatRequest {
        messages,
        system,
        config: ChatConfig {
            model,
            temperature: obj.get("temperature").and_then(|v| v.as_f64()),
            max_output_tokens: Some(max_tokens),
            thinking_budget_tokens,
            ..Default::default()
        },
        tools,
        streamed: obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        seed: None,
        end_user_id: obj
            .get("metadata")
            .and_then(|v| v.get("user_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockType {
    Thinking,
    Text,
    Tool(u32),
}

/// Incremental re-encoder for one streamed response. `message_start` is
/// emitted lazily on the first frame so an early upstream failure can still
/// become a plain HTTP error.
pub struct MessagesEncoder {
    model: String,
    message_id: String,
    started: bool,
    block_index: i64,
    block_type: Option<BlockType>,
}

impl MessagesEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            block_index: -1,
            block_type: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    fn start_message(&mut self, out: &mut Vec<SseFrame>, input_tokens: u64) {
        self.started = true;
        out.push(SseFrame::named(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": input_tokens, "output_tokens": 0 }
                }
            }),
        ));
        out.push(SseFrame::named("ping", json!({ "type": "ping" })));
    }

    fn open_block(&mut self, out: &mut Vec<SseFrame>, block_type: BlockType, content_block: Value) {
        if self.block_index >= 0 {
            out.push(SseFrame::named(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.block_index }),
            ));
        }
        self.block_index += 1;
        self.block_type = Some(block_type);
        out.push(SseFrame::named(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
    }

    fn delta(&self, delta: Value) -> SseFrame {
        SseFrame::named(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    pub fn encode(&mut self, segment: &ChatSegment) -> Vec<SseFrame> {
        let mut out = Vec::new();
        match segment {
            ChatSegment::Usage { usage } => {
                // A usage frame before any content lets message_start carry
                // real input tokens.
                if !self.started {
                    self.start_message(&mut out, usage.input_tokens);
                }
            }
            ChatSegment::Finish { .. } => {}
            ChatSegment::Think { think, signature } => {
                if !self.started {
                    self.start_message(&mut out, 0);
                }
                if self.block_type != Some(BlockType::Thinking) {
                    self.open_block(
                        &mut out,
                        BlockType::Thinking,
                        json!({ "type": "thinking", "thinking": "", "signature": "" }),
                    );
                }
                if !think.is_empty() {
                    out.push(self.delta(json!({ "type": "thinking_delta", "thinking": think })));
                }
                if let Some(sig) = signature {
                    if !sig.is_empty() {
                        out.push(
                            self.delta(json!({ "type": "signature_delta", "signature": sig })),
                        );
                    }
                }
            }
            ChatSegment::Text { text } => {
                if !self.started {
                    self.start_message(&mut out, 0);
                }
                if self.block_type != Some(BlockType::Text) {
                    self.open_block(&mut out, BlockType::Text, json!({ "type": "text", "text": "" }));
                }
                if !text.is_empty() {
                    out.push(self.delta(json!({ "type": "text_delta", "text": text })));
                }
            }
            ChatSegment::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                if !self.started {
                    self.start_message(&mut out, 0);
                }
                if self.block_type != Some(BlockType::Tool(*index)) {
                    // A fragment without id/name still opens the block so
                    // every delta references a started block.
                    let start = json!({
                        "type": "tool_use",
                        "id": id.clone().unwrap_or_default(),
                        "name": name.clone().unwrap_or_default(),
                        "input": {}
                    });
                    self.open_block(&mut out, BlockType::Tool(*index), start);
                }
                if !arguments.is_empty() {
                    out.push(self.delta(
                        json!({ "type": "input_json_delta", "partial_json": arguments }),
                    ));
                }
            }
            _ => {}
        }
        out
    }

    /// Closes any open block and emits `message_delta` + `message_stop`.
    pub fn finish(&mut self, finish_reason: FinishReason, usage: &TokenUsage) -> Vec<SseFrame> {
        let mut out = Vec::new();
        if !self.started {
            self.start_message(&mut out, usage.input_tokens);
        }
        if self.block_index >= 0 {
            out.push(SseFrame::named(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.block_index }),
            ));
            self.block_type = None;
        }
        out.push(SseFrame::named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": finish_reason.to_anthropic_stop_reason(), "stop_sequence": Value::Null },
                "usage": {
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                    "cache_read_input_tokens": usage.cache_tokens,
                    "cache_creation_input_tokens": usage.cache_creation_tokens
                }
            }),
        ));
        out.push(SseFrame::named(
            "message_stop",
            json!({ "type": "message_stop" }),
        ));
        out
    }
}

/// Non-streamed `message` object for an already-merged segment list.
pub fn full_response(
    model: &str,
    message_id: &str,
    segments: &[ChatSegment],
    finish_reason: FinishReason,
    usage: &TokenUsage,
) -> Value {
    let mut content = Vec::new();
    for segment in segments {
        match segment {
            ChatSegment::Think { think, signature } => {
                content.push(json!({
                    "type": "thinking",
                    "thinking": think,
                    "signature": signature.clone().unwrap_or_default()
                }));
            }
            ChatSegment::Text { text } => {
                content.push(json!({ "type": "text", "text": text }));
            }
            _ => {}
        }
    }
    for call in full_tool_calls(segments) {
        if call.id.is_empty() || call.name.is_empty() {
            continue;
        }
        let input: Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input
        }));
    }

    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": finish_reason.to_anthropic_stop_reason(),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_read_input_tokens": usage.cache_tokens,
            "cache_creation_input_tokens": usage.cache_creation_tokens
        }
    })
}

/// Error body in the messages dialect's envelope.
pub fn error_body(error_type: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "type": error_type, "message": message }
    })
}

/// Mid-stream error frame (`event: error`).
pub fn error_frame(error_type: &str, message: &str) -> SseFrame {
    SseFrame::named("error", error_body(error_type, message))
}

/// Outcome classification to dialect error type.
pub fn error_type_for(finish_reason: FinishReason) -> &'static str {
    match finish_reason {
        FinishReason::InvalidModel => ERROR_NOT_FOUND,
        FinishReason::InsufficientBalance | FinishReason::SubscriptionExpired => ERROR_PERMISSION,
        FinishReason::BadParameter => ERROR_INVALID_REQUEST,
        _ => ERROR_API,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_event_names(frames: &[SseFrame]) -> Vec<&'static str> {
        frames
            .iter()
            .map(|f| match f {
                SseFrame::Named { event, .. } => *event,
                _ => panic!("messages frames are always named"),
            })
            .collect()
    }

    #[test]
    fn decode_requires_max_tokens() {
        let err = decode_request(&json!({ "model": "m", "messages": [] }))
            .err()
            .expect("should fail");
        assert!(err.contains("max_tokens"));
    }

    #[test]
    fn decode_reads_blocks_and_system() {
        let req = decode_request(&json!({
            "model": "claude-test",
            "max_tokens": 512,
            "stream": true,
            "system": [{ "type": "text", "text": "be kind", "cache_control": { "type": "ephemeral" } }],
            "messages": [
                { "role": "user", "content": "hello" },
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "hm", "signature": "sig" },
                    { "type": "text", "text": "hi there" },
                    { "type": "tool_use", "id": "toolu_1", "name": "f", "input": { "x": 1 } }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "ok" }
                ]}
            ]
        }))
        .expect("valid request");
        assert_eq!(req.config.max_output_tokens, Some(512));
        assert!(req.streamed);
        let system = req.system.as_ref().expect("system present");
        assert!(system.blocks[0].cache_control.is_some());
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[2].role, Role::Tool);
        assert!(matches!(
            req.messages[1].contents[2],
            NeutralContent::ToolCall { .. }
        ));
    }

    #[test]
    fn usage_first_carries_input_tokens_in_message_start() {
        let mut enc = MessagesEncoder::new("m");
        let frames = enc.encode(&ChatSegment::from_usage(TokenUsage {
            input_tokens: 42,
            ..Default::default()
        }));
        assert_eq!(collect_event_names(&frames), vec!["message_start", "ping"]);
        let SseFrame::Named { data, .. } = &frames[0] else {
            unreachable!()
        };
        assert_eq!(data["message"]["usage"]["input_tokens"], 42);
    }

    #[test]
    fn block_lifecycle_closes_before_opening_next() {
        let mut enc = MessagesEncoder::new("m");
        let mut names = Vec::new();
        names.extend(collect_event_names(&enc.encode(&ChatSegment::from_think("r"))));
        names.extend(collect_event_names(&enc.encode(&ChatSegment::from_think("r2"))));
        names.extend(collect_event_names(&enc.encode(&ChatSegment::from_text("a"))));
        names.extend(collect_event_names(&enc.finish(
            FinishReason::Success,
            &TokenUsage::default(),
        )));
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn block_indices_are_monotonic() {
        let mut enc = MessagesEncoder::new("m");
        let mut indices = Vec::new();
        for seg in [
            ChatSegment::from_think("r"),
            ChatSegment::from_text("a"),
            ChatSegment::ToolCall {
                index: 0,
                id: Some("toolu_1".into()),
                name: Some("f".into()),
                arguments: "{}".into(),
            },
        ] {
            for frame in enc.encode(&seg) {
                if let SseFrame::Named {
                    event: "content_block_start",
                    data,
                } = frame
                {
                    indices.push(data["index"].as_i64().expect("index"));
                }
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn tool_arguments_stream_as_input_json_delta() {
        let mut enc = MessagesEncoder::new("m");
        enc.encode(&ChatSegment::ToolCall {
            index: 0,
            id: Some("toolu_1".into()),
            name: Some("f".into()),
            arguments: "{\"a\":".into(),
        });
        let frames = enc.encode(&ChatSegment::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments: "1}".into(),
        });
        assert_eq!(frames.len(), 1);
        let SseFrame::Named { event, data } = &frames[0] else {
            unreachable!()
        };
        assert_eq!(*event, "content_block_delta");
        assert_eq!(data["delta"]["type"], "input_json_delta");
        assert_eq!(data["delta"]["partial_json"], "1}");
    }

    #[test]
    fn tool_fragment_without_id_still_opens_its_block() {
        let mut enc = MessagesEncoder::new("m");
        let frames = enc.encode(&ChatSegment::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments: "{\"a\":1}".into(),
        });
        assert_eq!(
            collect_event_names(&frames),
            vec!["message_start", "ping", "content_block_start", "content_block_delta"]
        );
        let SseFrame::Named { data, .. } = &frames[2] else {
            unreachable!()
        };
        assert_eq!(data["content_block"]["type"], "tool_use");
        assert_eq!(data["content_block"]["id"], "");
        assert_eq!(data["content_block"]["name"], "");
    }

    #[test]
    fn finish_maps_stop_reason_and_usage() {
        let mut enc = MessagesEncoder::new("m");
        enc.encode(&ChatSegment::from_text("a"));
        let frames = enc.finish(
            FinishReason::Length,
            &TokenUsage {
                input_tokens: 9,
                output_tokens: 4,
                cache_tokens: 2,
                ..Default::default()
            },
        );
        let SseFrame::Named { data, .. } = &frames[1] else {
            unreachable!()
        };
        assert_eq!(data["delta"]["stop_reason"], "max_tokens");
        assert_eq!(data["usage"]["output_tokens"], 4);
        assert_eq!(data["usage"]["cache_read_input_tokens"], 2);
    }

    #[test]
    fn full_response_parses_tool_input_or_falls_back() {
        let body = full_response(
            "m",
            "msg_1",
            &[
                ChatSegment::from_text("hi"),
                ChatSegment::ToolCall {
                    index: 0,
                    id: Some("toolu_1".into()),
                    name: Some("f".into()),
                    arguments: "not json".into(),
                },
            ],
            FinishReason::ToolCalls,
            &TokenUsage::default(),
        );
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["content"][1]["input"], json!({}));
    }

    #[test]
    fn error_type_mapping() {
        assert_eq!(error_type_for(FinishReason::InvalidModel), ERROR_NOT_FOUND);
        assert_eq!(
            error_type_for(FinishReason::InsufficientBalance),
            ERROR_PERMISSION
        );
        assert_eq!(error_type_for(FinishReason::BadParameter), ERROR_INVALID_REQUEST);
        assert_eq!(error_type_for(FinishReason::UnknownError), ERROR_API);
    }
}
