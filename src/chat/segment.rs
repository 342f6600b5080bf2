use crate::chat::{FinishReason, TokenUsage};
use serde::{Deserialize, Serialize};

/// One incremental delta of a streamed chat response. A segment is not a full
/// message: zero or more segments compose one logical turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatSegment {
    Text {
        text: String,
    },
    Think {
        think: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Image {
        base64: String,
        content_type: String,
        /// Partial/preview frame of an image still being generated.
        #[serde(default)]
        preview: bool,
    },
    ImageUrl {
        url: String,
    },
    ToolCall {
        index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    ToolCallResponse {
        tool_call_id: String,
        response: String,
        duration_ms: u32,
        is_success: bool,
    },
    Usage {
        usage: TokenUsage,
    },
    Finish {
        finish_reason: Option<FinishReason>,
    },
}

impl ChatSegment {
    pub fn from_text(text: impl Into<String>) -> Self {
        ChatSegment::Text { text: text.into() }
    }

    pub fn from_think(think: impl Into<String>) -> Self {
        ChatSegment::Think {
            think: think.into(),
            signature: None,
        }
    }

    pub fn from_signature(signature: impl Into<String>) -> Self {
        ChatSegment::Think {
            think: String::new(),
            signature: Some(signature.into()),
        }
    }

    pub fn from_usage(usage: TokenUsage) -> Self {
        ChatSegment::Usage { usage }
    }

    pub fn from_finish_reason(finish_reason: Option<FinishReason>) -> Self {
        ChatSegment::Finish { finish_reason }
    }

    /// Text, image and tool-call segments count as "response" content for
    /// timing and segment-count purposes; think segments are reasoning.
    pub fn is_response_content(&self) -> bool {
        matches!(
            self,
            ChatSegment::Text { .. }
                | ChatSegment::Image { .. }
                | ChatSegment::ImageUrl { .. }
                | ChatSegment::ToolCall { .. }
        )
    }
}

/// Appends `item` to `items`, folding it into the last element when the merge
/// rule allows: Text+Text and Think+Think concatenate, ToolCall+ToolCall with
/// the same index accumulates arguments and back-fills id/name. Everything
/// else appends. Applying this to an already-merged list is a no-op shape-wise,
/// which the cache-replay path relies on.
pub fn add_merged(items: &mut Vec<ChatSegment>, item: ChatSegment) {
    let Some(last) = items.last_mut() else {
        items.push(item);
        return;
    };

    match (last, item) {
        (ChatSegment::Text { text: last_text }, ChatSegment::Text { text }) => {
            last_text.push_str(&text);
        }
        (
            ChatSegment::Think {
                think: last_think,
                signature: last_sig,
            },
            ChatSegment::Think { think, signature },
        ) => {
            last_think.push_str(&think);
            match (last_sig.as_mut(), signature) {
                (Some(existing), Some(incoming)) => existing.push_str(&incoming),
                (None, Some(incoming)) => *last_sig = Some(incoming),
                _ => {}
            }
        }
        (
            ChatSegment::ToolCall {
                index: last_index,
                id: last_id,
                name: last_name,
                arguments: last_args,
            },
            ChatSegment::ToolCall {
                index,
                id,
                name,
                arguments,
            },
        ) if *last_index == index => {
            last_args.push_str(&arguments);
            if last_id.is_none() {
                *last_id = id;
            }
            if last_name.is_none() {
                *last_name = name;
            }
        }
        (_, item) => items.push(item),
    }
}

/// Reduces a segment list to its smallest equivalent representation.
pub fn merge_all(segments: impl IntoIterator<Item = ChatSegment>) -> Vec<ChatSegment> {
    let mut out = Vec::new();
    for seg in segments {
        add_merged(&mut out, seg);
    }
    out
}

/// Concatenated answer text of a merged list, `None` when empty.
pub fn combined_text(items: &[ChatSegment]) -> Option<String> {
    let text: String = items
        .iter()
        .filter_map(|s| match s {
            ChatSegment::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// Concatenated reasoning text of a merged list, `None` when empty.
pub fn combined_think(items: &[ChatSegment]) -> Option<String> {
    let think: String = items
        .iter()
        .filter_map(|s| match s {
            ChatSegment::Think { think, .. } => Some(think.as_str()),
            _ => None,
        })
        .collect();
    if think.is_empty() { None } else { Some(think) }
}

/// A fully-accumulated tool call, reassembled from per-index fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Groups tool-call segments by index, in arrival order. Fragments for one
/// index are assumed contiguous in the stream.
pub fn full_tool_calls(items: &[ChatSegment]) -> Vec<FullToolCall> {
    let mut out: Vec<FullToolCall> = Vec::new();
    let mut current: Option<(u32, FullToolCall)> = None;
    for seg in items {
        let ChatSegment::ToolCall {
            index,
            id,
            name,
            arguments,
        } = seg
        else {
            continue;
        };
        match current.as_mut() {
            Some((cur_index, call)) if cur_index == index => {
                call.arguments.push_str(arguments);
                if call.id.is_empty() {
                    call.id = id.clone().unwrap_or_default();
                }
                if call.name.is_empty() {
                    call.name = name.clone().unwrap_or_default();
                }
            }
            _ => {
                if let Some((_, done)) = current.take() {
                    out.push(done);
                }
                current = Some((
                    *index,
                    FullToolCall {
                        id: id.clone().unwrap_or_default(),
                        name: name.clone().unwrap_or_default(),
                        arguments: arguments.clone(),
                    },
                ));
            }
        }
    }
    if let Some((_, done)) = current {
        out.push(done);
    }
    out
}
