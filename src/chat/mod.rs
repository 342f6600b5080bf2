use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod segment;
pub mod service;
pub mod think_tag;
pub mod tokenizer;

pub use segment::{ChatSegment, add_merged, merge_all};

/// Provider-neutral chat content. Cache-control annotations are opaque and
/// must survive a round trip through any provider conversion unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NeutralContent {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Think {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    FileRef {
        id: String,
    },
    FileUrl {
        url: String,
    },
    FileBlob {
        data: String,
        media_type: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolCallResponse {
        tool_call_id: String,
        response: String,
        duration_ms: u32,
        is_success: bool,
    },
    Error {
        text: String,
    },
}

impl NeutralContent {
    pub fn text(text: impl Into<String>) -> Self {
        NeutralContent::Text {
            text: text.into(),
            cache_control: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One neutral chat turn. Content order is meaningful: reasoning precedes the
/// text it justifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralMessage {
    pub role: Role,
    pub contents: Vec<NeutralContent>,
}

impl NeutralMessage {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            contents: Vec::new(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::User);
        msg.contents.push(NeutralContent::text(text));
        msg
    }
}

/// System prompt as a sequence of blocks so that upstream prompt-cache
/// boundaries are preserved end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralSystemMessage {
    pub blocks: Vec<SystemBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

impl NeutralSystemMessage {
    pub fn combined_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    #[default]
    Default,
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn from_str_loose(raw: &str) -> Self {
        match raw {
            "minimal" => ReasoningEffort::Minimal,
            "low" => ReasoningEffort::Low,
            "medium" => ReasoningEffort::Medium,
            "high" => ReasoningEffort::High,
            _ => ReasoningEffort::Default,
        }
    }
}

/// Model knobs for one request. `system_prompt` is only consulted when the
/// request carries no `NeutralSystemMessage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget_tokens: Option<u64>,
    #[serde(default)]
    pub web_search_enabled: bool,
    #[serde(default)]
    pub code_execution_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Immutable per-call request in neutral form. Built once per HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<NeutralMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<NeutralSystemMessage>,
    pub config: ChatConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool>,
    #[serde(default = "default_streamed")]
    pub streamed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_user_id: Option<String>,
}

fn default_streamed() -> bool {
    true
}

impl ChatRequest {
    /// The single authoritative system prompt: the block form wins over the
    /// plain string.
    pub fn effective_system_prompt(&self) -> Option<String> {
        match &self.system {
            Some(system) => Some(system.combined_text()),
            None => self.config.system_prompt.clone(),
        }
    }
}

/// Token counts for one turn. Not necessarily final while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

/// Closed outcome classification of a chat turn. Starts at `Success`, may be
/// overwritten (last non-null wins), never reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Success,
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    FunctionCall,
    Cancelled,
    InsufficientBalance,
    InvalidModel,
    BadParameter,
    UpstreamError,
    SubscriptionExpired,
    InternalConfigIssue,
    UnknownError,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Success => "success",
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::FunctionCall => "function_call",
            FinishReason::Cancelled => "cancelled",
            FinishReason::InsufficientBalance => "insufficient_balance",
            FinishReason::InvalidModel => "invalid_model",
            FinishReason::BadParameter => "bad_parameter",
            FinishReason::UpstreamError => "upstream_error",
            FinishReason::SubscriptionExpired => "subscription_expired",
            FinishReason::InternalConfigIssue => "internal_config_issue",
            FinishReason::UnknownError => "unknown_error",
        }
    }

    /// OpenAI chat-completions `finish_reason` vocabulary.
    pub fn to_openai(&self) -> &'static str {
        match self {
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::FunctionCall => "function_call",
            FinishReason::ContentFilter => "content_filter",
            _ => "stop",
        }
    }

    /// Anthropic messages `stop_reason` vocabulary.
    pub fn to_anthropic_stop_reason(&self) -> &'static str {
        match self {
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls | FinishReason::FunctionCall => "tool_use",
            FinishReason::ContentFilter => "refusal",
            _ => "end_turn",
        }
    }

    pub fn from_openai(raw: &str) -> Option<FinishReason> {
        match raw {
            "stop" => Some(FinishReason::Stop),
            "length" => Some(FinishReason::Length),
            "tool_calls" => Some(FinishReason::ToolCalls),
            "function_call" => Some(FinishReason::FunctionCall),
            "content_filter" => Some(FinishReason::ContentFilter),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_system_message_wins_over_plain_prompt() {
        let req = ChatRequest {
            messages: vec![NeutralMessage::user_text("hi")],
            system: Some(NeutralSystemMessage {
                blocks: vec![
                    SystemBlock {
                        text: "a".into(),
                        cache_control: None,
                    },
                    SystemBlock {
                        text: "b".into(),
                        cache_control: None,
                    },
                ],
            }),
            config: ChatConfig {
                model: "m".into(),
                system_prompt: Some("ignored".into()),
                ..Default::default()
            },
            tools: Vec::new(),
            streamed: true,
            top_p: None,
            seed: None,
            end_user_id: None,
        };
        assert_eq!(req.effective_system_prompt().as_deref(), Some("a\nb"));
    }

    #[test]
    fn plain_prompt_used_when_no_block_system() {
        let req = ChatRequest {
            messages: vec![],
            system: None,
            config: ChatConfig {
                model: "m".into(),
                system_prompt: Some("plain".into()),
                ..Default::default()
            },
            tools: Vec::new(),
            streamed: false,
            top_p: None,
            seed: None,
            end_user_id: None,
        };
        assert_eq!(req.effective_system_prompt().as_deref(), Some("plain"));
    }

    #[test]
    fn cache_control_round_trips_through_serde() {
        let content = NeutralContent::Text {
            text: "cached".into(),
            cache_control: Some(serde_json::json!({ "type": "ephemeral" })),
        };
        let raw = serde_json::to_value(&content).unwrap();
        assert_eq!(raw["cache_control"]["type"], "ephemeral");
        let back: NeutralContent = serde_json::from_value(raw).unwrap();
        assert_eq!(back, content);
    }
}
