use crate::chat::{ChatRequest, ChatSegment, NeutralContent};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

const TOKENS_PER_CONVERSATION: u64 = 3;
const TOKENS_PER_MESSAGE: u64 = 4;
const TOKENS_PER_TOOL_CALL: u64 = 3;
// https://platform.openai.com/docs/guides/vision/calculating-costs
const TOKENS_PER_IMAGE: u64 = 1105;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().expect("embedded o200k_base vocabulary"))
}

/// Local token count for one text. Used wherever the provider did not report
/// usage itself; counts from here are always marked unreliable downstream.
pub fn count_tokens(text: &str) -> u64 {
    bpe().encode_ordinary(text).len() as u64
}

/// Estimates prompt tokens for a request whose provider never reported usage.
pub fn estimate_prompt_tokens(request: &ChatRequest) -> u64 {
    let mut total = TOKENS_PER_CONVERSATION;
    if let Some(system) = request.effective_system_prompt() {
        total += TOKENS_PER_MESSAGE + count_tokens(&system);
    }
    for message in &request.messages {
        total += TOKENS_PER_MESSAGE;
        for content in &message.contents {
            total += match content {
                NeutralContent::Text { text, .. }
                | NeutralContent::Error { text }
                | NeutralContent::Think { text, .. } => count_tokens(text),
                NeutralContent::FileRef { .. }
                | NeutralContent::FileUrl { .. }
                | NeutralContent::FileBlob { .. } => TOKENS_PER_IMAGE,
                NeutralContent::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    count_tokens(id)
                        + count_tokens(name)
                        + count_tokens(arguments)
                        + TOKENS_PER_TOOL_CALL
                }
                NeutralContent::ToolCallResponse { response, .. } => count_tokens(response),
            };
        }
    }
    total
}

/// Tokenizes emitted Text/Think segments: `(output_tokens, reasoning_tokens)`
/// where output includes reasoning. Other segment kinds deliberately do not
/// contribute.
pub fn estimate_output_tokens(segments: &[ChatSegment]) -> (u64, u64) {
    let mut text_tokens = 0u64;
    let mut reasoning_tokens = 0u64;
    for seg in segments {
        match seg {
            ChatSegment::Text { text } => text_tokens += count_tokens(text),
            ChatSegment::Think { think, .. } => reasoning_tokens += count_tokens(think),
            _ => {}
        }
    }
    (text_tokens + reasoning_tokens, reasoning_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatConfig, NeutralMessage};

    #[test]
    fn count_is_stable_and_nonzero() {
        let n = count_tokens("hello world");
        assert!(n > 0);
        assert_eq!(n, count_tokens("hello world"));
    }

    #[test]
    fn prompt_estimate_includes_system_and_messages() {
        let bare = ChatRequest {
            messages: vec![NeutralMessage::user_text("hi")],
            system: None,
            config: ChatConfig {
                model: "m".into(),
                ..Default::default()
            },
            tools: Vec::new(),
            streamed: true,
            top_p: None,
            seed: None,
            end_user_id: None,
        };
        let mut with_system = bare.clone();
        with_system.config.system_prompt = Some("you are terse".into());
        assert!(estimate_prompt_tokens(&with_system) > estimate_prompt_tokens(&bare));
    }

    #[test]
    fn output_estimate_counts_only_text_and_think() {
        let (out, reasoning) = estimate_output_tokens(&[
            ChatSegment::from_text("four words of text"),
            ChatSegment::from_think("some reasoning"),
            ChatSegment::ToolCall {
                index: 0,
                id: Some("x".into()),
                name: Some("f".into()),
                arguments: "{\"a\":1}".into(),
            },
        ]);
        assert!(out > reasoning);
        assert!(reasoning > 0);
    }
}
