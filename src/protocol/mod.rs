use axum::response::sse::Event;
use serde_json::Value;

pub mod anthropic;
pub mod openai;

/// One outward server-sent-events frame. The two dialects frame differently:
/// chat-completions is data-only with a `[DONE]` terminator, messages carries
/// an `event:` name per frame and no terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(Value),
    Named { event: &'static str, data: Value },
    Done,
}

impl SseFrame {
    pub fn data(value: Value) -> Self {
        SseFrame::Data(value)
    }

    pub fn named(event: &'static str, data: Value) -> Self {
        SseFrame::Named { event, data }
    }

    pub fn into_event(self) -> Event {
        match self {
            SseFrame::Data(value) => Event::default().data(value.to_string()),
            SseFrame::Named { event, data } => {
                Event::default().event(event).data(data.to_string())
            }
            SseFrame::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Flattens a content value that may be a string or an array of text parts.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr
            .iter()
            .filter_map(|item| {
                item.get("text")
                    .and_then(|t| t.as_str())
                    .or_else(|| item.as_str())
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn value_to_json_string(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        s.to_string()
    } else {
        value.to_string()
    }
}
