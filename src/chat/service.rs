use crate::chat::{ChatRequest, ChatSegment, FinishReason};
use axum::http::StatusCode;
use futures_util::Stream;
use std::pin::Pin;

/// Lazily-produced, finite, non-restartable sequence of segments from one
/// upstream call.
pub type SegmentStream =
    Pin<Box<dyn Stream<Item = Result<ChatSegment, ChatStreamError>> + Send + 'static>>;

/// Upstream failure that should be relayed to the caller verbatim, with the
/// provider's original status code and error body.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream status {status}: {body}")]
pub struct RawUpstreamError {
    pub status: StatusCode,
    pub body: String,
}

/// Failure already mapped into the gateway's own vocabulary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ChatServiceError {
    pub finish_reason: FinishReason,
    pub message: String,
}

impl ChatServiceError {
    pub fn new(finish_reason: FinishReason, message: impl Into<String>) -> Self {
        Self {
            finish_reason,
            message: message.into(),
        }
    }

    pub fn insufficient_balance() -> Self {
        Self::new(FinishReason::InsufficientBalance, "insufficient balance")
    }

    pub fn subscription_expired() -> Self {
        Self::new(FinishReason::SubscriptionExpired, "subscription expired")
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatStreamError {
    #[error(transparent)]
    Raw(#[from] RawUpstreamError),
    #[error(transparent)]
    Service(#[from] ChatServiceError),
}

impl ChatStreamError {
    pub fn finish_reason(&self) -> FinishReason {
        match self {
            ChatStreamError::Raw(_) => FinishReason::UpstreamError,
            ChatStreamError::Service(err) => err.finish_reason,
        }
    }
}

/// Capability interface for one upstream provider. The orchestrator and the
/// protocol re-encoders depend only on this contract.
#[async_trait::async_trait]
pub trait ChatService: Send + Sync {
    /// Starts one chat call and returns the raw segment stream. Fails with
    /// `ChatStreamError::Raw` when the provider's error should be relayed
    /// unmodified and `ChatStreamError::Service` otherwise.
    async fn chat_streamed(&self, request: &ChatRequest) -> Result<SegmentStream, ChatStreamError>;
}
