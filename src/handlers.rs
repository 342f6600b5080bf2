use crate::app::AppState;
use crate::chat::service::{
    ChatService, ChatServiceError, ChatStreamError, RawUpstreamError, SegmentStream,
};
use crate::chat::think_tag::ThinkTagParser;
use crate::chat::{ChatRequest, ChatSegment, FinishReason, TokenUsage};
use crate::error::AppError;
use crate::metering::{BalanceCalculator, ChatMeter, UsageRecord};
use crate::protocol::SseFrame;
use crate::protocol::anthropic::{self, MessagesEncoder};
use crate::protocol::openai::{self, ChatCompletionEncoder};
use crate::registry::ModelEntry;
use crate::upstream::OpenAiUpstream;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return AppError::unauthorized().into_response();
    }
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .model_names()
        .into_iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": "tokengate"
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let Some(user) = authenticate(&state, &headers) else {
        return AppError::unauthorized().into_response();
    };
    let request = match openai::decode_request(&body) {
        Ok(request) => request,
        Err(message) => return AppError::bad_parameter(message).into_response(),
    };
    let model_name = request.config.model.clone();
    let Some(entry) = state.registry.get(&model_name).cloned() else {
        return AppError::invalid_model(&model_name).into_response();
    };

    let (meter, stream) = match start_stream(&state, started, &user, &entry, &request).await {
        Ok(pair) => pair,
        Err(ChatStreamError::Raw(raw)) => return raw_error_response(raw),
        Err(ChatStreamError::Service(err)) => return AppError::from_service(&err).into_response(),
    };

    if request.streamed {
        let encoder = StreamEncoder::Chat(ChatCompletionEncoder::new(&model_name));
        spawn_streaming(state, user, entry, request, meter, stream, encoder)
    } else {
        let (segments, record, error) =
            collect(meter, stream, entry.think_tag_parser(), &request).await;
        settle(&state, &user, &model_name, &record);
        match error {
            Some(ChatStreamError::Raw(raw)) => raw_error_response(raw),
            Some(ChatStreamError::Service(err)) => AppError::from_service(&err).into_response(),
            None => Json(openai::full_completion(
                &model_name,
                &segments,
                record.finish_reason,
                &record.usage,
            ))
            .into_response(),
        }
    }
}

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let Some(user) = authenticate(&state, &headers) else {
        return anthropic_error_response(
            anthropic::ERROR_PERMISSION,
            "Incorrect API key provided.",
        );
    };
    let request = match anthropic::decode_request(&body) {
        Ok(request) => request,
        Err(message) => {
            return anthropic_error_response(anthropic::ERROR_INVALID_REQUEST, &message);
        }
    };
    let model_name = request.config.model.clone();
    let Some(entry) = state.registry.get(&model_name).cloned() else {
        return anthropic_error_response(
            anthropic::ERROR_NOT_FOUND,
            &format!("The model `{model_name}` does not exist or you do not have access to it."),
        );
    };

    let (meter, stream) = match start_stream(&state, started, &user, &entry, &request).await {
        Ok(pair) => pair,
        Err(ChatStreamError::Raw(raw)) => return raw_error_response(raw),
        Err(ChatStreamError::Service(err)) => {
            return anthropic_error_response(
                anthropic::error_type_for(err.finish_reason),
                &err.message,
            );
        }
    };

    if request.streamed {
        let encoder = StreamEncoder::Messages(MessagesEncoder::new(&model_name));
        spawn_streaming(state, user, entry, request, meter, stream, encoder)
    } else {
        let (segments, record, error) =
            collect(meter, stream, entry.think_tag_parser(), &request).await;
        settle(&state, &user, &model_name, &record);
        match error {
            Some(ChatStreamError::Raw(raw)) => raw_error_response(raw),
            Some(ChatStreamError::Service(err)) => anthropic_error_response(
                anthropic::error_type_for(err.finish_reason),
                &err.message,
            ),
            None => {
                let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
                Json(anthropic::full_response(
                    &model_name,
                    &message_id,
                    &segments,
                    record.finish_reason,
                    &record.usage,
                ))
                .into_response()
            }
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))?;
    state.api_keys.get(key).cloned()
}

/// Shared request start: balance snapshot, fail-fast probe, credential pick,
/// upstream call.
async fn start_stream(
    state: &AppState,
    started: Instant,
    user: &str,
    entry: &ModelEntry,
    request: &ChatRequest,
) -> Result<(ChatMeter, SegmentStream), ChatStreamError> {
    let snapshot = state
        .accounts
        .snapshot(user, &entry.name)
        .ok_or_else(ChatServiceError::insufficient_balance)?;
    if snapshot.expired {
        return Err(ChatServiceError::subscription_expired().into());
    }
    let calc = BalanceCalculator::new(snapshot.balance, snapshot.grant);
    let meter = ChatMeter::begin(started, calc, entry.price)?;

    let credential = state.registry.pick_credential(user, entry).ok_or_else(|| {
        ChatServiceError::new(
            FinishReason::InternalConfigIssue,
            format!("model {} has no usable credential", entry.name),
        )
    })?;
    let upstream = OpenAiUpstream::new(
        state.http.clone(),
        &credential.base_url,
        &credential.api_key,
        &entry.upstream_model,
    );
    let stream = upstream.chat_streamed(request).await?;
    Ok((meter, stream))
}

enum StreamEncoder {
    Chat(ChatCompletionEncoder),
    Messages(MessagesEncoder),
}

impl StreamEncoder {
    fn encode(&mut self, segment: &ChatSegment) -> Vec<SseFrame> {
        match self {
            StreamEncoder::Chat(enc) => enc.encode(segment),
            StreamEncoder::Messages(enc) => enc.encode(segment),
        }
    }

    fn finish(&mut self, finish_reason: FinishReason, usage: &TokenUsage) -> Vec<SseFrame> {
        match self {
            StreamEncoder::Chat(enc) => enc.finish(finish_reason, Some(*usage)),
            StreamEncoder::Messages(enc) => enc.finish(finish_reason, usage),
        }
    }

    /// Mid-stream error frames. Raw upstream bodies are relayed verbatim.
    fn error_events(&self, error: &ChatStreamError) -> Vec<Event> {
        match (self, error) {
            (StreamEncoder::Chat(_), ChatStreamError::Raw(raw)) => vec![
                Event::default().data(raw.body.clone()),
                Event::default().data("[DONE]"),
            ],
            (StreamEncoder::Chat(_), ChatStreamError::Service(err)) => vec![
                openai::error_frame(
                    "invalid_request_error",
                    err.finish_reason.as_str(),
                    &err.message,
                )
                .into_event(),
                Event::default().data("[DONE]"),
            ],
            (StreamEncoder::Messages(_), ChatStreamError::Raw(raw)) => {
                vec![Event::default().event("error").data(raw.body.clone())]
            }
            (StreamEncoder::Messages(_), ChatStreamError::Service(err)) => vec![
                anthropic::error_frame(anthropic::error_type_for(err.finish_reason), &err.message)
                    .into_event(),
            ],
        }
    }
}

/// Streaming response: the spawned task owns both the drive loop and the
/// billing path, so a client disconnect (send error) can never skip
/// finalize.
fn spawn_streaming(
    state: AppState,
    user: String,
    entry: ModelEntry,
    request: ChatRequest,
    meter: ChatMeter,
    stream: SegmentStream,
    encoder: StreamEncoder,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        drive_streaming(state, user, entry, request, meter, stream, encoder, tx).await;
    });
    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).into_response()
}

#[allow(clippy::too_many_arguments)]
async fn drive_streaming(
    state: AppState,
    user: String,
    entry: ModelEntry,
    request: ChatRequest,
    mut meter: ChatMeter,
    mut stream: SegmentStream,
    mut encoder: StreamEncoder,
    tx: mpsc::Sender<Event>,
) {
    let mut parser = entry.think_tag_parser();
    let mut error: Option<ChatStreamError> = None;
    let mut client_gone = false;

    'upstream: while let Some(item) = stream.next().await {
        match item {
            Ok(raw_segment) => {
                let segments = match parser.as_mut() {
                    Some(p) => p.filter_segment(raw_segment),
                    None => vec![raw_segment],
                };
                for segment in segments {
                    if let Err(err) = meter.observe(&segment) {
                        error = Some(err.into());
                        break 'upstream;
                    }
                    for frame in encoder.encode(&segment) {
                        if tx.send(frame.into_event()).await.is_err() {
                            meter.set_finish_reason(FinishReason::Cancelled);
                            client_gone = true;
                            break 'upstream;
                        }
                    }
                }
            }
            Err(err) => {
                meter.set_finish_reason(err.finish_reason());
                error = Some(err);
                break;
            }
        }
    }

    if error.is_none() && !client_gone {
        if let Some(p) = parser.as_mut() {
            'tail: for segment in p.finish() {
                if let Err(err) = meter.observe(&segment) {
                    error = Some(err.into());
                    break;
                }
                for frame in encoder.encode(&segment) {
                    if tx.send(frame.into_event()).await.is_err() {
                        meter.set_finish_reason(FinishReason::Cancelled);
                        client_gone = true;
                        break 'tail;
                    }
                }
            }
        }
    }

    meter.mark_stream_end();
    let record = meter.finalize(&request);

    if !client_gone {
        if let Some(err) = &error {
            for event in encoder.error_events(err) {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        } else {
            for frame in encoder.finish(record.finish_reason, &record.usage) {
                if tx.send(frame.into_event()).await.is_err() {
                    break;
                }
            }
        }
    }

    settle(&state, &user, &entry.name, &record);
}

/// Non-streaming drive: the same metering loop without an outward channel.
async fn collect(
    mut meter: ChatMeter,
    mut stream: SegmentStream,
    mut parser: Option<ThinkTagParser>,
    request: &ChatRequest,
) -> (Vec<ChatSegment>, UsageRecord, Option<ChatStreamError>) {
    let mut error: Option<ChatStreamError> = None;

    'upstream: while let Some(item) = stream.next().await {
        match item {
            Ok(raw_segment) => {
                let segments = match parser.as_mut() {
                    Some(p) => p.filter_segment(raw_segment),
                    None => vec![raw_segment],
                };
                for segment in segments {
                    if let Err(err) = meter.observe(&segment) {
                        error = Some(err.into());
                        break 'upstream;
                    }
                }
            }
            Err(err) => {
                meter.set_finish_reason(err.finish_reason());
                error = Some(err);
                break;
            }
        }
    }

    if error.is_none() {
        if let Some(p) = parser.as_mut() {
            for segment in p.finish() {
                if let Err(err) = meter.observe(&segment) {
                    error = Some(err.into());
                    break;
                }
            }
        }
    }

    meter.mark_stream_end();
    let segments = meter.snapshot().to_vec();
    let record = meter.finalize(request);
    (segments, record, error)
}

/// The single billing write plus the per-request log line.
fn settle(state: &AppState, user: &str, model: &str, record: &UsageRecord) {
    state.accounts.debit(user, model, &record.cost);
    tracing::info!(
        user,
        model,
        finish_reason = record.finish_reason.as_str(),
        input_tokens = record.usage.input_tokens,
        output_tokens = record.usage.output_tokens,
        reasoning_tokens = record.usage.reasoning_tokens,
        reliable = record.is_reliable,
        segments = record.segment_count,
        cost = %record.cost.total_cost(),
        first_response_ms = record.first_response_ms,
        total_ms = record.total_ms,
        "chat finished"
    );
}

fn raw_error_response(raw: RawUpstreamError) -> Response {
    (
        raw.status,
        [(header::CONTENT_TYPE, "application/json")],
        raw.body,
    )
        .into_response()
}

/// The messages dialect answers every pre-stream failure with its own
/// envelope and a 400.
fn anthropic_error_response(error_type: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(anthropic::error_body(error_type, message)),
    )
        .into_response()
}
