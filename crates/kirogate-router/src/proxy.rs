use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;

use kirogate_common::ErrorResponse;
use kirogate_core::{
    AnthropicEmitter, AppContext, ExecuteError, OpenAiEmitter, RequestLifecycle, StreamProcessor,
    UpstreamResponse,
};
use kirogate_protocol::anthropic::{
    CountTokensRequest, MessagesRequest, MessagesResponse, ResponseBlock, Usage,
};
use kirogate_protocol::decoder::{decode_full, EventStreamDecoder};
use kirogate_protocol::models::models_response;
use kirogate_protocol::openai::ChatCompletionsRequest;
use kirogate_storage::RequestLogRecord;
use kirogate_translate::{
    chat_to_messages, render_chat_completion, BuildError, BuildOptions, ClientContext,
    TokenEstimator,
};

use crate::middleware::RequestId;

/// Reserved path heads that are framework routes, never group names.
const RESERVED_PATH_HEADS: &[&str] = &["api", "static"];

/// Cap on buffering + decoding a non-streaming upstream body.
const NONSTREAM_PARSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Anthropic,
    OpenAi,
}

impl Flavor {
    fn as_str(&self) -> &'static str {
        match self {
            Flavor::Anthropic => "anthropic",
            Flavor::OpenAi => "openai",
        }
    }
}

// ----- route entry points -----

pub async fn messages(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages(ctx, rid.0, headers, connect, String::new(), body).await
}

pub async fn messages_for_group(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(group): Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if RESERVED_PATH_HEADS.contains(&group.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    handle_messages(ctx, rid.0, headers, connect, group, body).await
}

pub async fn chat_completions(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat(ctx, rid.0, headers, connect, String::new(), body).await
}

pub async fn chat_completions_for_group(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(group): Path<String>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if RESERVED_PATH_HEADS.contains(&group.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    handle_chat(ctx, rid.0, headers, connect, group, body).await
}

pub async fn models() -> Response {
    Json(models_response()).into_response()
}

pub async fn models_for_group(Path(group): Path<String>) -> Response {
    if RESERVED_PATH_HEADS.contains(&group.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(models_response()).into_response()
}

pub async fn count_tokens(
    State(_ctx): State<Arc<AppContext>>,
    body: Bytes,
) -> Response {
    let request: CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    let estimator = TokenEstimator::new();
    let tools: Vec<_> = request
        .tools
        .iter()
        .filter(|t| !kirogate_translate::is_unsupported_tool(&t.name))
        .cloned()
        .collect();
    let input_tokens =
        estimator.estimate_input_tokens(request.system.as_ref(), &request.messages, &tools);
    Json(json!({ "input_tokens": input_tokens })).into_response()
}

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Response {
    let database = match ctx.store.health().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };
    let active_tokens = ctx.store.count_active().await.unwrap_or(0);
    let mut token_pools = serde_json::Map::new();
    if let Ok(stats) = ctx.store.group_stats().await {
        for stat in stats {
            token_pools.insert(stat.group_name, json!(stat.total));
        }
    }
    Json(json!({
        "status": "healthy",
        "uptime": ctx.uptime_secs(),
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
        "database": database,
        "active_tokens": active_tokens,
        "token_pools": token_pools,
    }))
    .into_response()
}

// ----- shared pipeline -----

fn client_context(headers: &HeaderMap, connect: ConnectInfo<SocketAddr>) -> ClientContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };
    let ConnectInfo(addr) = connect;
    let client_ip = header("X-Forwarded-For")
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string());

    ClientContext {
        client_ip,
        user_agent: header("User-Agent").unwrap_or_default(),
        conversation_id_override: header("X-Conversation-ID")
            .or_else(|| header("X-Session-ID"))
            .or_else(|| header("Session-ID")),
        continuation_id_override: header("X-Agent-Continuation-ID"),
    }
}

fn error_response(status: u16, message: &str) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse::from_status(status, message)),
    )
        .into_response()
}

fn message_id(prefix: &str) -> String {
    let stamp_format = format_description!("[year][month][day][hour][minute][second]");
    let stamp = OffsetDateTime::now_utc()
        .format(&stamp_format)
        .unwrap_or_else(|_| "0".to_string());
    format!("{prefix}{stamp}")
}

async fn handle_messages(
    ctx: Arc<AppContext>,
    rid: String,
    headers: HeaderMap,
    connect: ConnectInfo<SocketAddr>,
    group: String,
    body: Bytes,
) -> Response {
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    if let Some(resp) = validate_messages(&request) {
        return resp;
    }
    let client = client_context(&headers, connect);
    run_completion(ctx, rid, Flavor::Anthropic, group, client, request, "/v1/messages").await
}

async fn handle_chat(
    ctx: Arc<AppContext>,
    rid: String,
    headers: HeaderMap,
    connect: ConnectInfo<SocketAddr>,
    group: String,
    body: Bytes,
) -> Response {
    let chat_request: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    let request = chat_to_messages(&chat_request);
    if let Some(resp) = validate_messages(&request) {
        return resp;
    }
    let client = client_context(&headers, connect);
    run_completion(
        ctx,
        rid,
        Flavor::OpenAi,
        group,
        client,
        request,
        "/v1/chat/completions",
    )
    .await
}

/// 400 when there is nothing to send: no messages, or a final turn with no
/// text, no image, and no tool result.
fn validate_messages(request: &MessagesRequest) -> Option<Response> {
    if request.messages.is_empty() {
        return Some(error_response(400, "messages array is empty"));
    }
    let last = request.messages.last().unwrap();
    let content = &last.content;
    if content.joined_text().trim().is_empty()
        && !content.has_images()
        && !content.has_tool_results()
        && request.tools.is_empty()
    {
        return Some(error_response(400, "message content is empty"));
    }
    None
}

#[allow(clippy::too_many_arguments)]
async fn run_completion(
    ctx: Arc<AppContext>,
    rid: String,
    flavor: Flavor,
    group: String,
    client: ClientContext,
    request: MessagesRequest,
    path: &'static str,
) -> Response {
    let settings = ctx.settings.get();
    let mut lifecycle = RequestLifecycle::new(ctx.pool.clone(), &group);

    let conversation_id = ctx
        .identity
        .conversation_id(&client, settings.session_duration_min);
    let continuation_id = ctx.identity.continuation_id(&client);
    let build_opts = BuildOptions {
        conversation_id: conversation_id.clone(),
        continuation_id,
        max_tool_description_len: ctx.boot.max_tool_description_len,
    };

    let estimator = TokenEstimator::new();
    let supported_tools: Vec<_> = request
        .tools
        .iter()
        .filter(|t| !kirogate_translate::is_unsupported_tool(&t.name))
        .cloned()
        .collect();
    let input_tokens = estimator.estimate_input_tokens(
        request.system.as_ref(),
        &request.messages,
        &supported_tools,
    );

    let mut record = RequestLogRecord {
        request_id: rid.clone(),
        method: "POST".to_string(),
        path: path.to_string(),
        request_type: Some(flavor.as_str().to_string()),
        model: Some(request.model.clone()),
        stream: request.stream,
        estimated_input_tokens: input_tokens as i64,
        conversation_id: Some(conversation_id),
        group_name: lifecycle.group().to_string(),
        ..Default::default()
    };

    if let Err(err) = lifecycle.acquire().await {
        tracing::error!(error = %err, group = %lifecycle.group(), "token acquisition failed");
        record.status_code = 500;
        record.error = Some("no token available".to_string());
        ctx.accounting.record(record);
        return error_response(500, "no token available");
    }
    record.token_id = lifecycle.token().map(|t| t.id).unwrap_or(0);

    let is_stream = request.stream;
    let outcome = ctx
        .executor
        .execute(&request, &build_opts, &mut lifecycle, is_stream)
        .await;

    let upstream = match outcome {
        Ok(upstream) => upstream,
        Err(err) => {
            record.token_id = lifecycle.token().map(|t| t.id).unwrap_or(record.token_id);
            let resp = execute_error_response(&ctx, flavor, &request, err, &mut record);
            lifecycle.end(false).await;
            record.latency_ms = lifecycle.latency_ms();
            ctx.accounting.record(record);
            return resp;
        }
    };
    record.token_id = lifecycle.token().map(|t| t.id).unwrap_or(record.token_id);

    if is_stream {
        stream_response(ctx, flavor, request, upstream, lifecycle, record, input_tokens)
    } else {
        non_stream_response(ctx, flavor, request, upstream, lifecycle, record, input_tokens).await
    }
}

fn execute_error_response(
    ctx: &Arc<AppContext>,
    flavor: Flavor,
    request: &MessagesRequest,
    err: ExecuteError,
    record: &mut RequestLogRecord,
) -> Response {
    match err {
        ExecuteError::Build(BuildError::ModelNotFound {
            model,
            continuation_id,
        }) => {
            record.status_code = 400;
            record.error = Some(format!("model not found: {model}"));
            // The body carries the original model id and the continuation
            // id so the client can correlate the failed turn.
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "type": "error",
                    "error": {
                        "type": "invalid_request_error",
                        "message": format!("model not found: {model}"),
                        "code": "bad_request",
                    },
                    "model": model,
                    "agent_continuation_id": continuation_id,
                })),
            )
                .into_response()
        }
        ExecuteError::Build(build_err) => {
            record.status_code = 400;
            record.error = Some(build_err.to_string());
            error_response(400, &build_err.to_string())
        }
        ExecuteError::NoToken(pool_err) => {
            record.status_code = 500;
            record.error = Some(pool_err.to_string());
            error_response(500, "no token available")
        }
        ExecuteError::UpstreamForbidden { .. } => {
            record.status_code = 401;
            record.error = Some("upstream rejected access token".to_string());
            error_response(401, "token invalid, please retry")
        }
        ExecuteError::LengthExceeded => {
            // Mapped to a successful max_tokens termination, not an error.
            record.status_code = 200;
            max_tokens_response(flavor, request)
        }
        ExecuteError::UpstreamError { status, body } => {
            record.status_code = 500;
            record.error = Some(format!("upstream status {status}"));
            tracing::error!(status, body = %body, "terminal upstream error");
            let _ = ctx;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(
                    "api_error",
                    format!("CodeWhisperer error: {body}"),
                    "cw_error",
                )),
            )
                .into_response()
        }
        ExecuteError::Transport(message) => {
            record.status_code = 500;
            record.error = Some(message.clone());
            error_response(500, &message)
        }
        ExecuteError::Exhausted { message, .. } => {
            record.status_code = 500;
            record.error = Some(message);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(
                    "api_error",
                    "all retries exhausted",
                    "cw_error",
                )),
            )
                .into_response()
        }
    }
}

fn max_tokens_response(flavor: Flavor, request: &MessagesRequest) -> Response {
    match flavor {
        Flavor::Anthropic => Json(MessagesResponse {
            id: message_id("msg_"),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: request.model.clone(),
            stop_reason: "max_tokens".to_string(),
            stop_sequence: None,
            usage: Usage::default(),
        })
        .into_response(),
        Flavor::OpenAi => Json(render_chat_completion(
            &message_id("chatcmpl-"),
            OffsetDateTime::now_utc().unix_timestamp(),
            &request.model,
            "",
            &[],
            "max_tokens",
            0,
            0,
        ))
        .into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    ctx: Arc<AppContext>,
    flavor: Flavor,
    request: MessagesRequest,
    upstream: UpstreamResponse,
    mut lifecycle: RequestLifecycle,
    mut record: RequestLogRecord,
    input_tokens: u64,
) -> Response {
    let thinking_enabled = request.thinking.as_ref().is_some_and(|t| t.is_enabled());
    let model = request.model.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(64);

    tokio::spawn(async move {
        macro_rules! forward {
            ($frames:expr) => {
                for frame in $frames {
                    if tx.send(Ok(frame)).await.is_err() {
                        // Client went away; close out and stop reading.
                        lifecycle.end(false).await;
                        record.status_code = 200;
                        record.error = Some("client disconnected".to_string());
                        record.latency_ms = lifecycle.latency_ms();
                        ctx.accounting.record(record);
                        return;
                    }
                }
            };
        }

        match flavor {
            Flavor::Anthropic => {
                let mut processor = StreamProcessor::new(
                    AnthropicEmitter,
                    message_id("msg_"),
                    &model,
                    input_tokens,
                    thinking_enabled,
                );
                forward!(processor.initial_events());
                pump_stream(&mut processor, upstream, &tx).await;
                forward!(processor.finalize());
                finish_stream_accounting(&ctx, &mut lifecycle, &mut record, &processor).await;
            }
            Flavor::OpenAi => {
                let emitter = OpenAiEmitter::new(
                    message_id("chatcmpl-"),
                    &model,
                    OffsetDateTime::now_utc().unix_timestamp(),
                );
                let mut processor = StreamProcessor::new(
                    emitter,
                    message_id("chatcmpl-"),
                    &model,
                    input_tokens,
                    thinking_enabled,
                );
                forward!(processor.initial_events());
                pump_stream(&mut processor, upstream, &tx).await;
                forward!(processor.finalize());
                finish_stream_accounting(&ctx, &mut lifecycle, &mut record, &processor).await;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Read the upstream body, decode frames, and forward processed SSE until
/// the body ends or the client hangs up.
async fn pump_stream<E: kirogate_core::StreamEmitter>(
    processor: &mut StreamProcessor<E>,
    upstream: UpstreamResponse,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let mut decoder = EventStreamDecoder::new();
    let mut body = upstream.response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "upstream body read failed");
                break;
            }
        };
        let events = match decoder.push(&chunk) {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, "upstream frame decode failed");
                break;
            }
        };
        for event in events {
            for frame in processor.process(event) {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        }
    }
    for event in decoder.finish() {
        for frame in processor.process(event) {
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
}

async fn finish_stream_accounting<E: kirogate_core::StreamEmitter>(
    ctx: &Arc<AppContext>,
    lifecycle: &mut RequestLifecycle,
    record: &mut RequestLogRecord,
    processor: &StreamProcessor<E>,
) {
    lifecycle.end(true).await;
    record.status_code = 200;
    record.latency_ms = lifecycle.latency_ms();
    record.ttfb_ms = processor.ttfb_ms().unwrap_or(0);
    record.credit_usage = processor.credit_usage().unwrap_or(0.0);
    record.context_usage_percent = processor.context_usage_percent().unwrap_or(0.0);
    record.estimated_output_tokens = processor.output_tokens() as i64;
    ctx.accounting.record(record.clone());
}

#[allow(clippy::too_many_arguments)]
async fn non_stream_response(
    ctx: Arc<AppContext>,
    flavor: Flavor,
    request: MessagesRequest,
    upstream: UpstreamResponse,
    mut lifecycle: RequestLifecycle,
    mut record: RequestLogRecord,
    input_tokens: u64,
) -> Response {
    // The response moves out; `upstream` stays in scope so the concurrency
    // guards it carries are held until the body has been consumed.
    let response = upstream.response;

    let parsed = match tokio::time::timeout(NONSTREAM_PARSE_TIMEOUT, async {
        let body = response
            .bytes()
            .await
            .map_err(|err| err.to_string())?;
        decode_full(&body).map_err(|err| err.to_string())
    })
    .await
    {
        Err(_) => {
            lifecycle.end(false).await;
            record.status_code = 408;
            record.error = Some("response parse timeout".to_string());
            record.latency_ms = lifecycle.latency_ms();
            ctx.accounting.record(record);
            return error_response(408, "response parsing timed out");
        }
        Ok(Err(err)) => {
            lifecycle.end(false).await;
            record.status_code = 500;
            record.error = Some(err.clone());
            record.latency_ms = lifecycle.latency_ms();
            ctx.accounting.record(record);
            return error_response(500, &format!("failed to read upstream response: {err}"));
        }
        Ok(Ok(parsed)) => parsed,
    };

    let estimator = TokenEstimator::new();
    let mut output_tokens = estimator.estimate_text_tokens(&parsed.text);
    for call in &parsed.tool_calls {
        output_tokens += estimator.estimate_tool_use_tokens(&call.name, &call.arguments);
    }
    let has_content = !parsed.text.is_empty() || !parsed.tool_calls.is_empty();
    if output_tokens == 0 && has_content {
        output_tokens = 1;
    }

    let stop_reason = kirogate_core::compute_stop_reason(
        !parsed.tool_calls.is_empty(),
        parsed.stop_reason.as_deref(),
        parsed.length_exceeded,
    );

    lifecycle.end(true).await;
    record.status_code = 200;
    record.latency_ms = lifecycle.latency_ms();
    record.credit_usage = parsed.credit_usage.unwrap_or(0.0);
    record.context_usage_percent = parsed.context_usage_percent.unwrap_or(0.0);
    record.estimated_output_tokens = output_tokens as i64;
    ctx.accounting.record(record);

    match flavor {
        Flavor::Anthropic => {
            let mut content = Vec::new();
            if !parsed.text.is_empty() {
                content.push(ResponseBlock::Text {
                    text: parsed.text.clone(),
                });
            }
            for call in &parsed.tool_calls {
                content.push(ResponseBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
            Json(MessagesResponse {
                id: message_id("msg_"),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content,
                model: request.model.clone(),
                stop_reason: stop_reason.to_string(),
                stop_sequence: None,
                usage: Usage {
                    input_tokens,
                    output_tokens,
                },
            })
            .into_response()
        }
        Flavor::OpenAi => {
            let tool_calls: Vec<(String, String, serde_json::Value)> = parsed
                .tool_calls
                .iter()
                .map(|call| (call.id.clone(), call.name.clone(), call.arguments.clone()))
                .collect();
            Json(render_chat_completion(
                &message_id("chatcmpl-"),
                OffsetDateTime::now_utc().unix_timestamp(),
                &request.model,
                &parsed.text,
                &tool_calls,
                stop_reason,
                input_tokens,
                output_tokens,
            ))
            .into_response()
        }
    }
}
