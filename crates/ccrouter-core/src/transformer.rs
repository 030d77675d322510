//! The per-provider transformer contract and its two implementations.
//!
//! A transformer owns both directions of one provider's dialect: it
//! renders the unified request into the provider's wire body, names the
//! endpoint and auth headers, and translates the provider's unary or
//! streamed response back into the caller-facing shape.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{error, warn};

use ccrouter_protocol::gemini::response::GenerateContentResponse;
use ccrouter_protocol::sse::{SseParser, encode_data_frame, encode_done_frame};
use ccrouter_protocol::unified::UnifiedChatRequest;
use ccrouter_transform::TransformError;
use ccrouter_transform::gemini::request::build_gemini_body;
use ccrouter_transform::gemini::response::transform_response;
use ccrouter_transform::gemini::stream::GeminiStreamState;
use ccrouter_transform::openai::request as openai_request;
use ccrouter_transform::openai::stream::OpenAIStreamPassthrough;

use crate::engine::{EngineBody, EngineResponse, StreamError};

/// Marker prefix for short predictive-autocomplete requests; their final
/// flush is delayed so concurrently running sub-agent calls finish first.
pub const SUGGESTION_MODE_MARKER: &str = "[SUGGESTION MODE:";
const SUGGESTION_FLUSH_DELAY: Duration = Duration::from_millis(3000);

const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub model: String,
    pub trace_id: String,
    pub suggestion_mode: bool,
}

pub enum CallerResponse {
    Json {
        status: u16,
        body: Bytes,
    },
    Stream {
        status: u16,
        body: mpsc::Receiver<Result<Bytes, io::Error>>,
    },
}

/// Caller-stream writer with sticky-closed semantics: once closed (or
/// once the caller goes away) every further enqueue is a quiet no-op, so
/// the normal end-of-stream and an error path can both "close" safely.
pub struct StreamSender {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    closed: bool,
}

impl StreamSender {
    pub fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self { tx, closed: false }
    }

    /// Returns false once the channel is closed; callers stop producing.
    pub async fn send(&mut self, frame: Bytes) -> bool {
        if self.closed {
            return false;
        }
        if self.tx.send(Ok(frame)).await.is_err() {
            self.closed = true;
            return false;
        }
        true
    }

    pub async fn fail(&mut self, error: io::Error) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(Err(error)).await;
        self.closed = true;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
pub trait ProviderTransformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String;

    /// Header list for the upstream call; `None` values unset a header.
    fn auth_headers(&self, api_key: &str) -> Vec<(String, Option<String>)>;

    /// Unified request → provider wire body.
    fn transform_request_in(&self, request: &UnifiedChatRequest)
    -> Result<JsonValue, TransformError>;

    /// Provider response → caller-facing response.
    async fn transform_response_out(
        &self,
        response: EngineResponse,
        ctx: ResponseContext,
    ) -> CallerResponse;
}

#[derive(Debug, Default)]
pub struct GeminiTransformer;

#[async_trait]
impl ProviderTransformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String {
        let base = base_url.trim_end_matches('/');
        let operation = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{base}/{model}:{operation}")
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, Option<String>)> {
        vec![
            ("x-goog-api-key".to_string(), Some(api_key.to_string())),
            // An inherited Authorization header makes Gemini return 400.
            ("authorization".to_string(), None),
        ]
    }

    fn transform_request_in(
        &self,
        request: &UnifiedChatRequest,
    ) -> Result<JsonValue, TransformError> {
        let body = build_gemini_body(request)?;
        Ok(serde_json::to_value(body)?)
    }

    async fn transform_response_out(
        &self,
        response: EngineResponse,
        ctx: ResponseContext,
    ) -> CallerResponse {
        let status = response.status;
        match response.body {
            EngineBody::Bytes(bytes) if !response_is_success(status) => {
                CallerResponse::Json {
                    status,
                    body: bytes,
                }
            }
            EngineBody::Bytes(bytes) => {
                let translated = match serde_json::from_slice::<GenerateContentResponse>(&bytes) {
                    Ok(upstream) => {
                        let completion = transform_response(upstream, &ctx.model);
                        serde_json::to_vec(&completion)
                            .map(Bytes::from)
                            .unwrap_or(bytes)
                    }
                    Err(parse_error) => {
                        error!(
                            event = "unary_response_invalid",
                            trace_id = %ctx.trace_id,
                            error = %parse_error
                        );
                        bytes
                    }
                };
                if ctx.suggestion_mode {
                    tokio::time::sleep(SUGGESTION_FLUSH_DELAY).await;
                }
                CallerResponse::Json {
                    status,
                    body: translated,
                }
            }
            EngineBody::Stream(rx) => {
                let (tx, out) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                let sender = StreamSender::new(tx);
                tokio::spawn(pump_gemini_stream(rx, sender, ctx));
                CallerResponse::Stream { status, body: out }
            }
        }
    }
}

async fn pump_gemini_stream(
    mut rx: mpsc::Receiver<Result<Bytes, StreamError>>,
    mut sender: StreamSender,
    ctx: ResponseContext,
) {
    let mut parser = SseParser::new();
    let mut state = GeminiStreamState::new(&ctx.model);

    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                for payload in parser.push_bytes(&chunk) {
                    if !forward_gemini_payload(&payload, &mut state, &mut sender, &ctx).await {
                        return;
                    }
                }
            }
            Err(StreamError::PrematureClose(message)) => {
                warn!(
                    event = "stream_interrupted",
                    trace_id = %ctx.trace_id,
                    content_emitted = state.content_emitted(),
                    error = %message
                );
                finish_gemini_stream(&mut parser, &mut state, &mut sender, &ctx).await;
                return;
            }
            Err(StreamError::Other(message)) => {
                error!(event = "stream_failed", trace_id = %ctx.trace_id, error = %message);
                sender.fail(io::Error::other(message)).await;
                return;
            }
        }
    }

    finish_gemini_stream(&mut parser, &mut state, &mut sender, &ctx).await;
}

/// Returns false once the caller stream is gone.
async fn forward_gemini_payload(
    payload: &str,
    state: &mut GeminiStreamState,
    sender: &mut StreamSender,
    ctx: &ResponseContext,
) -> bool {
    if payload == "[DONE]" {
        return sender.send(encode_done_frame()).await;
    }
    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(chunk) => {
            for event in state.transform_chunk(chunk) {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if !sender.send(encode_data_frame(&json)).await {
                    return false;
                }
            }
            true
        }
        Err(parse_error) => {
            // Skip the offending chunk, keep the stream alive.
            error!(
                event = "stream_chunk_invalid",
                trace_id = %ctx.trace_id,
                error = %parse_error
            );
            true
        }
    }
}

async fn finish_gemini_stream(
    parser: &mut SseParser,
    state: &mut GeminiStreamState,
    sender: &mut StreamSender,
    ctx: &ResponseContext,
) {
    for payload in parser.finish() {
        if !forward_gemini_payload(&payload, state, sender, ctx).await {
            return;
        }
    }
    for event in state.finish() {
        let Ok(json) = serde_json::to_string(&event) else {
            continue;
        };
        if !sender.send(encode_data_frame(&json)).await {
            return;
        }
    }
    if ctx.suggestion_mode {
        tokio::time::sleep(SUGGESTION_FLUSH_DELAY).await;
    }
    let _ = sender.send(encode_done_frame()).await;
    sender.close();
}

#[derive(Debug, Default)]
pub struct OpenAICompatTransformer;

#[async_trait]
impl ProviderTransformer for OpenAICompatTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        let base = base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, Option<String>)> {
        vec![(
            "authorization".to_string(),
            Some(format!("Bearer {api_key}")),
        )]
    }

    fn transform_request_in(
        &self,
        request: &UnifiedChatRequest,
    ) -> Result<JsonValue, TransformError> {
        openai_request::transform_request_in(request)
    }

    async fn transform_response_out(
        &self,
        response: EngineResponse,
        ctx: ResponseContext,
    ) -> CallerResponse {
        let status = response.status;
        match response.body {
            EngineBody::Bytes(bytes) => {
                if response_is_success(status) && ctx.suggestion_mode {
                    tokio::time::sleep(SUGGESTION_FLUSH_DELAY).await;
                }
                CallerResponse::Json {
                    status,
                    body: bytes,
                }
            }
            EngineBody::Stream(rx) => {
                let (tx, out) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                let sender = StreamSender::new(tx);
                tokio::spawn(pump_openai_stream(rx, sender, ctx));
                CallerResponse::Stream { status, body: out }
            }
        }
    }
}

async fn pump_openai_stream(
    mut rx: mpsc::Receiver<Result<Bytes, StreamError>>,
    mut sender: StreamSender,
    ctx: ResponseContext,
) {
    let mut passthrough = OpenAIStreamPassthrough::new();

    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                for frame in passthrough.push_bytes(&chunk) {
                    if !sender.send(frame).await {
                        return;
                    }
                }
            }
            Err(StreamError::PrematureClose(message)) => {
                warn!(event = "stream_interrupted", trace_id = %ctx.trace_id, error = %message);
                finish_openai_stream(&mut passthrough, &mut sender, &ctx).await;
                return;
            }
            Err(StreamError::Other(message)) => {
                error!(event = "stream_failed", trace_id = %ctx.trace_id, error = %message);
                sender.fail(io::Error::other(message)).await;
                return;
            }
        }
    }

    finish_openai_stream(&mut passthrough, &mut sender, &ctx).await;
}

async fn finish_openai_stream(
    passthrough: &mut OpenAIStreamPassthrough,
    sender: &mut StreamSender,
    ctx: &ResponseContext,
) {
    for frame in passthrough.finish() {
        if !sender.send(frame).await {
            return;
        }
    }
    if !passthrough.done_forwarded() {
        if ctx.suggestion_mode {
            tokio::time::sleep(SUGGESTION_FLUSH_DELAY).await;
        }
        let _ = sender.send(encode_done_frame()).await;
    }
    sender.close();
}

fn response_is_success(status: u16) -> bool {
    (200..300).contains(&status)
}
