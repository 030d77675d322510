//! The upstream HTTP request engine: one logical call with per-attempt
//! header timeouts, caller cancellation, and retries whose backoff is
//! derived from provider error payloads.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use wreq::{Client, Proxy};

use crate::cancel::CancelSignal;

pub const MAX_RETRIES: u32 = 2;
pub const INITIAL_BACKOFF_MS: u64 = 1000;
/// Per-attempt deadline to first response headers. Body streaming is
/// unconstrained once headers arrive.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Reset,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request canceled by caller")]
    Canceled,
    #[error("upstream transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("failed to build upstream client: {0}")]
    Client(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream closed the stream early: {0}")]
    PrematureClose(String),
    #[error("upstream stream failed: {0}")]
    Other(String),
}

#[derive(Debug)]
pub enum EngineBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Result<Bytes, StreamError>>),
}

#[derive(Debug)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: EngineBody,
}

impl EngineResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Per-call configuration. A `None` header value suppresses that header
/// entirely (used to unset `Authorization` for key-in-header upstreams).
#[derive(Debug, Default)]
pub struct SendConfig {
    pub headers: Vec<(String, Option<String>)>,
    pub https_proxy: Option<String>,
    pub cancellation: Option<CancelSignal>,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub provider: String,
    pub model: String,
}

#[derive(Default)]
pub struct HttpEngine {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl HttpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn send(
        &self,
        url: &str,
        body: Bytes,
        config: &SendConfig,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, EngineError> {
        let client = self.client_for_proxy(config.https_proxy.clone())?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Some(signal) = &config.cancellation
                && signal.is_cancelled()
            {
                return Err(EngineError::Canceled);
            }

            info!(
                event = "upstream_request",
                trace_id = %ctx.trace_id,
                provider = %ctx.provider,
                model = %ctx.model,
                attempt = attempt,
                is_stream = config.stream
            );

            let response = match self.attempt(&client, url, body.clone(), config).await {
                Ok(response) => response,
                Err(EngineError::Transport { kind, message }) => {
                    // Streams cannot be replayed safely.
                    if config.stream || attempt > MAX_RETRIES {
                        warn!(
                            event = "upstream_failed",
                            trace_id = %ctx.trace_id,
                            provider = %ctx.provider,
                            attempt = attempt,
                            kind = ?kind,
                            error = %message
                        );
                        return Err(EngineError::Transport { kind, message });
                    }
                    let delay = jittered_delay(exponential_base_ms(attempt));
                    warn!(
                        event = "upstream_retry",
                        trace_id = %ctx.trace_id,
                        provider = %ctx.provider,
                        attempt = attempt,
                        kind = ?kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %message
                    );
                    sleep_or_cancel(delay, config.cancellation.clone()).await?;
                    continue;
                }
                Err(other) => return Err(other),
            };

            let status = response.status().as_u16();
            let retryable = status == 429 || (500..=504).contains(&status);
            if !retryable || config.stream || attempt > MAX_RETRIES {
                info!(
                    event = "upstream_response",
                    trace_id = %ctx.trace_id,
                    provider = %ctx.provider,
                    status = status,
                    attempt = attempt,
                    is_stream = config.stream
                );
                return convert_response(response, config.stream).await;
            }

            // Drain the body to release the connection; the drained bytes
            // double as the retry hint and, for daily-quota 429s, as the
            // final response body.
            let headers = collect_headers(&response);
            let retry_after = retry_after_ms(&response);
            let drained = response.bytes().await.unwrap_or_default();
            let retry_info = parse_retry_info(&drained);

            if status == 429 && retry_info.is_daily_quota {
                warn!(
                    event = "daily_quota_exhausted",
                    trace_id = %ctx.trace_id,
                    provider = %ctx.provider,
                    model = %ctx.model
                );
                return Ok(EngineResponse {
                    status,
                    headers,
                    body: EngineBody::Bytes(drained),
                });
            }

            let base = backoff_base_ms(retry_after, retry_info.retry_delay_ms, attempt);
            let delay = jittered_delay(base);
            warn!(
                event = "upstream_retry",
                trace_id = %ctx.trace_id,
                provider = %ctx.provider,
                status = status,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64
            );
            sleep_or_cancel(delay, config.cancellation.clone()).await?;
        }
    }

    async fn attempt(
        &self,
        client: &Client,
        url: &str,
        body: Bytes,
        config: &SendConfig,
    ) -> Result<wreq::Response, EngineError> {
        let mut builder = client
            .post(url)
            .header("content-type", "application/json");
        for (name, value) in merged_headers(&config.headers) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let send_future = builder.body(body).send();

        match config.cancellation.clone() {
            Some(mut signal) => {
                tokio::select! {
                    _ = signal.cancelled() => Err(EngineError::Canceled),
                    outcome = tokio::time::timeout(CONNECT_TIMEOUT, send_future) => {
                        flatten_attempt(outcome)
                    }
                }
            }
            None => flatten_attempt(tokio::time::timeout(CONNECT_TIMEOUT, send_future).await),
        }
    }

    fn client_for_proxy(&self, proxy: Option<String>) -> Result<Client, EngineError> {
        let proxy = proxy
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| EngineError::Client("client cache lock poisoned".to_string()))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(proxy.as_deref())
            .map_err(|error| EngineError::Client(error.to_string()))?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn build_client(proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

/// Later entries win; `None` suppresses the header.
fn merged_headers(headers: &[(String, Option<String>)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, Option<String>)> = Vec::new();
    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        merged.retain(|(existing, _)| *existing != key);
        merged.push((key, value.clone()));
    }
    merged
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name, value)))
        .collect()
}

fn flatten_attempt(
    outcome: Result<Result<wreq::Response, wreq::Error>, tokio::time::error::Elapsed>,
) -> Result<wreq::Response, EngineError> {
    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => Err(EngineError::Transport {
            kind: classify_transport_error(&error),
            message: error.to_string(),
        }),
        Err(_) => Err(EngineError::Transport {
            kind: TransportErrorKind::Timeout,
            message: format!("no response headers within {}s", CONNECT_TIMEOUT.as_secs()),
        }),
    }
}

fn classify_transport_error(error: &wreq::Error) -> TransportErrorKind {
    if error.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if error.is_connection_reset() {
        return TransportErrorKind::Reset;
    }
    if error.is_connect() {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Io
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
) -> Result<EngineResponse, EngineError> {
    let status = response.status().as_u16();
    let headers = collect_headers(&response);
    let is_success = (200..300).contains(&status);

    if !is_success || !want_stream {
        let body = response
            .bytes()
            .await
            .map_err(|error| EngineError::Transport {
                kind: classify_transport_error(&error),
                message: error.to_string(),
            })?;
        return Ok(EngineResponse {
            status,
            headers,
            body: EngineBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, StreamError>>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            let forwarded = match item {
                Ok(chunk) => tx.send(Ok(chunk)).await,
                Err(error) => {
                    let failure = classify_stream_error(&error);
                    let _ = tx.send(Err(failure)).await;
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
    });

    Ok(EngineResponse {
        status,
        headers,
        body: EngineBody::Stream(rx),
    })
}

fn classify_stream_error(error: &wreq::Error) -> StreamError {
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();
    if error.is_connection_reset()
        || lowered.contains("closed")
        || lowered.contains("reset")
        || lowered.contains("abort")
        || lowered.contains("eof")
    {
        StreamError::PrematureClose(message)
    } else {
        StreamError::Other(message)
    }
}

fn collect_headers(response: &wreq::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn retry_after_ms(response: &wreq::Response) -> Option<u64> {
    let value = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())?
        .trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds * 1000);
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now())
        .ok()
        .map(|duration| duration.as_millis() as u64)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetryInfo {
    pub retry_delay_ms: Option<u64>,
    pub is_daily_quota: bool,
}

/// Provider-agnostic retry hints from an error payload: `retryDelay`
/// entries shaped `"<float>s"` under `error.details[]`, and daily-quota
/// markers in `metadata.quotaId`.
pub fn parse_retry_info(body: &[u8]) -> RetryInfo {
    let mut info = RetryInfo::default();
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return info;
    };
    let Some(details) = value
        .get("error")
        .and_then(|error| error.get("details"))
        .and_then(JsonValue::as_array)
    else {
        return info;
    };

    for detail in details {
        if let Some(delay) = detail
            .get("retryDelay")
            .and_then(JsonValue::as_str)
            .and_then(parse_delay_seconds)
        {
            let delay = delay.max(INITIAL_BACKOFF_MS);
            info.retry_delay_ms = Some(info.retry_delay_ms.map_or(delay, |prev| prev.max(delay)));
        }
        if detail
            .get("metadata")
            .and_then(|metadata| metadata.get("quotaId"))
            .and_then(JsonValue::as_str)
            .is_some_and(|quota_id| quota_id.contains("PerDay"))
        {
            info.is_daily_quota = true;
        }
    }
    info
}

fn parse_delay_seconds(value: &str) -> Option<u64> {
    let seconds = value.strip_suffix('s')?.parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0) as u64)
}

/// First match wins: Retry-After header, body-derived delay, exponential.
pub fn backoff_base_ms(retry_after: Option<u64>, body_delay: Option<u64>, attempt: u32) -> u64 {
    retry_after
        .or(body_delay)
        .unwrap_or_else(|| exponential_base_ms(attempt))
}

fn exponential_base_ms(attempt: u32) -> u64 {
    INITIAL_BACKOFF_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
}

/// base + uniform(10%,30%) jitter, floored at the initial backoff.
fn jittered_delay(base_ms: u64) -> Duration {
    let jitter = rand::rng().random_range(0.10..0.30);
    let delayed = base_ms as f64 * (1.0 + jitter);
    Duration::from_millis((delayed as u64).max(INITIAL_BACKOFF_MS))
}

async fn sleep_or_cancel(
    delay: Duration,
    cancellation: Option<CancelSignal>,
) -> Result<(), EngineError> {
    match cancellation {
        Some(mut signal) => {
            tokio::select! {
                _ = signal.cancelled() => Err(EngineError::Canceled),
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
