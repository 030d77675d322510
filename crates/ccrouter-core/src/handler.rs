//! Caller-facing HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use ccrouter_protocol::caller::ChatRequest;

use crate::cancel::{CancelOnDrop, cancel_pair};
use crate::error::RouterError;
use crate::pipeline::Pipeline;
use crate::transformer::CallerResponse;

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/v1/messages", post(chat_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .route("/health", get(health))
        .with_state(pipeline)
}

async fn health() -> Response {
    json_response(StatusCode::OK, Bytes::from_static(b"{\"status\":\"ok\"}"))
}

async fn chat_handler(
    State(pipeline): State<Arc<Pipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();

    if !authorized(&pipeline, &headers) {
        return json_response(
            StatusCode::UNAUTHORIZED,
            Bytes::from_static(b"{\"error\":{\"message\":\"invalid api key\"}}"),
        );
    }

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            warn!(event = "request_rejected", trace_id = %trace_id, error = %error);
            return error_response(&trace_id, &RouterError::BadRequest(error.to_string()));
        }
    };

    info!(
        event = "request_received",
        trace_id = %trace_id,
        model = %request.model,
        is_stream = request.stream,
        messages = request.messages.len()
    );

    // Dropping the guard (caller disconnect included) cancels the
    // in-flight upstream attempt and suppresses further retries.
    let (handle, signal) = cancel_pair();
    let _guard = CancelOnDrop(handle);

    match pipeline
        .handle_chat(request, trace_id.clone(), Some(signal))
        .await
    {
        Ok(CallerResponse::Json { status, body }) => {
            info!(
                event = "request_completed",
                trace_id = %trace_id,
                status = status,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream = false
            );
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            with_trace_id(json_response(status, body), &trace_id)
        }
        Ok(CallerResponse::Stream { status, body }) => {
            info!(
                event = "request_completed",
                trace_id = %trace_id,
                status = status,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream = true
            );
            let mut response = Response::new(Body::from_stream(ReceiverStream::new(body)));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            with_trace_id(response, &trace_id)
        }
        Err(error) => {
            warn!(
                event = "request_failed",
                trace_id = %trace_id,
                status = error.status().as_u16(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %error
            );
            error_response(&trace_id, &error)
        }
    }
}

fn authorized(pipeline: &Pipeline, headers: &HeaderMap) -> bool {
    let Some(expected) = pipeline.config().api_key.as_deref() else {
        return true;
    };
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|value| value.to_str().ok());
    bearer == Some(expected) || api_key == Some(expected)
}

fn error_response(trace_id: &str, error: &RouterError) -> Response {
    let body = serde_json::json!({
        "error": { "message": error.to_string() }
    });
    let response = json_response(
        error.status(),
        Bytes::from(body.to_string()),
    );
    with_trace_id(response, trace_id)
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn with_trace_id(mut response: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-ccrouter-request-id", value);
    }
    response
}
