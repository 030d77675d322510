//! SSE pass-through for OpenAI-compatible upstreams.
//!
//! Chunks are parsed and re-serialized so the caller always receives
//! well-formed single-line `data:` frames; malformed chunks are skipped.

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::warn;

use ccrouter_protocol::sse::{SseParser, encode_data_frame, encode_done_frame};

#[derive(Debug, Default)]
pub struct OpenAIStreamPassthrough {
    parser: SseParser,
    done_forwarded: bool,
}

impl OpenAIStreamPassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the upstream already terminated the stream with `[DONE]`;
    /// the driver must not append a second terminator.
    pub fn done_forwarded(&self) -> bool {
        self.done_forwarded
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<Bytes> {
        let payloads = self.parser.push_bytes(chunk);
        self.reframe(payloads)
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        let payloads = self.parser.finish();
        self.reframe(payloads)
    }

    fn reframe(&mut self, payloads: Vec<String>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for payload in payloads {
            if payload == "[DONE]" {
                self.done_forwarded = true;
                frames.push(encode_done_frame());
                continue;
            }
            match serde_json::from_str::<JsonValue>(&payload) {
                Ok(value) => frames.push(encode_data_frame(&value.to_string())),
                Err(error) => {
                    warn!(event = "stream_chunk_skipped", error = %error, "invalid SSE chunk");
                }
            }
        }
        frames
    }
}
