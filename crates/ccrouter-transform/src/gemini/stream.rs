//! Gemini streamed chunks → caller-facing chat-completion chunks.
//!
//! The translator re-sequences upstream parts so every turn obeys the
//! caller's ordering contract: thinking deltas first, then exactly one
//! signature delta, then text, then tool calls. Gemini-3 models emit
//! text before the real signature arrives, so text is buffered in
//! `pending_content` until the signature shows up.

use ccrouter_protocol::gemini::response::{Candidate, GenerateContentResponse};
use ccrouter_protocol::gemini::types::GroundingMetadata;
use ccrouter_protocol::openai::{
    Annotation, ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta,
    UrlCitation, Usage,
};
use ccrouter_protocol::unified::{Role, Thinking};

use crate::gemini::response::{
    finish_reason, generated_tool_id, map_usage, unix_timestamp, unix_timestamp_ms,
};

#[derive(Debug)]
pub struct GeminiStreamState {
    id: String,
    model: String,
    created: i64,
    signature_sent: bool,
    content_sent: bool,
    has_thinking_content: bool,
    pending_content: String,
    content_index: i64,
    tool_call_index: i64,
    usage: Option<Usage>,
}

impl GeminiStreamState {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: unix_timestamp(),
            signature_sent: false,
            content_sent: false,
            has_thinking_content: false,
            pending_content: String::new(),
            content_index: 0,
            tool_call_index: -1,
            usage: None,
        }
    }

    pub fn transform_chunk(
        &mut self,
        chunk: GenerateContentResponse,
    ) -> Vec<ChatCompletionChunk> {
        if let Some(metadata) = &chunk.usage_metadata {
            self.usage = Some(map_usage(metadata));
        }
        if let Some(response_id) = chunk.response_id.clone() {
            self.id = response_id;
        }

        let mut events = Vec::new();
        let Some(candidate) = chunk.candidates.first() else {
            return events;
        };
        let parts = candidate
            .content
            .as_ref()
            .map(|content| content.parts.as_slice())
            .unwrap_or_default();
        let pending_was_empty = self.pending_content.is_empty();

        for part in parts {
            if part.thought == Some(true)
                && let Some(text) = &part.text
            {
                self.has_thinking_content = true;
                events.push(self.make_chunk(
                    ChunkDelta {
                        role: Some(Role::Assistant),
                        content: None,
                        thinking: Some(Thinking {
                            content: Some(text.clone()),
                            signature: None,
                        }),
                        tool_calls: None,
                        annotations: None,
                    },
                    None,
                    self.content_index,
                ));
            }
        }

        if !self.signature_sent
            && let Some(signature) = parts.iter().find_map(|part| part.thought_signature.clone())
        {
            events.push(self.signature_chunk(signature));
            if !self.pending_content.is_empty() {
                let buffered = std::mem::take(&mut self.pending_content);
                self.content_index += 1;
                events.push(self.text_chunk(buffered, candidate, false));
            }
        }

        let text: String = parts
            .iter()
            .filter(|part| part.thought != Some(true))
            .filter_map(|part| part.text.as_deref())
            .collect();
        let tool_calls: Vec<_> = parts
            .iter()
            .filter(|part| part.thought != Some(true))
            .filter_map(|part| part.function_call.clone())
            .collect();
        let has_tool_calls = !tool_calls.is_empty();

        if self.has_thinking_content && !text.is_empty() && !self.signature_sent {
            if self.model.contains('3') {
                // The real signature arrives in a later chunk; hold the
                // text until then.
                self.pending_content.push_str(&text);
                self.attach_usage(&mut events);
                return events;
            }
            let synthesized = format!("ccr_{}", unix_timestamp_ms());
            events.push(self.signature_chunk(synthesized));
        }

        if !text.is_empty() {
            if pending_was_empty {
                self.content_index += 1;
            }
            let mut chunk = self.text_chunk(text, candidate, has_tool_calls);
            chunk.choices[0].delta.annotations = candidate
                .grounding_metadata
                .as_ref()
                .and_then(map_annotations);
            events.push(chunk);
        }

        for call in tool_calls {
            self.content_index += 1;
            self.tool_call_index += 1;
            events.push(self.make_chunk(
                ChunkDelta {
                    role: Some(Role::Assistant),
                    content: None,
                    thinking: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index: self.tool_call_index,
                        id: Some(call.id.clone().unwrap_or_else(generated_tool_id)),
                        r#type: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(call.name.clone()),
                            arguments: Some(
                                call.args
                                    .map(|args| args.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            ),
                        }),
                    }]),
                    annotations: None,
                },
                Some("tool_calls".to_string()),
                self.content_index,
            ));
        }

        self.attach_usage(&mut events);
        events
    }

    /// End-of-stream flush. Text still buffered for a signature that
    /// never arrived is released (behind a synthesized signature) so the
    /// turn is not truncated.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        let mut events = Vec::new();
        if !self.pending_content.is_empty() {
            if !self.signature_sent {
                let synthesized = format!("ccr_{}", unix_timestamp_ms());
                events.push(self.signature_chunk(synthesized));
            }
            let buffered = std::mem::take(&mut self.pending_content);
            self.content_index += 1;
            let chunk = self.make_chunk(
                ChunkDelta {
                    role: Some(Role::Assistant),
                    content: Some(buffered),
                    thinking: None,
                    tool_calls: None,
                    annotations: None,
                },
                None,
                self.content_index,
            );
            events.push(chunk);
            self.content_sent = true;
        }
        self.attach_usage(&mut events);
        events
    }

    /// Whether any non-thinking content reached the caller yet.
    pub fn content_emitted(&self) -> bool {
        self.content_sent
    }

    fn signature_chunk(&mut self, signature: String) -> ChatCompletionChunk {
        self.signature_sent = true;
        self.make_chunk(
            ChunkDelta {
                role: Some(Role::Assistant),
                content: None,
                thinking: Some(Thinking {
                    content: None,
                    signature: Some(signature),
                }),
                tool_calls: None,
                annotations: None,
            },
            None,
            self.content_index,
        )
    }

    fn text_chunk(
        &mut self,
        text: String,
        candidate: &Candidate,
        has_tool_calls: bool,
    ) -> ChatCompletionChunk {
        self.content_sent = true;
        self.make_chunk(
            ChunkDelta {
                role: Some(Role::Assistant),
                content: Some(text),
                thinking: None,
                tool_calls: None,
                annotations: None,
            },
            finish_reason(Some(candidate), has_tool_calls),
            self.content_index,
        )
    }

    fn make_chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        index: i64,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                delta,
                index,
                finish_reason,
            }],
            usage: None,
        }
    }

    fn attach_usage(&self, events: &mut [ChatCompletionChunk]) {
        for event in events {
            event.usage = self.usage.clone();
        }
    }
}

fn map_annotations(metadata: &GroundingMetadata) -> Option<Vec<Annotation>> {
    let supports = metadata.grounding_supports.as_deref().unwrap_or_default();
    let annotations: Vec<Annotation> = metadata
        .grounding_chunks
        .iter()
        .enumerate()
        .filter_map(|(chunk_index, chunk)| {
            let web = chunk.web.as_ref()?;
            let segment = supports
                .iter()
                .find(|support| {
                    support
                        .grounding_chunk_indices
                        .as_ref()
                        .is_some_and(|indices| indices.contains(&(chunk_index as u32)))
                })
                .and_then(|support| support.segment.as_ref());
            Some(Annotation::UrlCitation {
                url_citation: UrlCitation {
                    url: web.uri.clone(),
                    title: web.title.clone(),
                    start_index: segment.and_then(|segment| segment.start_index),
                    end_index: segment.and_then(|segment| segment.end_index),
                },
            })
        })
        .collect();

    if annotations.is_empty() {
        None
    } else {
        Some(annotations)
    }
}
