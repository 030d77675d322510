//! Gemini unary response → caller-facing chat completion.

use serde_json::json;

use ccrouter_protocol::gemini::response::{Candidate, GenerateContentResponse};
use ccrouter_protocol::gemini::types::{Part, UsageMetadata};
use ccrouter_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletion, CompletionTokensDetails, PromptTokensDetails,
    Usage,
};
use ccrouter_protocol::unified::{
    FunctionCall, Role, Thinking, ToolCall, ToolCallType,
};

pub fn transform_response(response: GenerateContentResponse, model: &str) -> ChatCompletion {
    let candidate = response.candidates.into_iter().next();
    let parts: Vec<Part> = candidate
        .as_ref()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| content.parts.clone())
        .unwrap_or_default();

    let mut thinking_content = String::new();
    let mut thinking_signature: Option<String> = None;
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for part in parts {
        if let Some(signature) = part.thought_signature.clone()
            && thinking_signature.is_none()
        {
            thinking_signature = Some(signature);
        }
        if part.thought == Some(true) {
            if let Some(text) = &part.text {
                thinking_content.push_str(text);
            }
            continue;
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                id: call.id.unwrap_or_else(generated_tool_id),
                r#type: ToolCallType::Function,
                function: FunctionCall {
                    name: call.name,
                    arguments: call
                        .args
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| json!({}).to_string()),
                },
            });
            continue;
        }
        if let Some(text) = part.text {
            texts.push(text);
        }
    }

    let finish_reason = finish_reason(candidate.as_ref(), !tool_calls.is_empty());

    let thinking = match (&thinking_signature, thinking_content.is_empty()) {
        (Some(signature), false) => Some(Thinking {
            content: Some(thinking_content.clone()),
            signature: Some(signature.clone()),
        }),
        _ => None,
    };

    ChatCompletion {
        id: response
            .response_id
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: Role::Assistant,
                content: if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                thinking,
            },
            finish_reason,
        }],
        usage: response.usage_metadata.as_ref().map(map_usage),
    }
}

/// Lowercased upstream reason, overridden to "tool_calls" when the model
/// stopped after requesting tools.
pub fn finish_reason(candidate: Option<&Candidate>, has_tool_calls: bool) -> Option<String> {
    let reason = candidate?.finish_reason.as_ref()?.to_lowercase();
    if has_tool_calls && reason == "stop" {
        return Some("tool_calls".to_string());
    }
    Some(reason)
}

pub fn map_usage(usage: &UsageMetadata) -> Usage {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0);
    let completion_tokens = usage.candidates_token_count.unwrap_or(0);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: usage
            .total_token_count
            .unwrap_or(prompt_tokens + completion_tokens),
        prompt_tokens_details: usage.cached_content_token_count.map(|cached_tokens| {
            PromptTokensDetails {
                cached_tokens: Some(cached_tokens),
            }
        }),
        completion_tokens_details: usage.thoughts_token_count.map(|reasoning_tokens| {
            CompletionTokensDetails {
                reasoning_tokens: Some(reasoning_tokens),
            }
        }),
    }
}

pub fn generated_tool_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tool_{}", &suffix[..8])
}

pub fn unix_timestamp() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn unix_timestamp_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrouter_protocol::gemini::types::{Content, ContentRole, FunctionCall as GeminiFunctionCall};
    use serde_json::json;

    fn candidate_with_parts(parts: Vec<Part>, finish_reason: Option<&str>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    parts,
                    role: Some(ContentRole::Model),
                }),
                finish_reason: finish_reason.map(str::to_string),
                grounding_metadata: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: Some("resp-1".to_string()),
        }
    }

    #[test]
    fn stop_with_tool_calls_becomes_tool_calls() {
        let response = candidate_with_parts(
            vec![Part {
                function_call: Some(GeminiFunctionCall {
                    id: Some("call_9".to_string()),
                    name: "read_file".to_string(),
                    args: Some(json!({ "path": "x" })),
                }),
                ..Part::default()
            }],
            Some("STOP"),
        );
        let completion = transform_response(response, "gemini-2.5-flash");
        let choice = &completion.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].function.arguments, r#"{"path":"x"}"#);
    }

    #[test]
    fn missing_call_id_is_generated() {
        let response = candidate_with_parts(
            vec![Part {
                function_call: Some(GeminiFunctionCall {
                    id: None,
                    name: "list_dir".to_string(),
                    args: None,
                }),
                ..Part::default()
            }],
            Some("STOP"),
        );
        let completion = transform_response(response, "gemini-2.5-flash");
        let calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
        assert!(calls[0].id.starts_with("tool_"));
        assert_eq!(calls[0].function.arguments, "{}");
    }

    #[test]
    fn thinking_requires_both_content_and_signature() {
        let with_both = candidate_with_parts(
            vec![
                Part {
                    text: Some("mull it over".to_string()),
                    thought: Some(true),
                    ..Part::default()
                },
                Part {
                    text: Some("Hello".to_string()),
                    thought_signature: Some("sig-a".to_string()),
                    ..Part::default()
                },
            ],
            Some("STOP"),
        );
        let completion = transform_response(with_both, "gemini-3-flash");
        let message = &completion.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Hello"));
        let thinking = message.thinking.as_ref().unwrap();
        assert_eq!(thinking.content.as_deref(), Some("mull it over"));
        assert_eq!(thinking.signature.as_deref(), Some("sig-a"));

        let signature_only = candidate_with_parts(
            vec![Part {
                text: Some("Hello".to_string()),
                thought_signature: Some("sig-b".to_string()),
                ..Part::default()
            }],
            Some("STOP"),
        );
        let completion = transform_response(signature_only, "gemini-3-flash");
        assert!(completion.choices[0].message.thinking.is_none());
    }

    #[test]
    fn text_parts_join_with_newline_and_reason_lowers() {
        let response = candidate_with_parts(
            vec![Part::text("one"), Part::text("two")],
            Some("MAX_TOKENS"),
        );
        let completion = transform_response(response, "gemini-2.5-flash");
        let choice = &completion.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("one\ntwo"));
        assert_eq!(choice.finish_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn usage_metadata_maps_to_openai_shape() {
        let mut response = candidate_with_parts(vec![Part::text("hi")], Some("STOP"));
        response.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(10),
            cached_content_token_count: Some(4),
            candidates_token_count: Some(6),
            thoughts_token_count: Some(3),
            total_token_count: Some(16),
        });
        let usage = transform_response(response, "gemini-2.5-flash")
            .usage
            .unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 6);
        assert_eq!(usage.total_tokens, 16);
        assert_eq!(
            usage.prompt_tokens_details.unwrap().cached_tokens,
            Some(4)
        );
        assert_eq!(
            usage.completion_tokens_details.unwrap().reasoning_tokens,
            Some(3)
        );
    }
}
