//! Caller body → unified request, and unified request → OpenAI wire.

use serde_json::Value as JsonValue;

use ccrouter_protocol::caller::{ChatRequest, InboundContent, InboundMessage, SystemPrompt};
use ccrouter_protocol::unified::{
    ContentPart, FunctionCall, KnownContentPart, MessageContent, Role, ToolCall, ToolCallType,
    UnifiedChatRequest, UnifiedMessage,
};

use crate::TransformError;

/// Normalize the inbound caller body into the unified request shape.
pub fn transform_request_out(request: ChatRequest) -> UnifiedChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = request.system {
        messages.push(UnifiedMessage {
            role: Role::System,
            content: Some(MessageContent::Text(flatten_system(system))),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
        });
    }

    for message in request.messages {
        messages.push(map_message(message));
    }

    UnifiedChatRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: request.stream,
        tools: request
            .tools
            .map(|tools| tools.into_iter().map(|tool| tool.into_unified()).collect()),
        tool_choice: request.tool_choice,
        reasoning: request.reasoning,
    }
}

fn flatten_system(system: SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text,
        SystemPrompt::Blocks(blocks) => blocks
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<String>>()
            .join("\n"),
    }
}

fn map_message(message: InboundMessage) -> UnifiedMessage {
    match message.role {
        Role::Assistant => map_assistant_message(message),
        Role::Tool => UnifiedMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text(stringify_content(message.content))),
            tool_calls: None,
            tool_call_id: message.tool_call_id,
            thinking: None,
        },
        role => UnifiedMessage {
            role,
            content: map_user_content(message.content),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
        },
    }
}

/// User-side content keeps text and image parts; other kinds are dropped.
fn map_user_content(content: Option<InboundContent>) -> Option<MessageContent> {
    match content {
        Some(InboundContent::Text(text)) => Some(MessageContent::Text(text)),
        Some(InboundContent::Parts(parts)) => {
            let kept: Vec<ContentPart> = parts
                .into_iter()
                .filter(|part| matches!(part, ContentPart::Known(_)))
                .collect();
            Some(MessageContent::Parts(kept))
        }
        None => None,
    }
}

/// Assistant text parts collapse to one newline-joined string; tool
/// calls re-emit with their arguments as a JSON string.
fn map_assistant_message(message: InboundMessage) -> UnifiedMessage {
    let content = match message.content {
        Some(InboundContent::Text(text)) => Some(MessageContent::Text(text)),
        Some(InboundContent::Parts(parts)) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Known(KnownContentPart::Text { text, .. }) => Some(text),
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(MessageContent::Text(texts.join("\n")))
            }
        }
        None => None,
    };

    let tool_calls = message.tool_calls.map(|calls| {
        calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                r#type: ToolCallType::Function,
                function: FunctionCall {
                    name: call.function.name,
                    arguments: stringify_arguments(call.function.arguments),
                },
            })
            .collect()
    });

    UnifiedMessage {
        role: Role::Assistant,
        content,
        tool_calls,
        tool_call_id: None,
        thinking: None,
    }
}

fn stringify_arguments(arguments: Option<JsonValue>) -> String {
    match arguments {
        Some(JsonValue::String(text)) => text,
        Some(value) => value.to_string(),
        None => "{}".to_string(),
    }
}

fn stringify_content(content: Option<InboundContent>) -> String {
    match content {
        Some(InboundContent::Text(text)) => text,
        Some(InboundContent::Parts(parts)) => {
            serde_json::to_value(parts).map(|value| value.to_string()).unwrap_or_default()
        }
        None => String::new(),
    }
}

/// Unified request → OpenAI-compatible wire body.
///
/// Near-identity: `cache_control` fields are stripped from array content
/// and `$schema` is stripped from tool parameter roots and their
/// immediate properties.
pub fn transform_request_in(request: &UnifiedChatRequest) -> Result<JsonValue, TransformError> {
    let mut scrubbed = request.clone();

    for message in &mut scrubbed.messages {
        if let Some(MessageContent::Parts(parts)) = &mut message.content {
            for part in parts {
                if let ContentPart::Known(KnownContentPart::Text { cache_control, .. }) = part {
                    *cache_control = None;
                }
            }
        }
    }

    if let Some(tools) = &mut scrubbed.tools {
        for tool in tools {
            strip_schema_marker(&mut tool.function.parameters);
        }
    }

    let mut body = serde_json::to_value(&scrubbed)?;
    if let Some(map) = body.as_object_mut() {
        map.remove("max_tokens");
        map.remove("reasoning");
    }
    Ok(body)
}

fn strip_schema_marker(parameters: &mut JsonValue) {
    let Some(root) = parameters.as_object_mut() else {
        return;
    };
    root.remove("$schema");
    if let Some(JsonValue::Object(properties)) = root.get_mut("properties") {
        for property in properties.values_mut() {
            if let Some(map) = property.as_object_mut() {
                map.remove("$schema");
            }
        }
    }
}
