//! Unified → Gemini `generateContent` request construction.

use serde_json::{Value as JsonValue, json};

use ccrouter_protocol::gemini::request::GenerateContentRequestBody;
use ccrouter_protocol::gemini::types::{
    Blob, Content, ContentRole, FileData, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionDeclaration, FunctionResponse, GenerationConfig, GoogleSearch, Part, ThinkingConfig,
    ThinkingLevel, Tool, ToolConfig,
};
use ccrouter_protocol::unified::{
    ContentPart, KnownContentPart, MessageContent, ReasoningEffort, Role, ToolCall, ToolChoice,
    ToolChoiceMode, UnifiedChatRequest, UnifiedMessage, UnifiedTool,
};

use crate::TransformError;
use crate::loop_detector::detect_tool_loop;
use crate::schema::t_tool;

/// Fixed role and tool guidance sent with every Gemini request.
pub const SYSTEM_INSTRUCTION: &str = "<role>
You are a coding assistant operating inside Claude Code, a CLI tool for software development.
</role>

<tool-guidance>
The Edit tool performs exact string replacement in files:
- old_string must EXACTLY match text currently in the file, including whitespace and indentation
- new_string must be DIFFERENT from old_string — identical strings will always fail
- Read a file before editing it to ensure you have the current contents
- If Edit fails, use the Write tool to replace the entire file instead
</tool-guidance>

<constraints>
If a tool operation fails twice with the same error, switch to a different non-destructive approach.
If no approach works, clearly tell the user what you attempted and that you cannot proceed — do not keep retrying the same failing operation.
</constraints>";

/// Thinking budget range for non-gemini-3 `pro` models.
const PRO_BUDGET_RANGE: (u32, u32) = (128, 32_768);
/// Thinking budget range for other non-gemini-3 models.
const FLASH_BUDGET_RANGE: (u32, u32) = (0, 24_576);

pub fn build_gemini_body(
    request: &UnifiedChatRequest,
) -> Result<GenerateContentRequestBody, TransformError> {
    let contents = map_messages_to_contents(&request.messages);
    let tools = map_tools(request.tools.as_deref())?;
    let tool_config = map_tool_choice(request.tool_choice.as_ref());
    let generation_config = map_generation_config(request);

    Ok(GenerateContentRequestBody {
        contents,
        tools,
        tool_config,
        system_instruction: Some(Content {
            parts: vec![Part::text(SYSTEM_INSTRUCTION)],
            role: Some(ContentRole::User),
        }),
        generation_config: Some(generation_config),
    })
}

fn map_messages_to_contents(messages: &[UnifiedMessage]) -> Vec<Content> {
    let mut contents = Vec::new();

    for message in messages {
        // Tool results are folded in as functionResponse contents right
        // after the assistant turn that requested them.
        if message.role == Role::Tool {
            continue;
        }

        let role = match message.role {
            Role::Assistant => ContentRole::Model,
            _ => ContentRole::User,
        };

        let mut parts = map_content_to_parts(message);
        if parts.is_empty() {
            parts.push(Part::text(""));
        }

        let calls = message.tool_calls.as_deref().unwrap_or(&[]);
        for (position, call) in calls.iter().enumerate() {
            let call_part = function_call_part(message, call, position, &parts);
            parts.push(call_part);
        }

        contents.push(Content {
            parts,
            role: Some(role),
        });

        if role == ContentRole::Model && !calls.is_empty() {
            contents.push(function_response_content(calls, messages));
        }
    }

    if let Some(hint) = detect_tool_loop(messages) {
        inject_loop_hint(&mut contents, hint);
    }

    contents
}

fn map_content_to_parts(message: &UnifiedMessage) -> Vec<Part> {
    match &message.content {
        Some(MessageContent::Text(text)) => {
            let mut part = Part::text(text.clone());
            if let Some(signature) = message.thinking.as_ref().and_then(|t| t.signature.clone()) {
                part.thought_signature = Some(signature);
            }
            vec![part]
        }
        Some(MessageContent::Parts(parts)) => parts.iter().map(map_part).collect(),
        None => Vec::new(),
    }
}

fn map_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Known(KnownContentPart::Text { text, .. }) => Part::text(text.clone()),
        ContentPart::Known(KnownContentPart::ImageUrl {
            image_url,
            media_type,
        }) => {
            if image_url.url.starts_with("http") {
                Part {
                    file_data: Some(FileData {
                        mime_type: media_type.clone(),
                        file_uri: image_url.url.clone(),
                    }),
                    ..Part::default()
                }
            } else {
                Part {
                    inline_data: Some(Blob {
                        mime_type: media_type
                            .clone()
                            .or_else(|| data_url_mime_type(&image_url.url))
                            .unwrap_or_else(|| "image/png".to_string()),
                        data: base64_payload(&image_url.url),
                    }),
                    ..Part::default()
                }
            }
        }
        ContentPart::Other(value) => match value.get("text").and_then(JsonValue::as_str) {
            Some(text) => Part::text(text),
            None => Part::text(value.to_string()),
        },
    }
}

/// Data URLs keep only the base64 payload after the last comma.
fn base64_payload(url: &str) -> String {
    match url.rfind(',') {
        Some(pos) => url[pos + 1..].to_string(),
        None => url.to_string(),
    }
}

fn data_url_mime_type(url: &str) -> Option<String> {
    let rest = url.strip_prefix("data:")?;
    let end = rest.find([';', ','])?;
    Some(rest[..end].to_string())
}

fn function_call_part(
    message: &UnifiedMessage,
    call: &ToolCall,
    position: usize,
    earlier_parts: &[Part],
) -> Part {
    let args = if call.function.arguments.is_empty() {
        json!({})
    } else {
        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}))
    };

    let mut part = Part {
        function_call: Some(FunctionCall {
            id: Some(call.id.clone()),
            name: call.function.name.clone(),
            args: Some(args),
        }),
        ..Part::default()
    };

    // The message's thinking signature rides on the first call, unless a
    // text part already carries it.
    if position == 0
        && let Some(signature) = message.thinking.as_ref().and_then(|t| t.signature.clone())
        && !earlier_parts
            .iter()
            .any(|earlier| earlier.thought_signature.is_some())
    {
        part.thought_signature = Some(signature);
    }
    part
}

/// Every model-role tool call is answered immediately by a synthetic
/// user-role content carrying one functionResponse per call, matched by
/// id against the conversation's tool-result messages.
fn function_response_content(calls: &[ToolCall], messages: &[UnifiedMessage]) -> Content {
    let parts = calls
        .iter()
        .map(|call| {
            let response = match find_tool_result(messages, &call.id) {
                Some(message) => json!({ "result": tool_result_value(message) }),
                None => json!({}),
            };
            Part {
                function_response: Some(FunctionResponse {
                    id: None,
                    name: call.function.name.clone(),
                    response,
                }),
                ..Part::default()
            }
        })
        .collect();

    Content {
        parts,
        role: Some(ContentRole::User),
    }
}

fn find_tool_result<'a>(messages: &'a [UnifiedMessage], call_id: &str) -> Option<&'a UnifiedMessage> {
    messages
        .iter()
        .find(|message| message.role == Role::Tool && message.tool_call_id.as_deref() == Some(call_id))
}

fn tool_result_value(message: &UnifiedMessage) -> JsonValue {
    match &message.content {
        Some(MessageContent::Text(text)) => JsonValue::String(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            serde_json::to_value(parts).unwrap_or(JsonValue::Null)
        }
        None => JsonValue::Null,
    }
}

fn inject_loop_hint(contents: &mut Vec<Content>, hint: &str) {
    match contents
        .iter_mut()
        .rev()
        .find(|content| content.role == Some(ContentRole::User))
    {
        Some(content) => content.parts.push(Part::text(hint)),
        None => contents.push(Content {
            parts: vec![Part::text(hint)],
            role: Some(ContentRole::User),
        }),
    }
}

fn map_tools(tools: Option<&[UnifiedTool]>) -> Result<Option<Vec<Tool>>, TransformError> {
    let Some(tools) = tools else {
        return Ok(None);
    };

    let mut output = Vec::new();
    let mut declarations = Vec::new();

    for tool in tools {
        if tool.function.name == "web_search" {
            output.push(Tool {
                function_declarations: None,
                google_search: Some(GoogleSearch {}),
            });
        } else {
            declarations.push(FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone().unwrap_or_default(),
                parameters: Some(tool.function.parameters.clone()),
                parameters_json_schema: None,
                response: None,
                response_json_schema: None,
            });
        }
    }

    if !declarations.is_empty() {
        let mut tool = Tool {
            function_declarations: Some(declarations),
            google_search: None,
        };
        t_tool(&mut tool)?;
        output.push(tool);
    }

    if output.is_empty() {
        Ok(None)
    } else {
        Ok(Some(output))
    }
}

fn map_tool_choice(choice: Option<&ToolChoice>) -> Option<ToolConfig> {
    let function_calling_config = match choice? {
        ToolChoice::Mode(ToolChoiceMode::Auto) => FunctionCallingConfig {
            mode: FunctionCallingMode::Auto,
            allowed_function_names: None,
        },
        ToolChoice::Mode(ToolChoiceMode::None) => FunctionCallingConfig {
            mode: FunctionCallingMode::None,
            allowed_function_names: None,
        },
        ToolChoice::Mode(ToolChoiceMode::Required) => FunctionCallingConfig {
            mode: FunctionCallingMode::Any,
            allowed_function_names: None,
        },
        ToolChoice::Function(choice) => FunctionCallingConfig {
            mode: FunctionCallingMode::Any,
            allowed_function_names: Some(vec![choice.function.name.clone()]),
        },
    };

    Some(ToolConfig {
        function_calling_config: Some(function_calling_config),
    })
}

fn map_generation_config(request: &UnifiedChatRequest) -> GenerationConfig {
    let is_gemini3 = request.model.contains("gemini-3");

    GenerationConfig {
        // gemini-3 models fall into deterministic reasoning loops at low
        // temperatures; pin to 1.0.
        temperature: if is_gemini3 {
            Some(1.0)
        } else {
            request.temperature
        },
        max_output_tokens: request.max_tokens,
        thinking_config: map_thinking_config(request),
    }
}

fn map_thinking_config(request: &UnifiedChatRequest) -> Option<ThinkingConfig> {
    let effort = request.reasoning.as_ref()?.effort?;
    if effort == ReasoningEffort::None {
        return None;
    }

    let is_gemini3 = request.model.contains("gemini-3");
    let is_pro = request.model.contains("pro");

    if is_gemini3 {
        let level = match effort {
            ReasoningEffort::High => ThinkingLevel::High,
            // Only non-pro gemini-3 accepts MEDIUM.
            ReasoningEffort::Medium if !is_pro => ThinkingLevel::Medium,
            _ => ThinkingLevel::Low,
        };
        return Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: None,
            thinking_level: Some(level),
        });
    }

    let (min, max) = if is_pro {
        PRO_BUDGET_RANGE
    } else {
        FLASH_BUDGET_RANGE
    };
    Some(ThinkingConfig {
        include_thoughts: true,
        thinking_budget: request
            .reasoning
            .as_ref()
            .and_then(|reasoning| reasoning.max_tokens)
            .map(|tokens| tokens.clamp(min, max)),
        thinking_level: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrouter_protocol::unified::{
        FunctionCall as UnifiedFunctionCall, FunctionName, ImageUrl, Reasoning, Thinking,
        ToolCallType, ToolChoiceFunction, ToolFunction, ToolType,
    };

    fn request_with(messages: Vec<UnifiedMessage>) -> UnifiedChatRequest {
        UnifiedChatRequest {
            model: "gemini-2.5-flash".to_string(),
            messages,
            max_tokens: None,
            temperature: None,
            stream: false,
            tools: None,
            tool_choice: None,
            reasoning: None,
        }
    }

    fn function_tool(name: &str, parameters: JsonValue) -> UnifiedTool {
        UnifiedTool {
            r#type: ToolType::Function,
            function: ToolFunction {
                name: name.to_string(),
                description: Some(format!("{name} tool")),
                parameters,
            },
        }
    }

    #[test]
    fn gemini3_pro_high_effort_pins_temperature_and_level() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "hi")]);
        request.model = "gemini-3-pro-preview".to_string();
        request.reasoning = Some(Reasoning {
            effort: Some(ReasoningEffort::High),
            max_tokens: None,
        });

        let body = build_gemini_body(&request).unwrap();
        let generation = body.generation_config.unwrap();
        assert_eq!(generation.temperature, Some(1.0));
        let thinking = generation.thinking_config.unwrap();
        assert!(thinking.include_thoughts);
        assert_eq!(thinking.thinking_level, Some(ThinkingLevel::High));
        assert_eq!(
            body.system_instruction.unwrap().parts[0].text.as_deref(),
            Some(SYSTEM_INSTRUCTION)
        );
    }

    #[test]
    fn gemini3_medium_effort_depends_on_pro() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "hi")]);
        request.reasoning = Some(Reasoning {
            effort: Some(ReasoningEffort::Medium),
            max_tokens: None,
        });

        request.model = "gemini-3-flash".to_string();
        let body = build_gemini_body(&request).unwrap();
        assert_eq!(
            body.generation_config
                .unwrap()
                .thinking_config
                .unwrap()
                .thinking_level,
            Some(ThinkingLevel::Medium)
        );

        request.model = "gemini-3-pro".to_string();
        let body = build_gemini_body(&request).unwrap();
        assert_eq!(
            body.generation_config
                .unwrap()
                .thinking_config
                .unwrap()
                .thinking_level,
            Some(ThinkingLevel::Low)
        );
    }

    #[test]
    fn thinking_budget_clamps_into_model_range() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "hi")]);
        request.model = "gemini-2.5-pro".to_string();
        request.reasoning = Some(Reasoning {
            effort: Some(ReasoningEffort::Low),
            max_tokens: Some(10),
        });
        let body = build_gemini_body(&request).unwrap();
        assert_eq!(
            body.generation_config
                .unwrap()
                .thinking_config
                .unwrap()
                .thinking_budget,
            Some(128)
        );

        request.model = "gemini-2.5-flash".to_string();
        request.reasoning = Some(Reasoning {
            effort: Some(ReasoningEffort::Low),
            max_tokens: Some(1_000_000),
        });
        let body = build_gemini_body(&request).unwrap();
        assert_eq!(
            body.generation_config
                .unwrap()
                .thinking_config
                .unwrap()
                .thinking_budget,
            Some(24_576)
        );
    }

    #[test]
    fn empty_messages_yield_empty_contents_with_system_instruction() {
        let body = build_gemini_body(&request_with(Vec::new())).unwrap();
        assert!(body.contents.is_empty());
        assert!(body.system_instruction.is_some());
    }

    #[test]
    fn system_role_collapses_to_user() {
        let body = build_gemini_body(&request_with(vec![
            UnifiedMessage::text(Role::System, "be brief"),
            UnifiedMessage::text(Role::Assistant, "ok"),
        ]))
        .unwrap();
        assert_eq!(body.contents[0].role, Some(ContentRole::User));
        assert_eq!(body.contents[1].role, Some(ContentRole::Model));
    }

    #[test]
    fn image_only_message_becomes_inline_data() {
        let message = UnifiedMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::Known(
                KnownContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/jpeg;base64,QUJD".to_string(),
                    },
                    media_type: None,
                },
            )])),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
        };
        let body = build_gemini_body(&request_with(vec![message])).unwrap();
        let blob = body.contents[0].parts[0].inline_data.as_ref().unwrap();
        assert_eq!(blob.mime_type, "image/jpeg");
        assert_eq!(blob.data, "QUJD");
    }

    #[test]
    fn http_image_becomes_file_data() {
        let message = UnifiedMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::Known(
                KnownContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "https://example.com/cat.png".to_string(),
                    },
                    media_type: Some("image/png".to_string()),
                },
            )])),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
        };
        let body = build_gemini_body(&request_with(vec![message])).unwrap();
        let file = body.contents[0].parts[0].file_data.as_ref().unwrap();
        assert_eq!(file.file_uri, "https://example.com/cat.png");
        assert_eq!(file.mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn string_content_carries_thought_signature() {
        let message = UnifiedMessage {
            role: Role::Assistant,
            content: Some(MessageContent::Text("answer".to_string())),
            tool_calls: None,
            tool_call_id: None,
            thinking: Some(Thinking {
                content: Some("pondering".to_string()),
                signature: Some("sig-1".to_string()),
            }),
        };
        let body = build_gemini_body(&request_with(vec![message])).unwrap();
        assert_eq!(
            body.contents[0].parts[0].thought_signature.as_deref(),
            Some("sig-1")
        );
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            r#type: ToolCallType::Function,
            function: UnifiedFunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[test]
    fn tool_calls_pair_with_tool_results() {
        let assistant = UnifiedMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![
                tool_call("call_1", "read_file", r#"{"path":"a.rs"}"#),
                tool_call("call_2", "list_dir", ""),
            ]),
            tool_call_id: None,
            thinking: Some(Thinking {
                content: None,
                signature: Some("sig-t".to_string()),
            }),
        };
        let result = UnifiedMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text("fn main() {}".to_string())),
            tool_calls: None,
            tool_call_id: Some("call_1".to_string()),
            thinking: None,
        };

        let body = build_gemini_body(&request_with(vec![assistant, result])).unwrap();
        assert_eq!(body.contents.len(), 2);

        let model_parts = &body.contents[0].parts;
        // Empty assistant content collapses to a blank text part ahead of
        // the function calls.
        assert_eq!(model_parts[0].text.as_deref(), Some(""));
        let call = model_parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.args, Some(json!({ "path": "a.rs" })));
        // Signature on the first call only.
        assert_eq!(model_parts[1].thought_signature.as_deref(), Some("sig-t"));
        assert!(model_parts[2].thought_signature.is_none());
        assert_eq!(
            model_parts[2].function_call.as_ref().unwrap().args,
            Some(json!({}))
        );

        let reply = &body.contents[1];
        assert_eq!(reply.role, Some(ContentRole::User));
        let matched = reply.parts[0].function_response.as_ref().unwrap();
        assert_eq!(matched.name, "read_file");
        assert_eq!(matched.response, json!({ "result": "fn main() {}" }));
        let unmatched = reply.parts[1].function_response.as_ref().unwrap();
        assert_eq!(unmatched.response, json!({}));
    }

    #[test]
    fn web_search_tool_partitions_to_google_search() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "search")]);
        request.tools = Some(vec![
            function_tool("web_search", json!({ "type": "object" })),
            function_tool("read_file", json!({ "type": "object" })),
        ]);

        let tools = build_gemini_body(&request).unwrap().tools.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools[0].google_search.is_some());
        let declarations = tools[1].function_declarations.as_ref().unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, "read_file");
        assert_eq!(declarations[0].parameters, Some(json!({ "type": "OBJECT" })));
    }

    #[test]
    fn built_tools_never_carry_schema_markers() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "go")]);
        request.tools = Some(vec![function_tool(
            "edit",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": { "old_string": { "type": "string" } }
            }),
        )]);

        let body = build_gemini_body(&request).unwrap();
        let serialized = serde_json::to_string(&body.tools).unwrap();
        assert!(!serialized.contains("$schema"));
    }

    #[test]
    fn tool_choice_maps_to_function_calling_config() {
        let mut request = request_with(vec![UnifiedMessage::text(Role::User, "go")]);

        request.tool_choice = Some(ToolChoice::Mode(ToolChoiceMode::Required));
        let config = build_gemini_body(&request)
            .unwrap()
            .tool_config
            .unwrap()
            .function_calling_config
            .unwrap();
        assert_eq!(config.mode, FunctionCallingMode::Any);
        assert!(config.allowed_function_names.is_none());

        request.tool_choice = Some(ToolChoice::Function(ToolChoiceFunction {
            r#type: Some(ToolType::Function),
            function: FunctionName {
                name: "read_file".to_string(),
            },
        }));
        let config = build_gemini_body(&request)
            .unwrap()
            .tool_config
            .unwrap()
            .function_calling_config
            .unwrap();
        assert_eq!(config.mode, FunctionCallingMode::Any);
        assert_eq!(
            config.allowed_function_names,
            Some(vec!["read_file".to_string()])
        );
    }

    #[test]
    fn loop_hint_appends_to_last_user_content() {
        let failure = "Error: old_string and new_string are exactly the same";
        let messages = vec![
            UnifiedMessage::text(Role::User, "fix it"),
            UnifiedMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text(failure.to_string())),
                tool_calls: None,
                tool_call_id: Some("call_1".to_string()),
                thinking: None,
            },
            UnifiedMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text(failure.to_string())),
                tool_calls: None,
                tool_call_id: Some("call_2".to_string()),
                thinking: None,
            },
        ];
        let body = build_gemini_body(&request_with(messages)).unwrap();
        let user = &body.contents[0];
        let last_part = user.parts.last().unwrap();
        assert_eq!(
            last_part.text.as_deref(),
            Some(crate::loop_detector::EDIT_LOOP_HINT)
        );
    }
}
