//! The inbound caller request: Anthropic-style chat completions with a
//! top-level `system` block, tool definitions in either the function or
//! the legacy `input_schema` shape, and OpenAI-style message roles.

use serde::{Deserialize, Serialize};

use crate::unified::{
    ContentPart, JsonValue, Reasoning, Role, ToolChoice, ToolFunction, ToolType, UnifiedTool,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Tool-call entries arrive with `arguments` either as a JSON string or
/// as an already-parsed object; normalization to a string happens in the
/// caller-side transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundToolCall {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub function: InboundFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFunctionCall {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<InboundContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<InboundToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Both accepted tool shapes: `{type:"function", function:{..}}` and the
/// legacy `{name, description, input_schema}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundTool {
    Function(UnifiedTool),
    Legacy {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        input_schema: JsonValue,
    },
}

impl InboundTool {
    pub fn into_unified(self) -> UnifiedTool {
        match self {
            InboundTool::Function(tool) => tool,
            InboundTool::Legacy {
                name,
                description,
                input_schema,
            } => UnifiedTool {
                r#type: ToolType::Function,
                function: ToolFunction {
                    name,
                    description,
                    parameters: input_schema,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<InboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<InboundTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}
