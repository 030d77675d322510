//! Provider+model selection for one request.
//!
//! Precedence: subagent inline marker, custom-router hook, an explicit
//! `provider,model` request model, then the configured rules
//! (long-context, background, think, web-search), then the default.

use async_trait::async_trait;
use tracing::debug;

use ccrouter_protocol::unified::{
    ContentPart, KnownContentPart, MessageContent, UnifiedChatRequest,
};

use crate::config::RouterConfig;
use crate::error::RouterError;

pub const SUBAGENT_MARKER_START: &str = "<CCR-SUBAGENT-MODEL>";
pub const SUBAGENT_MARKER_END: &str = "</CCR-SUBAGENT-MODEL>";

/// External routing hook; returns `"provider,model"` or `None` to fall
/// through to the built-in rules.
#[async_trait]
pub trait CustomRouter: Send + Sync {
    async fn route(&self, request: &UnifiedChatRequest) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub provider: String,
    pub model: String,
}

pub async fn resolve_route(
    request: &mut UnifiedChatRequest,
    config: &RouterConfig,
    custom_router: Option<&dyn CustomRouter>,
) -> Result<RouteDecision, RouterError> {
    if let Some(decision) = extract_subagent_marker(request) {
        debug!(event = "route", rule = "subagent", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    if let Some(hook) = custom_router
        && let Some(route) = hook.route(request).await
        && let Some(decision) = parse_route(&route)
    {
        debug!(event = "route", rule = "custom", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    if let Some(decision) = parse_route(&request.model) {
        return Ok(decision);
    }

    let rules = &config.router;

    if estimate_tokens(request) > rules.long_context_threshold
        && let Some(decision) = rules.long_context.as_deref().and_then(parse_route)
    {
        debug!(event = "route", rule = "long_context", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    if request.model.contains("haiku")
        && let Some(decision) = rules.background.as_deref().and_then(parse_route)
    {
        debug!(event = "route", rule = "background", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    if request.reasoning.is_some()
        && let Some(decision) = rules.think.as_deref().and_then(parse_route)
    {
        debug!(event = "route", rule = "think", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    if wants_web_search(request)
        && let Some(decision) = rules.web_search.as_deref().and_then(parse_route)
    {
        debug!(event = "route", rule = "web_search", provider = %decision.provider, model = %decision.model);
        return Ok(decision);
    }

    rules
        .default
        .as_deref()
        .and_then(parse_route)
        .ok_or(RouterError::NoRoute)
}

pub fn parse_route(value: &str) -> Option<RouteDecision> {
    let (provider, model) = value.split_once(',')?;
    let provider = provider.trim();
    let model = model.trim();
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some(RouteDecision {
        provider: provider.to_string(),
        model: model.to_string(),
    })
}

/// A sub-agent pins its upstream by prefixing its first text with
/// `<CCR-SUBAGENT-MODEL>provider,model</CCR-SUBAGENT-MODEL>`. The marker
/// is consumed so the upstream never sees it.
fn extract_subagent_marker(request: &mut UnifiedChatRequest) -> Option<RouteDecision> {
    for message in &mut request.messages {
        match &mut message.content {
            Some(MessageContent::Text(text)) => {
                if let Some((decision, rest)) = split_marker(text) {
                    *text = rest;
                    return Some(decision);
                }
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    if let ContentPart::Known(KnownContentPart::Text { text, .. }) = part
                        && let Some((decision, rest)) = split_marker(text)
                    {
                        *text = rest;
                        return Some(decision);
                    }
                }
            }
            None => {}
        }
    }
    None
}

fn split_marker(text: &str) -> Option<(RouteDecision, String)> {
    let after_start = text.strip_prefix(SUBAGENT_MARKER_START)?;
    let end = after_start.find(SUBAGENT_MARKER_END)?;
    let decision = parse_route(&after_start[..end])?;
    let rest = after_start[end + SUBAGENT_MARKER_END.len()..].to_string();
    Some((decision, rest))
}

fn wants_web_search(request: &UnifiedChatRequest) -> bool {
    request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|tool| tool.function.name == "web_search")
}

/// Cheap size estimate used only against the long-context threshold; a
/// token is counted as four characters of message and tool text.
pub fn estimate_tokens(request: &UnifiedChatRequest) -> u64 {
    let mut chars: u64 = 0;
    for message in &request.messages {
        match &message.content {
            Some(MessageContent::Text(text)) => chars += text.len() as u64,
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Known(KnownContentPart::Text { text, .. }) => {
                            chars += text.len() as u64
                        }
                        ContentPart::Known(KnownContentPart::ImageUrl { image_url, .. }) => {
                            chars += image_url.url.len() as u64
                        }
                        ContentPart::Other(value) => chars += value.to_string().len() as u64,
                    }
                }
            }
            None => {}
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                chars += call.function.arguments.len() as u64;
            }
        }
    }
    for tool in request.tools.as_deref().unwrap_or_default() {
        chars += tool.function.parameters.to_string().len() as u64;
    }
    chars / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrouter_protocol::unified::{
        Reasoning, ReasoningEffort, Role, ToolFunction, ToolType, UnifiedMessage, UnifiedTool,
    };
    use serde_json::json;

    fn base_config() -> RouterConfig {
        serde_json::from_value(json!({
            "Providers": [
                { "name": "gemini", "kind": "gemini", "api_base_url": "https://g/models" },
                { "name": "openrouter", "kind": "openai", "api_base_url": "https://o" }
            ],
            "Router": {
                "default": "gemini,gemini-3-pro-preview",
                "background": "gemini,gemini-2.5-flash",
                "think": "openrouter,reasoner",
                "long_context": "openrouter,big-context-model",
                "long_context_threshold": 100,
                "web_search": "gemini,gemini-2.5-flash"
            }
        }))
        .unwrap()
    }

    fn request(model: &str, text: &str) -> UnifiedChatRequest {
        UnifiedChatRequest {
            model: model.to_string(),
            messages: vec![UnifiedMessage::text(Role::User, text)],
            max_tokens: None,
            temperature: None,
            stream: false,
            tools: None,
            tool_choice: None,
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn default_rule_applies() {
        let config = base_config();
        let mut req = request("claude-sonnet-4-5", "hello");
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.provider, "gemini");
        assert_eq!(decision.model, "gemini-3-pro-preview");
    }

    #[tokio::test]
    async fn subagent_marker_wins_and_is_stripped() {
        let config = base_config();
        let mut req = request(
            "claude-sonnet-4-5",
            "<CCR-SUBAGENT-MODEL>openrouter,small-model</CCR-SUBAGENT-MODEL>do the thing",
        );
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.provider, "openrouter");
        assert_eq!(decision.model, "small-model");
        assert_eq!(
            req.messages[0].content,
            Some(MessageContent::Text("do the thing".to_string()))
        );
    }

    struct PinnedRouter;

    #[async_trait]
    impl CustomRouter for PinnedRouter {
        async fn route(&self, _request: &UnifiedChatRequest) -> Option<String> {
            Some("openrouter,pinned".to_string())
        }
    }

    #[tokio::test]
    async fn custom_router_hook_overrides_rules() {
        let config = base_config();
        let mut req = request("claude-sonnet-4-5", "hello");
        let decision = resolve_route(&mut req, &config, Some(&PinnedRouter))
            .await
            .unwrap();
        assert_eq!(decision.model, "pinned");
    }

    #[tokio::test]
    async fn explicit_provider_model_passes_through() {
        let config = base_config();
        let mut req = request("gemini,gemini-2.5-flash", "hello");
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn long_context_threshold_reroutes() {
        let config = base_config();
        let mut req = request("claude-sonnet-4-5", &"x".repeat(500));
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.provider, "openrouter");
        assert_eq!(decision.model, "big-context-model");
    }

    #[tokio::test]
    async fn haiku_requests_go_to_background_route() {
        let config = base_config();
        let mut req = request("claude-3-5-haiku", "quick");
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn reasoning_requests_use_think_route() {
        let config = base_config();
        let mut req = request("claude-sonnet-4-5", "prove it");
        req.reasoning = Some(Reasoning {
            effort: Some(ReasoningEffort::High),
            max_tokens: None,
        });
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.provider, "openrouter");
        assert_eq!(decision.model, "reasoner");
    }

    #[tokio::test]
    async fn web_search_tools_use_web_search_route() {
        let mut config = base_config();
        config.router.think = None;
        let mut req = request("claude-sonnet-4-5", "find it");
        req.tools = Some(vec![UnifiedTool {
            r#type: ToolType::Function,
            function: ToolFunction {
                name: "web_search".to_string(),
                description: None,
                parameters: json!({ "type": "object" }),
            },
        }]);
        let decision = resolve_route(&mut req, &config, None).await.unwrap();
        assert_eq!(decision.model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn missing_default_is_an_error() {
        let mut config = base_config();
        config.router = Default::default();
        let mut req = request("claude-sonnet-4-5", "hello");
        assert!(matches!(
            resolve_route(&mut req, &config, None).await,
            Err(RouterError::NoRoute)
        ));
    }

    #[test]
    fn parse_route_rejects_malformed_values() {
        assert!(parse_route("gemini").is_none());
        assert!(parse_route(",model").is_none());
        assert!(parse_route("gemini,").is_none());
        assert_eq!(
            parse_route(" gemini , gemini-3-flash ").unwrap(),
            RouteDecision {
                provider: "gemini".to_string(),
                model: "gemini-3-flash".to_string(),
            }
        );
    }
}
