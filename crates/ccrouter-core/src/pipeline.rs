//! The per-request orchestrator: route, transform in, send, transform
//! out.

use std::sync::Arc;

use bytes::Bytes;

use ccrouter_protocol::caller::ChatRequest;
use ccrouter_protocol::unified::{
    ContentPart, KnownContentPart, MessageContent, UnifiedChatRequest,
};
use ccrouter_transform::openai::request::transform_request_out;

use crate::apikey::resolve_gemini_api_key;
use crate::cancel::CancelSignal;
use crate::config::{ConfigError, ProviderKind, RouterConfig};
use crate::engine::{HttpEngine, RequestContext, SendConfig};
use crate::error::RouterError;
use crate::route::{CustomRouter, resolve_route};
use crate::transformer::{
    CallerResponse, GeminiTransformer, OpenAICompatTransformer, ProviderTransformer,
    ResponseContext, SUGGESTION_MODE_MARKER,
};

pub struct Pipeline {
    engine: HttpEngine,
    config: Arc<RouterConfig>,
    custom_router: Option<Arc<dyn CustomRouter>>,
    gemini: GeminiTransformer,
    openai: OpenAICompatTransformer,
}

impl Pipeline {
    pub fn new(config: Arc<RouterConfig>) -> Self {
        Self {
            engine: HttpEngine::new(),
            config,
            custom_router: None,
            gemini: GeminiTransformer,
            openai: OpenAICompatTransformer,
        }
    }

    pub fn with_custom_router(mut self, custom_router: Arc<dyn CustomRouter>) -> Self {
        self.custom_router = Some(custom_router);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn handle_chat(
        &self,
        request: ChatRequest,
        trace_id: String,
        cancellation: Option<CancelSignal>,
    ) -> Result<CallerResponse, RouterError> {
        let mut unified = transform_request_out(request);
        let suggestion_mode = is_suggestion_mode(&unified);

        let decision = resolve_route(
            &mut unified,
            &self.config,
            self.custom_router.as_deref(),
        )
        .await?;
        let provider = self
            .config
            .provider(&decision.provider)
            .ok_or_else(|| RouterError::UnknownProvider(decision.provider.clone()))?;
        unified.model = decision.model.clone();

        let transformer: &dyn ProviderTransformer = match provider.kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::Openai => &self.openai,
        };

        let api_key = match provider.kind {
            ProviderKind::Gemini => resolve_gemini_api_key(provider.api_key.as_deref())?,
            ProviderKind::Openai => provider
                .api_key
                .clone()
                .ok_or_else(|| ConfigError::MissingProviderApiKey(provider.name.clone()))?,
        };

        let body_value = transformer.transform_request_in(&unified)?;
        let body = Bytes::from(serde_json::to_vec(&body_value)?);
        let url = transformer.endpoint(&provider.api_base_url, &decision.model, unified.stream);

        let send_config = SendConfig {
            headers: transformer.auth_headers(&api_key),
            https_proxy: self.config.https_proxy.clone(),
            cancellation,
            stream: unified.stream,
        };
        let ctx = RequestContext {
            trace_id: trace_id.clone(),
            provider: decision.provider.clone(),
            model: decision.model.clone(),
        };

        let response = self.engine.send(&url, body, &send_config, &ctx).await?;

        Ok(transformer
            .transform_response_out(
                response,
                ResponseContext {
                    model: decision.model,
                    trace_id,
                    suggestion_mode,
                },
            )
            .await)
    }
}

fn is_suggestion_mode(request: &UnifiedChatRequest) -> bool {
    request.messages.iter().any(|message| match &message.content {
        Some(MessageContent::Text(text)) => text.contains(SUGGESTION_MODE_MARKER),
        Some(MessageContent::Parts(parts)) => parts.iter().any(|part| {
            matches!(
                part,
                ContentPart::Known(KnownContentPart::Text { text, .. })
                    if text.contains(SUGGESTION_MODE_MARKER)
            )
        }),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrouter_protocol::unified::{Role, UnifiedMessage};

    #[test]
    fn suggestion_marker_is_detected_anywhere_in_text() {
        let request = UnifiedChatRequest {
            model: "m".to_string(),
            messages: vec![
                UnifiedMessage::text(Role::User, "normal question"),
                UnifiedMessage::text(Role::User, "[SUGGESTION MODE: complete this line]"),
            ],
            max_tokens: None,
            temperature: None,
            stream: true,
            tools: None,
            tool_choice: None,
            reasoning: None,
        };
        assert!(is_suggestion_mode(&request));

        let plain = UnifiedChatRequest {
            messages: vec![UnifiedMessage::text(Role::User, "hello")],
            ..request
        };
        assert!(!is_suggestion_mode(&plain));
    }
}
