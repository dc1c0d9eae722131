//! HTTP Leaf Adapter
//!
//! Speaks the OpenAI-style `/chat/completions` wire format, which both the
//! generalist and the web-search provider accept. Each service gets its own
//! connection budget (semaphore) and a per-attempt timeout.

use super::{ChatMessage, Completion, CompletionRequest, ServiceId, Upstream, UpstreamError, Usage};
use crate::config::ServiceConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// API request
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

/// API response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    /// Only returned by the web-search provider
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn connection_limit(config: &ServiceConfig) -> usize {
    config.max_connections.clamp(1, Semaphore::MAX_PERMITS)
}

struct Endpoint {
    config: ServiceConfig,
    permits: Arc<Semaphore>,
}

/// reqwest-backed implementation of the call primitive
pub struct HttpUpstream {
    client: Client,
    endpoints: HashMap<ServiceId, Endpoint>,
}

impl HttpUpstream {
    pub fn new(services: impl IntoIterator<Item = (ServiceId, ServiceConfig)>) -> Self {
        let endpoints = services
            .into_iter()
            .map(|(service, config)| {
                let permits = Arc::new(Semaphore::new(connection_limit(&config)));
                (service, Endpoint { config, permits })
            })
            .collect();

        Self {
            client: Client::new(),
            endpoints,
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.services.clone())
    }

    /// Maximum concurrent calls allowed for a service
    pub fn concurrency_limit(&self, service: ServiceId) -> usize {
        self.endpoints
            .get(&service)
            .map(|e| connection_limit(&e.config))
            .unwrap_or(0)
    }

    fn url(config: &ServiceConfig) -> String {
        format!("{}/chat/completions", config.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        config: &ServiceConfig,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        let body = ChatRequest {
            model: &config.model,
            messages: request.messages(),
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(Self::url(config))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(error) = UpstreamError::from_status(status, retry_after) {
            return Err(error);
        }

        let parsed: ChatResponse = response.json().await.map_err(map_transport_error)?;
        into_completion(parsed, &config.model)
    }
}

fn map_transport_error(error: reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout(Duration::ZERO)
    } else if error.is_decode() {
        UpstreamError::Decode(error.without_url().to_string())
    } else if error.is_builder() {
        UpstreamError::Config(error.without_url().to_string())
    } else {
        UpstreamError::Network(error.without_url().to_string())
    }
}

fn into_completion(parsed: ChatResponse, configured_model: &str) -> Result<Completion, UpstreamError> {
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| UpstreamError::Decode("empty completion".to_string()))?;

    let usage = parsed
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(Completion {
        text,
        citations: parsed.citations,
        usage,
        model: parsed.model.unwrap_or_else(|| configured_model.to_string()),
    })
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        let endpoint = self
            .endpoints
            .get(&service)
            .ok_or_else(|| UpstreamError::Config(format!("no endpoint for {service}")))?;
        let api_key = endpoint
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::Config(format!("missing API key for {service}")))?;

        let _permit = endpoint
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Network("connection pool closed".to_string()))?;

        let timeout = endpoint.config.timeout;
        debug!(service = %service, model = %endpoint.config.model, "Upstream request");

        match tokio::time::timeout(timeout, self.send(&endpoint.config, api_key, request)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_config(url: &str) -> ServiceConfig {
        ServiceConfig {
            api_key: Some("test-key".to_string()),
            base_url: url.to_string(),
            model: "test-model".to_string(),
            max_connections: 4,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_url_joining() {
        assert_eq!(
            HttpUpstream::url(&service_config("https://api.openai.com/v1/")),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            HttpUpstream::url(&service_config("https://api.perplexity.ai")),
            "https://api.perplexity.ai/chat/completions"
        );
    }

    #[test]
    fn test_parse_web_search_response() {
        let raw = r#"{
            "model": "sonar-pro",
            "choices": [{"message": {"role": "assistant", "content": " Rust 1.80 shipped [1] "}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7},
            "citations": ["https://blog.rust-lang.org/"]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let completion = into_completion(parsed, "fallback").unwrap();

        assert_eq!(completion.text, "Rust 1.80 shipped [1]");
        assert_eq!(completion.citations, vec!["https://blog.rust-lang.org/"]);
        assert_eq!(completion.usage.output_tokens, 7);
        assert_eq!(completion.model, "sonar-pro");
    }

    #[test]
    fn test_empty_completion_is_decode_error() {
        let raw = r#"{"choices": [{"message": {"content": "   "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            into_completion(parsed, "m"),
            Err(UpstreamError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let mut config = service_config("http://127.0.0.1:9");
        config.api_key = None;
        let upstream = HttpUpstream::new([(ServiceId::Generalist, config)]);

        let result = upstream
            .call(ServiceId::Generalist, &CompletionRequest::new("hi"))
            .await;
        assert!(matches!(result, Err(UpstreamError::Config(_))));

        let result = upstream
            .call(ServiceId::WebSearch, &CompletionRequest::new("hi"))
            .await;
        assert!(matches!(result, Err(UpstreamError::Config(_))));
        assert_eq!(upstream.concurrency_limit(ServiceId::Generalist), 4);
    }

    #[test]
    fn test_connection_limit_is_clamped() {
        let mut config = service_config("http://127.0.0.1:9");
        config.max_connections = usize::MAX;
        let upstream = HttpUpstream::new([(ServiceId::WebSearch, config)]);
        assert_eq!(upstream.concurrency_limit(ServiceId::WebSearch), Semaphore::MAX_PERMITS);
    }
}
