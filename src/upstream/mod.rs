//! Upstream Call Contract
//!
//! Every layer of the call stack (HTTP leaf, breaker, retry, cache) implements
//! the same [`Upstream`] trait, so wrappers compose freely:
//!
//! ```text
//! CacheLayer ──► RetryLayer ──► BreakerLayer ──► HttpUpstream
//! ```

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use http::HttpUpstream;

/// The two interchangeable upstream services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceId {
    /// Conversational model (OpenAI-compatible)
    Generalist,
    /// Web-grounded model with citations (Perplexity-compatible)
    WebSearch,
}

impl ServiceId {
    pub const ALL: [ServiceId; 2] = [ServiceId::Generalist, ServiceId::WebSearch];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Generalist => "generalist",
            ServiceId::WebSearch => "web-search",
        }
    }

    /// The service used for bidirectional fallback
    pub fn alternate(&self) -> ServiceId {
        match self {
            ServiceId::Generalist => ServiceId::WebSearch,
            ServiceId::WebSearch => ServiceId::Generalist,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat roles understood by both providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Message sent upstream as context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request handed to the call stack
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Inbound user text (already validated)
    pub text: String,
    /// Prior turns sent as context, oldest first
    pub context: Vec<ChatMessage>,
    pub system_prompt: String,
    pub max_tokens: u32,
    /// Whether a successful answer may be stored in the response cache
    pub cacheable: bool,
}

impl CompletionRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Vec::new(),
            system_prompt: String::new(),
            max_tokens: 1024,
            cacheable: true,
        }
    }

    pub fn with_context(mut self, context: Vec<ChatMessage>) -> Self {
        self.context = context;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Full message list: system prompt, context, then the new user turn
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.context.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.system_prompt.clone()));
        }
        messages.extend(self.context.iter().cloned());
        messages.push(ChatMessage::new(Role::User, self.text.clone()));
        messages
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Successful upstream answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub usage: Usage,
    pub model: String,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
            usage: Usage::default(),
            model: String::new(),
        }
    }
}

/// Failure of any layer in the call stack.
///
/// `Clone` so a single-flight outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned server error {0}")]
    Server(u16),

    #[error("network failure: {0}")]
    Network(String),

    #[error("authentication rejected (status {0})")]
    Auth(u16),

    #[error("service misconfigured: {0}")]
    Config(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("unreadable provider response: {0}")]
    Decode(String),

    #[error("circuit open for {0}")]
    CircuitOpen(ServiceId),

    #[error("{0} is disabled until reconfigured")]
    Disabled(ServiceId),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<UpstreamError>,
    },
}

/// Recovery classification of an [`UpstreamError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, 5xx or network failure; retry likely to succeed
    Transient,
    /// Provider throttling; retry after a longer fixed delay
    RateLimited,
    /// Credentials or configuration; the service is unusable until fixed
    AuthOrConfig,
    /// The request itself is bad; retry won't help
    Invalid,
    /// Rejected locally by the breaker without reaching the provider
    Rejected,
}

impl ErrorClass {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

impl UpstreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Server(_) | Self::Network(_) | Self::Decode(_) => {
                ErrorClass::Transient
            }
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Auth(_) | Self::Config(_) => ErrorClass::AuthOrConfig,
            Self::InvalidRequest(_) => ErrorClass::Invalid,
            Self::CircuitOpen(_) | Self::Disabled(_) => ErrorClass::Rejected,
            Self::Exhausted { last, .. } => last.class(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Map an HTTP status to an error; `None` for success codes
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(Self::Auth(status)),
            404 => Some(Self::Config(format!("endpoint not found ({status})"))),
            408 => Some(Self::Timeout(Duration::ZERO)),
            429 => Some(Self::RateLimited { retry_after }),
            400..=499 => Some(Self::InvalidRequest(format!("status {status}"))),
            _ => Some(Self::Server(status)),
        }
    }
}

/// The single `call(service, request)` contract shared by every layer
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError>;
}

#[async_trait]
impl<U: Upstream + ?Sized> Upstream for std::sync::Arc<U> {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        (**self).call(service, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(UpstreamError::Auth(401).class(), ErrorClass::AuthOrConfig);
        assert_eq!(UpstreamError::CircuitOpen(ServiceId::WebSearch).class(), ErrorClass::Rejected);
        assert!(UpstreamError::RateLimited { retry_after: None }.is_retryable());
        assert!(!UpstreamError::InvalidRequest("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(UpstreamError::from_status(200, None), None);
        assert_eq!(UpstreamError::from_status(401, None), Some(UpstreamError::Auth(401)));
        assert!(matches!(
            UpstreamError::from_status(429, Some(Duration::from_secs(3))),
            Some(UpstreamError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(3)
        ));
        assert_eq!(UpstreamError::from_status(503, None), Some(UpstreamError::Server(503)));
        assert_eq!(
            UpstreamError::from_status(422, None).map(|e| e.class()),
            Some(ErrorClass::Invalid)
        );
    }

    #[test]
    fn test_retryable() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UpstreamError::Server(502).is_retryable());
        assert!(UpstreamError::RateLimited { retry_after: None }.is_retryable());
        assert!(!UpstreamError::Auth(401).is_retryable());
        assert!(!UpstreamError::CircuitOpen(ServiceId::WebSearch).is_retryable());
    }

    #[test]
    fn test_alternate_is_symmetric() {
        for service in ServiceId::ALL {
            assert_eq!(service.alternate().alternate(), service);
            assert_ne!(service.alternate(), service);
        }
    }

    #[test]
    fn test_messages_order() {
        let request = CompletionRequest::new("latest question")
            .with_system_prompt("be brief")
            .with_context(vec![
                ChatMessage::new(Role::User, "hi"),
                ChatMessage::new(Role::Assistant, "hello"),
            ]);

        let messages = request.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[3].content, "latest question");
    }
}
