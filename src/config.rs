//! Configuration management

use crate::recovery::RetryPolicy;
use crate::upstream::ServiceId;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Upper bound for per-service connection limits
pub const MAX_CONNECTIONS_LIMIT: usize = 10_000;

fn max_connections_key(service: ServiceId) -> &'static str {
    match service {
        ServiceId::Generalist => "OPENAI_MAX_CONNECTIONS",
        ServiceId::WebSearch => "PERPLEXITY_MAX_CONNECTIONS",
    }
}

/// Configuration errors detected at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no upstream service has credentials configured")]
    NoServices,

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Conversation history settings
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum entries kept per user (oldest pruned first)
    pub max_entries: usize,
    /// How many recent entries to scan for follow-up consistency
    pub lookback: usize,
    /// How many recent entries are sent upstream as context
    pub context_messages: usize,
    /// Users idle longer than this are swept; also the sweep period
    pub idle_cleanup_interval: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            lookback: 6,
            context_messages: 10,
            idle_cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: u64,
    pub ttl: Duration,
    /// TTL for long answers (over 1000 chars)
    pub long_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            ttl: Duration::from_secs(300),
            long_ttl: Duration::from_secs(600),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before half-opening
    pub cooldown: Duration,
    /// Failures further apart than this do not accumulate
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            failure_window: Duration::from_secs(120),
        }
    }
}

/// One upstream provider
#[derive(Clone)]
pub struct ServiceConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_connections: usize,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl ServiceConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

// Keep credentials out of debug output
impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_connections", &self.max_connections)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub history: HistoryConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,

    /// Minimum words before the entity heuristic applies
    pub entity_min_words: usize,

    /// Longest inbound message accepted, in chars
    pub max_message_chars: usize,

    pub system_message: String,
    pub output_tokens: u32,

    pub services: Vec<(ServiceId, ServiceConfig)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            entity_min_words: 10,
            max_message_chars: 4000,
            system_message: "You are a helpful assistant.".to_string(),
            output_tokens: 8000,
            services: vec![
                (
                    ServiceId::Generalist,
                    ServiceConfig {
                        api_key: None,
                        base_url: "https://api.openai.com/v1/".to_string(),
                        model: "gpt-4o-mini".to_string(),
                        max_connections: 50,
                        timeout: Duration::from_secs(60),
                    },
                ),
                (
                    ServiceId::WebSearch,
                    ServiceConfig {
                        api_key: None,
                        base_url: "https://api.perplexity.ai".to_string(),
                        model: "sonar-pro".to_string(),
                        max_connections: 30,
                        timeout: Duration::from_secs(60),
                    },
                ),
            ],
        }
    }
}

/// Parse a variable, keeping the default on bad input
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, "Invalid value for configuration key, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

impl Config {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let timeout = env_secs("REQUEST_TIMEOUT", Duration::from_secs(60));

        let history = HistoryConfig {
            max_entries: env_parse("MAX_HISTORY_PER_USER", defaults.history.max_entries),
            lookback: env_parse("LOOKBACK_MESSAGES_FOR_CONSISTENCY", defaults.history.lookback),
            context_messages: env_parse("CONTEXT_MESSAGES", defaults.history.context_messages),
            idle_cleanup_interval: env_secs(
                "USER_LOCK_CLEANUP_INTERVAL",
                defaults.history.idle_cleanup_interval,
            ),
        };

        let cache = CacheConfig {
            enabled: env_bool("CACHE_ENABLED", defaults.cache.enabled),
            capacity: env_parse("CACHE_SIZE", defaults.cache.capacity),
            ttl: env_secs("CACHE_TTL", defaults.cache.ttl),
            long_ttl: env_secs("CACHE_LONG_TTL", defaults.cache.long_ttl),
        };

        let breaker = BreakerConfig {
            failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", defaults.breaker.failure_threshold),
            cooldown: env_secs("BREAKER_COOLDOWN", defaults.breaker.cooldown),
            failure_window: env_secs("BREAKER_WINDOW", defaults.breaker.failure_window),
        };

        let retry = RetryPolicy {
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
            base_delay: env_millis("RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
            max_delay: env_millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay),
            backoff_multiplier: env_parse("RETRY_MULTIPLIER", defaults.retry.backoff_multiplier),
            jitter_fraction: env_parse("RETRY_JITTER", defaults.retry.jitter_fraction),
            rate_limit_delay: env_millis("RETRY_RATE_LIMIT_DELAY_MS", defaults.retry.rate_limit_delay),
        };

        let services = vec![
            (
                ServiceId::Generalist,
                ServiceConfig {
                    api_key: std::env::var("OPENAI_API_KEY").ok(),
                    base_url: std::env::var("OPENAI_API_URL")
                        .unwrap_or_else(|_| "https://api.openai.com/v1/".to_string()),
                    model: std::env::var("GPT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                    max_connections: env_parse("OPENAI_MAX_CONNECTIONS", 50),
                    timeout,
                },
            ),
            (
                ServiceId::WebSearch,
                ServiceConfig {
                    api_key: std::env::var("PERPLEXITY_API_KEY").ok(),
                    base_url: std::env::var("PERPLEXITY_API_URL")
                        .unwrap_or_else(|_| "https://api.perplexity.ai".to_string()),
                    model: std::env::var("PERPLEXITY_MODEL")
                        .unwrap_or_else(|_| "sonar-pro".to_string()),
                    max_connections: env_parse("PERPLEXITY_MAX_CONNECTIONS", 30),
                    timeout,
                },
            ),
        ];

        Self {
            history,
            cache,
            breaker,
            retry,
            entity_min_words: env_parse("ENTITY_DETECTION_MIN_WORDS", defaults.entity_min_words),
            max_message_chars: env_parse("MAX_MESSAGE_CHARS", defaults.max_message_chars),
            system_message: std::env::var("SYSTEM_MESSAGE").unwrap_or(defaults.system_message),
            output_tokens: env_parse("OUTPUT_TOKENS", defaults.output_tokens),
            services,
        }
    }

    /// Settings for one service, if present
    pub fn service(&self, service: ServiceId) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|(id, _)| *id == service)
            .map(|(_, config)| config)
    }

    /// Services that start disabled because they have no credentials
    pub fn unconfigured_services(&self) -> Vec<ServiceId> {
        ServiceId::ALL
            .into_iter()
            .filter(|id| !self.service(*id).is_some_and(ServiceConfig::is_configured))
            .collect()
    }

    /// Reject configurations that cannot serve any turn
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.max_entries == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_HISTORY_PER_USER",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RETRY_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::Invalid {
                key: "RETRY_JITTER",
                reason: format!("{} is outside [0, 1]", self.retry.jitter_fraction),
            });
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "BREAKER_FAILURE_THRESHOLD",
                reason: "must be at least 1".to_string(),
            });
        }
        for (id, service) in &self.services {
            if service.max_connections > MAX_CONNECTIONS_LIMIT {
                return Err(ConfigError::Invalid {
                    key: max_connections_key(*id),
                    reason: format!("{} exceeds {}", service.max_connections, MAX_CONNECTIONS_LIMIT),
                });
            }
        }
        if self.unconfigured_services().len() == ServiceId::ALL.len() {
            return Err(ConfigError::NoServices);
        }
        Ok(())
    }
}
