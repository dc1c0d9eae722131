//! relaybot
//!
//! Request orchestration and resilience core for a two-provider chat bot.
//!
//! # Architecture
//!
//! ```text
//! transport ──► Orchestrator ──► CacheLayer ──► RetryLayer ──► BreakerLayer ──► HttpUpstream
//!                   │               (single-flight)                               (generalist,
//!                   ├── Router (ordered rule chain)                                web-search)
//!                   ├── ConversationStore (per-user locks)
//!                   └── Metrics
//! ```
//!
//! Every layer implements [`Upstream`], so layers compose and tests can
//! slot a scripted fake in place of the HTTP leaf.

pub mod cache;
pub mod config;
pub mod conversation;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod transport;
pub mod upstream;

pub use cache::{CacheLayer, CacheStats};
pub use config::{Config, ConfigError};
pub use conversation::{ConversationEntry, ConversationStats, ConversationStore, UserId};
pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::{Orchestrator, TurnError, TurnReply, ValidationError};
pub use recovery::{BreakerLayer, BreakerRegistry, CircuitBreaker, CircuitStatus, RetryLayer, RetryPolicy};
pub use router::{Router, RoutingDecision, TriggerLabel};
pub use upstream::http::HttpUpstream;
pub use upstream::{
    ChatMessage, Completion, CompletionRequest, ErrorClass, Role, ServiceId, Upstream,
    UpstreamError,
};
