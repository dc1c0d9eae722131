//! Turn Orchestrator
//!
//! Owns the call stack and drives one conversation turn end to end:
//! validate, snapshot history, classify, call through
//! `CacheLayer -> RetryLayer -> BreakerLayer -> leaf`, fall back to the
//! alternate service once, then record the exchange.

use crate::cache::{CacheLayer, CacheStats};
use crate::config::Config;
use crate::conversation::{self, ConversationEntry, ConversationStore, UserId};
use crate::metrics::Metrics;
use crate::recovery::{self, BreakerLayer, BreakerRegistry, CircuitState, RetryLayer};
use crate::router::{Router, TriggerLabel};
use crate::upstream::{Completion, CompletionRequest, ServiceId, Upstream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BOTH_SERVICES_UNAVAILABLE: &str =
    "🔧 All AI services are temporarily unavailable. Please try again later.";

/// Chars of user text included in log lines
const PREVIEW_CHARS: usize = 50;

/// Inbound text rejected before any upstream call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    Empty,

    #[error("message has {len} chars, limit is {max}")]
    TooLong { len: usize, max: usize },
}

impl ValidationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ValidationError::Empty => "❓ Please send a message for me to respond to.",
            ValidationError::TooLong { .. } => {
                "📝 Your message is too long. Please break it into smaller parts."
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl TurnError {
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::Validation(e) => e.user_message(),
            TurnError::ShuttingDown => "👋 I'm restarting right now. Please try again shortly.",
        }
    }
}

/// What the transport sends back to the user
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub turn_id: Uuid,
    pub text: String,
    pub citations: Vec<String>,
    /// Service that actually answered; `None` for degraded replies
    pub service_used: Option<ServiceId>,
    pub trigger_labels: Vec<TriggerLabel>,
    pub degraded: bool,
}

impl TurnReply {
    fn answered(
        turn_id: Uuid,
        completion: Completion,
        service: ServiceId,
        labels: Vec<TriggerLabel>,
    ) -> Self {
        Self {
            turn_id,
            text: completion.text,
            citations: completion.citations,
            service_used: Some(service),
            trigger_labels: labels,
            degraded: false,
        }
    }

    fn degraded(turn_id: Uuid, labels: Vec<TriggerLabel>) -> Self {
        Self {
            turn_id,
            text: BOTH_SERVICES_UNAVAILABLE.to_string(),
            citations: Vec::new(),
            service_used: None,
            trigger_labels: labels,
            degraded: true,
        }
    }
}

/// Full call stack below the orchestrator
pub type CallStack<U> = CacheLayer<RetryLayer<BreakerLayer<U>>>;

/// Tracks one admitted turn; wakes `shutdown` when the last one finishes
struct TurnGuard<'a> {
    in_flight: &'a AtomicUsize,
    drained: &'a Notify,
}

impl<'a> TurnGuard<'a> {
    fn enter(in_flight: &'a AtomicUsize, drained: &'a Notify) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self { in_flight, drained }
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

pub struct Orchestrator<U> {
    config: Config,
    store: Arc<ConversationStore>,
    router: Router,
    stack: CallStack<U>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<U: Upstream + 'static> Orchestrator<U> {
    /// Build the call stack around `leaf`
    ///
    /// Services without credentials start disabled.
    pub fn new(config: Config, leaf: U) -> Self {
        let metrics = Arc::new(Metrics::new());
        let breakers = Arc::new(BreakerRegistry::new(&config.breaker));

        for service in config.unconfigured_services() {
            warn!(service = %service, "No credentials configured, service disabled");
            breakers.get(service).disable();
        }

        let resilient = recovery::resilient(
            leaf,
            Arc::clone(&breakers),
            config.retry.clone(),
            Arc::clone(&metrics),
        );
        let stack = config.services.iter().fold(
            CacheLayer::new(resilient, &config.cache, Arc::clone(&metrics)),
            |stack, (service, service_config)| stack.with_model(*service, service_config.model.clone()),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store: Arc::new(ConversationStore::new(config.history.max_entries)),
            router: Router::new(config.entity_min_words),
            stack,
            breakers,
            metrics,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown_tx,
            sweeper: Mutex::new(None),
            config,
        }
    }

    /// Start the periodic idle-conversation sweep
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || !self.is_accepting() {
            return;
        }

        let interval = self.config.history.idle_cleanup_interval;
        *sweeper = Some(self.store.spawn_sweeper(
            interval,
            interval,
            self.shutdown_tx.subscribe(),
        ));
        info!(interval_secs = interval.as_secs(), "Conversation sweeper started");
    }

    pub fn validate(&self, text: &str) -> Result<String, ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }
        let len = trimmed.chars().count();
        if len > self.config.max_message_chars {
            return Err(ValidationError::TooLong {
                len,
                max: self.config.max_message_chars,
            });
        }
        Ok(trimmed.to_string())
    }

    /// Process one inbound message for `user`
    pub async fn handle_turn(&self, user: &UserId, text: &str) -> Result<TurnReply, TurnError> {
        let _turn = TurnGuard::enter(&self.in_flight, &self.drained);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TurnError::ShuttingDown);
        }

        let text = match self.validate(text) {
            Ok(text) => text,
            Err(e) => {
                self.metrics.record_rejected_input();
                debug!(user = %user, error = %e, "Rejected inbound message");
                return Err(e.into());
            }
        };

        let turn_id = Uuid::new_v4();
        let history = self.store.snapshot(user).await;
        let recent = conversation::recent_service(&history, self.config.history.lookback);
        let decision = self.router.classify(&text, recent);

        self.metrics.record_route(&decision.label_names());
        info!(
            turn = %turn_id,
            user = %user,
            service = %decision.service,
            labels = ?decision.label_names(),
            followup = decision.is_followup,
            text = %preview(&text),
            "Routing turn"
        );

        let request = CompletionRequest::new(text.clone())
            .with_context(conversation::context_messages(
                &history,
                self.config.history.context_messages,
            ))
            .with_system_prompt(self.config.system_message.clone())
            .with_max_tokens(self.config.output_tokens)
            .with_cacheable(!decision.has_volatile_label());

        let primary = decision.service;
        let (service, completion) = match self.stack.call(primary, &request).await {
            Ok(completion) => (primary, completion),
            Err(primary_error) => {
                let alternate = primary.alternate();
                warn!(
                    turn = %turn_id,
                    user = %user,
                    service = %primary,
                    fallback = %alternate,
                    error = %primary_error,
                    "Primary service failed, trying alternate"
                );

                match self.stack.call(alternate, &request).await {
                    Ok(completion) => (alternate, completion),
                    Err(alternate_error) => {
                        self.metrics.record_degraded();
                        error!(
                            turn = %turn_id,
                            user = %user,
                            primary_error = %primary_error,
                            alternate_error = %alternate_error,
                            "Both services failed, sending degraded reply"
                        );
                        return Ok(TurnReply::degraded(turn_id, decision.trigger_labels));
                    }
                }
            }
        };

        self.metrics.record_answer(service, service != primary);
        self.store
            .append_exchange(
                user,
                ConversationEntry::user(text),
                ConversationEntry::assistant(
                    completion.text.clone(),
                    service,
                    decision.trigger_labels.clone(),
                ),
            )
            .await;

        info!(
            turn = %turn_id,
            user = %user,
            service = %service,
            fell_back = service != primary,
            chars = completion.text.len(),
            "Turn answered"
        );
        Ok(TurnReply::answered(
            turn_id,
            completion,
            service,
            decision.trigger_labels,
        ))
    }

    /// Clear a disabled flag after the service has been reconfigured
    pub fn reenable(&self, service: ServiceId) {
        self.breakers.get(service).enable();
        info!(service = %service, "Service re-enabled");
    }

    /// Stop accepting turns, wait for in-flight ones, stop the sweeper
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Shutting down orchestrator");
        }
        let _ = self.shutdown_tx.send(true);

        loop {
            let drained = self.drained.notified();
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            debug!(pending, "Waiting for in-flight turns");
            drained.await;
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Conversation sweeper ended abnormally");
            }
        }

        self.stack.clear();
        info!("Orchestrator stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn breaker_states(&self) -> Vec<(ServiceId, CircuitState)> {
        self.breakers.states()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stack.stats()
    }
}
