//! Scripted in-memory upstream shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relaybot::{Completion, CompletionRequest, Config, ServiceId, Upstream, UpstreamError};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Replies from a per-service script, then a default answer
#[derive(Default)]
pub struct ScriptedUpstream {
    scripts: Mutex<HashMap<ServiceId, VecDeque<Result<Completion, UpstreamError>>>>,
    failing: Mutex<HashMap<ServiceId, UpstreamError>>,
    calls: Mutex<HashMap<ServiceId, u32>>,
    requests: Mutex<Vec<(ServiceId, CompletionRequest)>>,
    delay: Duration,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queue one reply for `service`
    pub fn push(&self, service: ServiceId, reply: Result<Completion, UpstreamError>) {
        self.scripts.lock().entry(service).or_default().push_back(reply);
    }

    /// Make every unscripted call to `service` fail
    pub fn fail_always(&self, service: ServiceId, error: UpstreamError) {
        self.failing.lock().insert(service, error);
    }

    pub fn recover(&self, service: ServiceId) {
        self.failing.lock().remove(&service);
    }

    pub fn calls(&self, service: ServiceId) -> u32 {
        self.calls.lock().get(&service).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    pub fn last_request(&self) -> Option<(ServiceId, CompletionRequest)> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn call(
        &self,
        service: ServiceId,
        request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        *self.calls.lock().entry(service).or_insert(0) += 1;
        self.requests.lock().push((service, request.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&service)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = scripted {
            return reply;
        }
        if let Some(error) = self.failing.lock().get(&service) {
            return Err(error.clone());
        }
        Ok(Completion::text(format!(
            "{service} answer to: {}",
            request.text
        )))
    }
}

/// Defaults with both services credentialed and retries that don't wait
pub fn test_config() -> Config {
    let mut config = Config::default();
    for (_, service) in &mut config.services {
        service.api_key = Some("test-key".to_string());
    }
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.rate_limit_delay = Duration::from_millis(5);
    config.retry.jitter_fraction = 0.0;
    config
}
