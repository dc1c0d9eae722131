//! Conversation Store
//!
//! In-memory, per-user ordered history with one lock per user. A separate
//! registry lock only guards creating and removing the per-user slots, so
//! users never contend with each other. Readers always get deep copies.
//!
//! A slot removed by [`ConversationStore::sweep`] is marked retired while its
//! user lock is held; a writer that fetched the slot just before removal sees
//! the flag after locking and retries against a fresh slot, so no write lands
//! in an orphaned history.

use crate::router::TriggerLabel;
use crate::upstream::{ChatMessage, Role, ServiceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as UserLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opaque, stable identifier of a conversation participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A single entry in a conversation; never modified once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Upstream service that produced this entry (assistant entries only)
    pub service_used: Option<ServiceId>,
    pub trigger_labels: Vec<TriggerLabel>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            service_used: None,
            trigger_labels: Vec::new(),
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        service_used: ServiceId,
        trigger_labels: Vec<TriggerLabel>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            service_used: Some(service_used),
            trigger_labels,
        }
    }
}

/// Per-user history, owned by the store
#[derive(Debug)]
struct ConversationState {
    entries: VecDeque<ConversationEntry>,
    last_active: DateTime<Utc>,
}

#[derive(Debug)]
struct UserSlot {
    state: ConversationState,
    retired: bool,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationStats {
    pub users: usize,
    pub total_entries: usize,
    pub registered_locks: usize,
}

/// Latest `service_used` among the last `lookback` entries, most recent first
pub fn recent_service(entries: &[ConversationEntry], lookback: usize) -> Option<ServiceId> {
    entries
        .iter()
        .rev()
        .take(lookback)
        .find_map(|entry| entry.service_used)
}

/// Last `limit` user/assistant entries as upstream context, metadata stripped
pub fn context_messages(entries: &[ConversationEntry], limit: usize) -> Vec<ChatMessage> {
    let relevant: Vec<&ConversationEntry> = entries
        .iter()
        .filter(|e| matches!(e.role, Role::User | Role::Assistant))
        .collect();
    let skip = relevant.len().saturating_sub(limit);

    relevant
        .into_iter()
        .skip(skip)
        .map(|e| ChatMessage::new(e.role, e.content.clone()))
        .collect()
}

/// Concurrent conversation store
pub struct ConversationStore {
    slots: Mutex<HashMap<UserId, Arc<UserLock<UserSlot>>>>,
    max_entries: usize,
}

impl ConversationStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn existing_slot(&self, user: &UserId) -> Option<Arc<UserLock<UserSlot>>> {
        self.slots.lock().get(user).cloned()
    }

    fn slot_or_create(&self, user: &UserId) -> Arc<UserLock<UserSlot>> {
        self.slots
            .lock()
            .entry(user.clone())
            .or_insert_with(|| {
                debug!(user = %user, "Creating conversation");
                Arc::new(UserLock::new(UserSlot {
                    state: ConversationState {
                        entries: VecDeque::new(),
                        last_active: Utc::now(),
                    },
                    retired: false,
                }))
            })
            .clone()
    }

    /// Deep copy of a user's history, oldest first
    pub async fn snapshot(&self, user: &UserId) -> Vec<ConversationEntry> {
        let Some(slot) = self.existing_slot(user) else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        if guard.retired {
            return Vec::new();
        }
        guard.state.entries.iter().cloned().collect()
    }

    /// Append one entry, pruning the oldest beyond the configured maximum
    pub async fn append(&self, user: &UserId, entry: ConversationEntry) {
        self.append_all(user, vec![entry]).await;
    }

    /// Append a user turn and its answer under a single lock acquisition
    pub async fn append_exchange(
        &self,
        user: &UserId,
        question: ConversationEntry,
        answer: ConversationEntry,
    ) {
        self.append_all(user, vec![question, answer]).await;
    }

    async fn append_all(&self, user: &UserId, entries: Vec<ConversationEntry>) {
        let entries: Vec<ConversationEntry> = entries
            .into_iter()
            .filter_map(|mut entry| {
                let trimmed = entry.content.trim();
                if trimmed.is_empty() {
                    warn!(user = %user, "Ignoring empty conversation entry");
                    return None;
                }
                if trimmed.len() != entry.content.len() {
                    entry.content = trimmed.to_string();
                }
                Some(entry)
            })
            .collect();
        if entries.is_empty() {
            return;
        }

        loop {
            let slot = self.slot_or_create(user);
            let mut guard = slot.lock().await;
            if guard.retired {
                // Swept between lookup and lock
                continue;
            }

            let state = &mut guard.state;
            state.entries.extend(entries);
            let overflow = state.entries.len().saturating_sub(self.max_entries);
            if overflow > 0 {
                state.entries.drain(..overflow);
                debug!(user = %user, pruned = overflow, "Pruned old conversation entries");
            }
            state.last_active = Utc::now();

            debug!(user = %user, total = state.entries.len(), "Appended conversation entries");
            return;
        }
    }

    /// Latest service recorded within the last `lookback` entries
    pub async fn recent_service(&self, user: &UserId, lookback: usize) -> Option<ServiceId> {
        let slot = self.existing_slot(user)?;
        let guard = slot.lock().await;
        if guard.retired {
            return None;
        }
        guard
            .state
            .entries
            .iter()
            .rev()
            .take(lookback)
            .find_map(|entry| entry.service_used)
    }

    /// Last `limit` entries formatted as upstream context
    pub async fn context(&self, user: &UserId, limit: usize) -> Vec<ChatMessage> {
        let entries = self.snapshot(user).await;
        context_messages(&entries, limit)
    }

    /// Clear conversation history for a user
    pub async fn clear(&self, user: &UserId) -> usize {
        let Some(slot) = self.existing_slot(user) else {
            return 0;
        };
        let mut guard = slot.lock().await;
        let removed = guard.state.entries.len();
        guard.state.entries.clear();
        info!(user = %user, removed, "Cleared conversation");
        removed
    }

    /// Remove users idle longer than `idle_threshold` as of `now`.
    ///
    /// Users whose lock is currently held are skipped; they are active.
    pub fn sweep(&self, now: DateTime<Utc>, idle_threshold: Duration) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();

        slots.retain(|user, slot| {
            let Ok(mut guard) = slot.try_lock() else {
                return true;
            };
            let idle = (now - guard.state.last_active)
                .to_std()
                .map(|elapsed| elapsed > idle_threshold)
                .unwrap_or(false);
            if idle {
                guard.retired = true;
                debug!(user = %user, "Swept idle conversation");
            }
            !idle
        });

        let removed = before - slots.len();
        if removed > 0 {
            info!(removed, remaining = slots.len(), "Conversation sweep complete");
        }
        removed
    }

    /// Get store statistics
    pub async fn stats(&self) -> ConversationStats {
        let slots: Vec<Arc<UserLock<UserSlot>>> = self.slots.lock().values().cloned().collect();
        let mut stats = ConversationStats {
            registered_locks: slots.len(),
            ..Default::default()
        };

        for slot in slots {
            let guard = slot.lock().await;
            if !guard.retired && !guard.state.entries.is_empty() {
                stats.users += 1;
                stats.total_entries += guard.state.entries.len();
            }
        }
        stats
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        idle_threshold: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep(Utc::now(), idle_threshold);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Conversation sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
