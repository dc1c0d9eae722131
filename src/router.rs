//! Turn Router
//!
//! Classifies an inbound message into a target upstream service.
//! Rules are evaluated strictly in order and the first match picks the
//! service; every rule that matched is still reported as a trigger label.

use crate::upstream::ServiceId;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a turn was routed where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerLabel {
    FollowUp,
    Url,
    TimeSensitive,
    Entity,
    Conversational,
    Factual,
    Default,
}

impl TriggerLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerLabel::FollowUp => "follow_up",
            TriggerLabel::Url => "url",
            TriggerLabel::TimeSensitive => "time_sensitive",
            TriggerLabel::Entity => "entity",
            TriggerLabel::Conversational => "conversational",
            TriggerLabel::Factual => "factual",
            TriggerLabel::Default => "default",
        }
    }

    /// Answers to these turns go stale quickly
    pub fn is_volatile(&self) -> bool {
        matches!(self, TriggerLabel::Url | TriggerLabel::TimeSensitive)
    }
}

impl fmt::Display for TriggerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing result, computed fresh per turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub service: ServiceId,
    /// Matched labels in rule order; the first one decided the service
    pub trigger_labels: Vec<TriggerLabel>,
    pub is_followup: bool,
}

impl RoutingDecision {
    pub fn label_names(&self) -> Vec<&'static str> {
        self.trigger_labels.iter().map(TriggerLabel::as_str).collect()
    }

    pub fn has_volatile_label(&self) -> bool {
        self.trigger_labels.iter().any(TriggerLabel::is_volatile)
    }
}

// Pattern sets
static FOLLOW_UP_PATTERNS: &[&str] = &[
    r"(?i)\btell\s+me\s+more\b",
    r"(?i)\bmore\s+(about|on)\s+(that|this|it|them)\b",
    r"(?i)^\s*what\s+about\b",
    r"(?i)^\s*(and|also)\s+(also\s+)?(what|how|why|who|when|where)\b",
    r"(?i)\bwhy\s+is\s+that\b",
    r"(?i)\b(elaborate|expand\s+on|go\s+on|continue)\b",
    r"(?i)\b(what\s+else|anything\s+else)\b",
    r"(?i)\b(you\s+(said|mentioned)|as\s+you\s+said)\b",
    r"(?i)\b(the\s+(first|second|third|last)\s+one)\b",
];

static URL_PATTERNS: &[&str] = &[r"(?i)\bhttps?://[^\s]+", r"(?i)\bwww\.[a-z0-9-]+\.[a-z]{2,}"];

static TIME_SENSITIVE_PATTERNS: &[&str] = &[
    r"(?i)\b(current|now|today|yesterday|tomorrow|this\s+(morning|afternoon|evening)|tonight)\b",
    r"(?i)\b(latest|recent|breaking|live|real\s*time)\b",
    r"(?i)\b(what\s+time|what\s+date|when\s+is)\b",
    r"(?i)\b(stock\s+(price|market)|crypto\s+price)\b",
];

// Case-sensitive: capitalisation is the signal
static ENTITY_PATTERNS: &[&str] = &[
    r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b",
    r"\b\d{4}\b",
    r"\$[0-9,]+(?:\.[0-9]{2})?\b",
];

static CONVERSATIONAL_PATTERNS: &[&str] = &[
    r"(?i)\b(tell\s+me\s+(a|an)|talk\s+about)\b",
    r"(?i)\b(i\s+(think|feel|believe|wonder))\b",
    r"(?i)\b(what\s+do\s+you\s+(think|feel|recommend))\b",
    r"(?i)\b(can\s+you\s+(help|write|create|make))\b",
    r"(?i)\b(write\s+(me\s+)?(a|an)|compose|poem|story|joke)\b",
    r"(?i)^\s*(hi|hello|hey|thanks|thank\s+you|good\s+(morning|evening))\b",
    r"(?i)\bhow\s+are\s+you\b",
];

static FACTUAL_PATTERNS: &[&str] = &[
    r"(?i)\b(what\s+is|define|explain|describe)\b",
    r"(?i)\b(how\s+(do|does|to|can|much|many))\b",
    r"(?i)\b(where\s+(is|are|can|do))\b",
    r"(?i)\b(when\s+(is|are|was|were|did))\b",
    r"(?i)\b(who\s+(is|are|was|were))\b",
    r"(?i)\b(which\s+(is|are))\b",
];

fn pattern_set(patterns: &[&str]) -> RegexSet {
    RegexSet::new(patterns).unwrap()
}

static FOLLOW_UP: Lazy<RegexSet> = Lazy::new(|| pattern_set(FOLLOW_UP_PATTERNS));
static URL: Lazy<RegexSet> = Lazy::new(|| pattern_set(URL_PATTERNS));
static TIME_SENSITIVE: Lazy<RegexSet> = Lazy::new(|| pattern_set(TIME_SENSITIVE_PATTERNS));
static ENTITY: Lazy<RegexSet> = Lazy::new(|| pattern_set(ENTITY_PATTERNS));
static CONVERSATIONAL: Lazy<RegexSet> = Lazy::new(|| pattern_set(CONVERSATIONAL_PATTERNS));
static FACTUAL: Lazy<RegexSet> = Lazy::new(|| pattern_set(FACTUAL_PATTERNS));

pub fn is_follow_up(text: &str) -> bool {
    FOLLOW_UP.is_match(text)
}

pub fn has_url(text: &str) -> bool {
    URL.is_match(text)
}

pub fn is_time_sensitive(text: &str) -> bool {
    TIME_SENSITIVE.is_match(text)
}

pub fn has_entities(text: &str) -> bool {
    ENTITY.is_match(text)
}

pub fn is_conversational(text: &str) -> bool {
    CONVERSATIONAL.is_match(text)
}

pub fn is_factual(text: &str) -> bool {
    FACTUAL.is_match(text)
}

/// Inputs visible to every rule
struct Signal<'a> {
    text: &'a str,
    recent_service: Option<ServiceId>,
    word_count: usize,
    entity_min_words: usize,
}

enum Target {
    Service(ServiceId),
    /// Whatever service answered recently
    Recent,
}

struct Rule {
    label: TriggerLabel,
    target: Target,
    matches: fn(&Signal<'_>) -> bool,
}

static RULES: &[Rule] = &[
    Rule {
        label: TriggerLabel::FollowUp,
        target: Target::Recent,
        matches: |s| s.recent_service.is_some() && is_follow_up(s.text),
    },
    Rule {
        label: TriggerLabel::Url,
        target: Target::Service(ServiceId::WebSearch),
        matches: |s| has_url(s.text),
    },
    Rule {
        label: TriggerLabel::TimeSensitive,
        target: Target::Service(ServiceId::WebSearch),
        matches: |s| is_time_sensitive(s.text),
    },
    Rule {
        label: TriggerLabel::Entity,
        target: Target::Service(ServiceId::WebSearch),
        matches: |s| s.word_count > s.entity_min_words && has_entities(s.text),
    },
    Rule {
        label: TriggerLabel::Conversational,
        target: Target::Service(ServiceId::Generalist),
        matches: |s| is_conversational(s.text),
    },
    Rule {
        label: TriggerLabel::Factual,
        target: Target::Service(ServiceId::WebSearch),
        matches: |s| is_factual(s.text),
    },
];

/// Rule-chain classifier
#[derive(Debug, Clone)]
pub struct Router {
    entity_min_words: usize,
}

impl Router {
    pub fn new(entity_min_words: usize) -> Self {
        Self { entity_min_words }
    }

    /// Classify `text`, given the service that answered this user recently
    pub fn classify(&self, text: &str, recent_service: Option<ServiceId>) -> RoutingDecision {
        let signal = Signal {
            text,
            recent_service,
            word_count: text.split_whitespace().count(),
            entity_min_words: self.entity_min_words,
        };

        let mut service = None;
        let mut trigger_labels = Vec::new();
        for rule in RULES {
            if !(rule.matches)(&signal) {
                continue;
            }
            trigger_labels.push(rule.label);
            if service.is_none() {
                service = match rule.target {
                    Target::Service(id) => Some(id),
                    Target::Recent => recent_service,
                };
            }
        }

        let service = service.unwrap_or_else(|| {
            trigger_labels.push(TriggerLabel::Default);
            ServiceId::Generalist
        });
        let decision = RoutingDecision {
            service,
            is_followup: trigger_labels.first() == Some(&TriggerLabel::FollowUp),
            trigger_labels,
        };

        debug!(
            service = %decision.service,
            labels = ?decision.label_names(),
            words = signal.word_count,
            "Classified turn"
        );
        decision
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_up_reuses_recent_service() {
        let router = Router::default();

        let result = router.classify("tell me more about that", Some(ServiceId::WebSearch));
        assert_eq!(result.service, ServiceId::WebSearch);
        assert!(result.is_followup);
        assert_eq!(result.trigger_labels[0], TriggerLabel::FollowUp);

        let result = router.classify("tell me more about that", Some(ServiceId::Generalist));
        assert_eq!(result.service, ServiceId::Generalist);
    }

    #[test]
    fn test_follow_up_without_history_falls_through() {
        let router = Router::default();

        let result = router.classify("what about the latest results?", None);
        assert!(!result.is_followup);
        assert_eq!(result.service, ServiceId::WebSearch);
        assert_eq!(result.trigger_labels[0], TriggerLabel::TimeSensitive);
    }

    #[test]
    fn test_url_routes_to_web_search() {
        let router = Router::default();

        let result = router.classify("summarize https://example.com/post please", None);
        assert_eq!(result.service, ServiceId::WebSearch);
        assert_eq!(result.trigger_labels[0], TriggerLabel::Url);
        assert!(result.has_volatile_label());
    }

    #[test]
    fn test_priority_beats_later_rules() {
        let router = Router::default();

        // Creative request mentioning "today": time sensitivity wins
        let result = router.classify("write me a poem about today", None);
        assert_eq!(result.service, ServiceId::WebSearch);
        assert_eq!(
            result.trigger_labels,
            vec![TriggerLabel::TimeSensitive, TriggerLabel::Conversational]
        );
    }

    #[test]
    fn test_entity_requires_word_count() {
        let router = Router::new(10);

        let short = router.classify("Ada Lovelace in 1843", None);
        assert_eq!(short.service, ServiceId::Generalist);
        assert_eq!(short.trigger_labels, vec![TriggerLabel::Default]);

        let long = router.classify(
            "I keep reading about Ada Lovelace and her notes on the engine from 1843",
            None,
        );
        assert_eq!(long.service, ServiceId::WebSearch);
        assert_eq!(long.trigger_labels[0], TriggerLabel::Entity);
    }

    #[test]
    fn test_conversational_and_factual() {
        let router = Router::default();

        let result = router.classify("Hello! How are you?", None);
        assert_eq!(result.service, ServiceId::Generalist);
        assert_eq!(result.trigger_labels[0], TriggerLabel::Conversational);

        let result = router.classify("what is a monad", None);
        assert_eq!(result.service, ServiceId::WebSearch);
        assert_eq!(result.trigger_labels, vec![TriggerLabel::Factual]);
    }

    #[test]
    fn test_default_to_generalist() {
        let router = Router::default();

        let result = router.classify("pineapple on pizza", None);
        assert_eq!(result.service, ServiceId::Generalist);
        assert_eq!(result.trigger_labels, vec![TriggerLabel::Default]);
        assert!(!result.is_followup);
    }

    #[test]
    fn test_pattern_sets() {
        assert!(is_time_sensitive("any breaking news?"));
        assert!(is_time_sensitive("BTC crypto price"));
        assert!(!is_time_sensitive("a story about dragons"));
        assert!(has_entities("worth $1,200.50"));
        assert!(!has_entities("no names here"));
        assert!(is_follow_up("Can you elaborate?"));
        assert!(has_url("see www.rust-lang.org"));
    }
}
