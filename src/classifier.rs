//! Deterministic urgency/importance scoring
//!
//! Scoring runs in a fixed order: urgent keywords, important keywords, unread,
//! attachments, provider importance labels, recency. Reasons are appended in
//! that same order, so identical input always yields identical output.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ClassificationConfig;
use crate::models::{Classification, EmailMessage, KeywordPrefs};

/// Score at or above which a message is flagged
pub const THRESHOLD: f64 = 0.3;

const KEYWORD_WEIGHT: f64 = 0.15;
const KEYWORD_CAP: f64 = 0.5;
const UNREAD_URGENCY: f64 = 0.2;
const UNREAD_IMPORTANCE: f64 = 0.1;
const ATTACHMENT_IMPORTANCE: f64 = 0.25;
const LABEL_BONUS: f64 = 0.3;
const RECENT_URGENCY: f64 = 0.15;

/// Labels that mark a message as important or starred
const PRIORITY_LABELS: &[&str] = &["IMPORTANT", "STARRED"];

static DEFAULT_URGENT_KEYWORDS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "urgent",
        "asap",
        "immediately",
        "emergency",
        "critical",
        "action required",
        "deadline",
        "time sensitive",
        "overdue",
        "final notice",
        "expires today",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
});

static DEFAULT_IMPORTANT_KEYWORDS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "important",
        "invoice",
        "payment",
        "contract",
        "meeting",
        "approval",
        "review",
        "confidential",
        "legal",
        "please respond",
        "security",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
});

/// One keyword with its whole-word matcher
#[derive(Debug, Clone)]
struct KeywordMatcher {
    keyword: String,
    pattern: Regex,
}

impl KeywordMatcher {
    fn new(keyword: &str) -> Option<Self> {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return None;
        }

        // \b only makes sense next to word characters
        let starts_word = keyword.chars().next().map(is_word_char).unwrap_or(false);
        let ends_word = keyword.chars().last().map(is_word_char).unwrap_or(false);
        let pattern = format!(
            "{}{}{}",
            if starts_word { r"\b" } else { "" },
            regex::escape(&keyword),
            if ends_word { r"\b" } else { "" }
        );

        Regex::new(&pattern)
            .ok()
            .map(|pattern| Self { keyword, pattern })
    }

    fn count(&self, haystack: &str) -> usize {
        self.pattern.find_iter(haystack).count()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn compile(keywords: &[String]) -> Vec<KeywordMatcher> {
    keywords.iter().filter_map(|k| KeywordMatcher::new(k)).collect()
}

/// Classification engine holding the fallback keyword lists
#[derive(Debug, Clone)]
pub struct Classifier {
    urgent: Vec<String>,
    important: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            urgent: DEFAULT_URGENT_KEYWORDS.clone(),
            important: DEFAULT_IMPORTANT_KEYWORDS.clone(),
        }
    }
}

impl Classifier {
    /// Use the configured global lists, falling back to the built-in ones when empty
    pub fn from_config(config: &ClassificationConfig) -> Self {
        let defaults = Self::default();
        Self {
            urgent: if config.urgent_keywords.is_empty() {
                defaults.urgent
            } else {
                config.urgent_keywords.clone()
            },
            important: if config.important_keywords.is_empty() {
                defaults.important
            } else {
                config.important_keywords.clone()
            },
        }
    }

    /// Compile the effective rules for one account
    pub fn rules_for(&self, prefs: &KeywordPrefs) -> Rules {
        let urgent = if prefs.urgent.is_empty() {
            &self.urgent
        } else {
            &prefs.urgent
        };
        let important = if prefs.important.is_empty() {
            &self.important
        } else {
            &prefs.important
        };

        Rules {
            urgent: compile(urgent),
            important: compile(important),
        }
    }

    /// Classify a single message; prefer `rules_for` + `Rules::classify` in loops
    pub fn classify(
        &self,
        message: &EmailMessage,
        prefs: &KeywordPrefs,
        now: DateTime<Utc>,
    ) -> Classification {
        self.rules_for(prefs).classify(message, now)
    }
}

/// Compiled keyword rules for one account
#[derive(Debug, Clone)]
pub struct Rules {
    urgent: Vec<KeywordMatcher>,
    important: Vec<KeywordMatcher>,
}

impl Rules {
    pub fn classify(&self, message: &EmailMessage, now: DateTime<Utc>) -> Classification {
        let text = format!("{} {}", message.subject, message.snippet).to_lowercase();
        let mut urgency = 0.0_f64;
        let mut importance = 0.0_f64;
        let mut reasons = Vec::new();

        for matcher in &self.urgent {
            let hits = matcher.count(&text);
            if hits > 0 {
                urgency += (hits as f64 * KEYWORD_WEIGHT).min(KEYWORD_CAP);
                reasons.push(format!("Urgent keyword '{}' ({}x)", matcher.keyword, hits));
            }
        }

        for matcher in &self.important {
            let hits = matcher.count(&text);
            if hits > 0 {
                importance += (hits as f64 * KEYWORD_WEIGHT).min(KEYWORD_CAP);
                reasons.push(format!("Important keyword '{}' ({}x)", matcher.keyword, hits));
            }
        }

        if !message.is_read {
            urgency += UNREAD_URGENCY;
            importance += UNREAD_IMPORTANCE;
            reasons.push("Unread".to_string());
        }

        if message.has_attachments {
            importance += ATTACHMENT_IMPORTANCE;
            reasons.push("Has attachments".to_string());
        }

        if message
            .labels
            .iter()
            .any(|l| PRIORITY_LABELS.iter().any(|p| l.eq_ignore_ascii_case(p)))
        {
            urgency = (urgency + LABEL_BONUS).min(1.0);
            importance = (importance + LABEL_BONUS).min(1.0);
            reasons.push("Marked important or starred".to_string());
        }

        let age = now.signed_duration_since(message.received_at);
        if age >= Duration::zero() && age <= Duration::hours(24) {
            urgency += RECENT_URGENCY;
            reasons.push("Received in the last 24 hours".to_string());
        }

        let urgency_score = urgency.clamp(0.0, 1.0);
        let importance_score = importance.clamp(0.0, 1.0);

        Classification {
            urgency_score,
            importance_score,
            is_urgent: urgency_score >= THRESHOLD,
            is_important: importance_score >= THRESHOLD,
            reasons,
        }
    }
}
