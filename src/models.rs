use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TriageError;

/// Email backend kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Imap => "imap",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gmail" => Ok(ProviderKind::Gmail),
            "imap" => Ok(ProviderKind::Imap),
            other => Err(TriageError::Validation(format!(
                "Unknown provider '{}'. Must be 'gmail' or 'imap'",
                other
            ))),
        }
    }
}

/// A registered mailbox. Never carries credentials; those stay encrypted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: String,
    pub provider: ProviderKind,
    pub active: bool,
    pub default_mailbox: String,
    pub urgent_keywords: Vec<String>,
    pub important_keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}

impl Account {
    pub fn keyword_prefs(&self) -> KeywordPrefs {
        KeywordPrefs {
            urgent: self.urgent_keywords.clone(),
            important: self.important_keywords.clone(),
        }
    }
}

/// Per-account keyword overrides; empty lists fall back to the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordPrefs {
    pub urgent: Vec<String>,
    pub important: Vec<String>,
}

/// Provider-specific credential blob. Its shape is determined by the provider kind.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Credentials {
    Gmail(GmailCredentials),
    Imap(ImapCredentials),
}

impl Credentials {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Credentials::Gmail(_) => ProviderKind::Gmail,
            Credentials::Imap(_) => ProviderKind::Imap,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Gmail(c) => c.fmt(f),
            Credentials::Imap(c) => c.fmt(f),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GmailCredentials {
    pub refresh_token: String,
    /// OAuth client overriding the one in the config file
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl fmt::Debug for GmailCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailCredentials")
            .field("refresh_token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
}

fn default_use_tls() -> bool {
    true
}

impl fmt::Debug for ImapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Input for registering an account. Provider fields are optional here and
/// checked against the provider kind during registration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub provider: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: Option<bool>,
    #[serde(default)]
    pub default_mailbox: Option<String>,
    #[serde(default)]
    pub urgent_keywords: Vec<String>,
    #[serde(default)]
    pub important_keywords: Vec<String>,
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("provider", &self.provider)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Partial update; `None` fields keep their stored values
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub default_mailbox: Option<String>,
    #[serde(default)]
    pub urgent_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub important_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: Option<bool>,
}

impl AccountUpdate {
    /// True when any credential field is set
    pub fn touches_credentials(&self) -> bool {
        self.refresh_token.is_some()
            || self.client_id.is_some()
            || self.client_secret.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.username.is_some()
            || self.password.is_some()
            || self.use_tls.is_some()
    }
}

impl fmt::Debug for AccountUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountUpdate")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("default_mailbox", &self.default_mailbox)
            .field("touches_credentials", &self.touches_credentials())
            .finish_non_exhaustive()
    }
}

/// A message as returned by a provider. Transient; only its classification is cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    /// Provider-native id, unique only within its account
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
    pub labels: Vec<String>,
}

/// Search request handed to a provider client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub query: String,
    pub max_results: usize,
    pub mailbox: Option<String>,
}

/// Output of the classification engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub urgency_score: f64,
    pub importance_score: f64,
    pub is_urgent: bool,
    pub is_important: bool,
    pub reasons: Vec<String>,
}

/// Cached outcome of classifying one message for one account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifiedResult {
    pub account_id: String,
    pub account_name: String,
    pub message: EmailMessage,
    pub classification: Classification,
    pub cached_at: DateTime<Utc>,
}

impl ClassifiedResult {
    /// Composite cache key
    pub fn key(&self) -> (&str, &str) {
        (&self.account_id, &self.message.id)
    }

    /// Ranking score: urgency weighted double
    pub fn rank_score(&self) -> f64 {
        self.classification.urgency_score * 2.0 + self.classification.importance_score
    }
}

/// Bucketed result of the urgent/important probe
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UrgentAndImportant {
    pub urgent: Vec<ClassifiedResult>,
    pub important: Vec<ClassifiedResult>,
}
