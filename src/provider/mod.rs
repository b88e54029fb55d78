//! Provider client capability and the factory that picks an implementation per account

pub mod gmail;
pub mod imap;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{GmailConfig, ImapConfig};
use crate::error::{ProviderFailure, Result, TriageError};
use crate::models::{Account, Credentials, EmailMessage, ProviderKind, SearchCriteria};

pub use gmail::GmailProvider;
pub use imap::ImapProvider;

/// Operations every mail backend supports
///
/// Implementations are bound to a single account and hold no persisted state.
/// Auth refresh is handled internally.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// At most `criteria.max_results` messages matching the query, in the
    /// provider's own relevance order (newest first)
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<EmailMessage>>;

    /// Heuristic probe for likely-urgent mail, deduplicated, at most `limit` messages
    async fn fetch_urgent(&self, limit: usize) -> Result<Vec<EmailMessage>>;

    /// Cheap credential/connectivity check; false on any failure
    async fn validate_connection(&self) -> bool;

    async fn list_mailboxes(&self) -> Result<Vec<String>>;
}

/// Resolves a provider kind plus decrypted credentials to a client instance
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(
        &self,
        account: &Account,
        credentials: Credentials,
    ) -> Result<Arc<dyn ProviderClient>>;
}

/// Factory for the built-in Gmail and IMAP clients
#[derive(Debug, Clone)]
pub struct DefaultProviderFactory {
    gmail: GmailConfig,
    imap: ImapConfig,
    snippet_length: usize,
}

impl DefaultProviderFactory {
    pub fn new(gmail: GmailConfig, imap: ImapConfig, snippet_length: usize) -> Self {
        Self {
            gmail,
            imap,
            snippet_length,
        }
    }
}

#[async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn create(
        &self,
        account: &Account,
        credentials: Credentials,
    ) -> Result<Arc<dyn ProviderClient>> {
        match credentials {
            Credentials::Gmail(creds) => {
                let client = GmailProvider::connect(
                    &account.id,
                    &creds,
                    &account.default_mailbox,
                    &self.gmail,
                    self.snippet_length,
                )
                .await?;
                Ok(Arc::new(client))
            }
            Credentials::Imap(creds) => Ok(Arc::new(ImapProvider::new(
                &account.id,
                creds,
                &account.default_mailbox,
                &self.imap,
                self.snippet_length,
            ))),
        }
    }
}

/// Execute an async operation with exponential backoff retry on transient failures
pub(crate) async fn with_retry<T, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> std::result::Result<T, ProviderFailure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ProviderFailure>>,
{
    let mut delay = base_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts <= max_retries => {
                let wait = match &e {
                    ProviderFailure::RateLimited { retry_after } => {
                        std::cmp::max(delay, Duration::from_secs(*retry_after))
                    }
                    _ => delay,
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a provider failure to the crate error, tagging it with account and provider
pub(crate) fn provider_error(
    account_id: &str,
    kind: ProviderKind,
) -> impl Fn(ProviderFailure) -> TriageError + '_ {
    move |failure| TriageError::provider(account_id, kind.as_str(), failure)
}

/// Collapse whitespace and cut to `max_chars` characters
pub fn normalize_snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        collapsed.chars().take(max_chars).collect()
    }
}

/// Keep the first occurrence of each message id, preserving order
pub fn dedupe_by_id(messages: Vec<EmailMessage>) -> Vec<EmailMessage> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}
