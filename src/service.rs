//! External operations over the registry and orchestrator
//!
//! Inputs are validated here before any provider is contacted, and every score
//! leaving the service is rounded to two decimals.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::classifier::Classifier;
use crate::config::{Config, MAX_RESULTS_LIMIT};
use crate::crypto::CredentialCipher;
use crate::db::Database;
use crate::error::{Result, TriageError};
use crate::models::{Account, AccountUpdate, ClassifiedResult, NewAccount};
use crate::orchestrator::{SearchOrchestrator, SearchRequest};
use crate::provider::{DefaultProviderFactory, ProviderFactory};
use crate::registry::AccountRegistry;

/// Arguments for `search_emails`
#[derive(Debug, Clone, Default)]
pub struct SearchEmailsParams {
    pub query: String,
    pub account_ids: Option<Vec<String>>,
    pub mailboxes: Vec<String>,
    pub max_results: Option<usize>,
    pub min_urgency_score: Option<f64>,
    pub min_importance_score: Option<f64>,
}

/// Arguments for `get_urgent_emails`
#[derive(Debug, Clone, Default)]
pub struct UrgentEmailsParams {
    /// Per category
    pub max_results: Option<usize>,
    pub account_ids: Option<Vec<String>>,
    pub only_unread: bool,
}

/// One classified message as reported to callers
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultView {
    pub account_id: String,
    pub account_name: String,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
    pub labels: Vec<String>,
    pub urgency_score: f64,
    pub importance_score: f64,
    pub is_urgent: bool,
    pub is_important: bool,
    pub reasons: Vec<String>,
}

impl From<&ClassifiedResult> for ResultView {
    fn from(result: &ClassifiedResult) -> Self {
        let m = &result.message;
        let c = &result.classification;
        Self {
            account_id: result.account_id.clone(),
            account_name: result.account_name.clone(),
            message_id: m.id.clone(),
            subject: m.subject.clone(),
            sender: m.sender.clone(),
            recipients: m.recipients.clone(),
            snippet: m.snippet.clone(),
            received_at: m.received_at,
            is_read: m.is_read,
            has_attachments: m.has_attachments,
            labels: m.labels.clone(),
            urgency_score: round2(c.urgency_score),
            importance_score: round2(c.importance_score),
            is_urgent: c.is_urgent,
            is_important: c.is_important,
            reasons: c.reasons.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    pub total: usize,
    pub results: Vec<ResultView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UrgentResponse {
    pub urgent: Vec<ResultView>,
    pub important: Vec<ResultView>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub account_id: String,
    pub name: String,
    pub reachable: bool,
}

/// Entry point for every externally exposed operation
pub struct TriageService {
    registry: Arc<AccountRegistry>,
    orchestrator: SearchOrchestrator,
    cache: ResultCache,
    default_max_results: usize,
    provider_timeout: Duration,
}

impl TriageService {
    /// Wire the service from configuration: open the database, derive the
    /// credential key from the environment and use the built-in providers
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Database::open(&config.storage.database_path)?;
        let cipher = CredentialCipher::from_env(&config.security)?;
        let factory = DefaultProviderFactory::new(
            config.gmail.clone(),
            config.imap.clone(),
            config.search.snippet_length,
        );
        Ok(Self::with_parts(config, db, cipher, Arc::new(factory)))
    }

    /// Wire the service from explicit parts
    pub fn with_parts(
        config: &Config,
        db: Database,
        cipher: CredentialCipher,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let registry = Arc::new(AccountRegistry::new(
            db.clone(),
            Arc::new(cipher),
            factory,
            config.imap.default_mailbox.clone(),
        ));
        let cache = ResultCache::new(db);
        let orchestrator = SearchOrchestrator::new(
            Arc::clone(&registry),
            cache.clone(),
            Classifier::from_config(&config.classification),
            config.search.provider_timeout(),
            config.search.max_concurrent_accounts,
        );

        Self {
            registry,
            orchestrator,
            cache,
            default_max_results: config.search.default_max_results,
            provider_timeout: config.search.provider_timeout(),
        }
    }

    pub fn add_account(&self, new: NewAccount) -> Result<Account> {
        self.registry.add_account(new)
    }

    pub fn remove_account(&self, id: &str) -> Result<()> {
        if self.registry.delete_account(id)? {
            Ok(())
        } else {
            Err(not_found(id))
        }
    }

    pub fn list_accounts(&self, include_inactive: bool) -> Result<Vec<Account>> {
        if include_inactive {
            self.registry.list_all()
        } else {
            self.registry.list_active()
        }
    }

    pub fn disable_account(&self, id: &str) -> Result<Account> {
        if !self.registry.disable(id)? {
            return Err(not_found(id));
        }
        self.require_account(id)
    }

    pub fn enable_account(&self, id: &str) -> Result<Account> {
        if !self.registry.enable(id)? {
            return Err(not_found(id));
        }
        self.require_account(id)
    }

    pub fn update_account(&self, id: &str, update: AccountUpdate) -> Result<Account> {
        self.registry
            .update_account(id, update)?
            .ok_or_else(|| not_found(id))
    }

    /// Search across accounts, then drop results below the score floors
    pub async fn search_emails(&self, params: SearchEmailsParams) -> Result<SearchResponse> {
        let max_results = self.check_max_results(params.max_results)?;
        let min_urgency = check_score_floor("min_urgency_score", params.min_urgency_score)?;
        let min_importance =
            check_score_floor("min_importance_score", params.min_importance_score)?;

        let request = SearchRequest {
            query: params.query.trim().to_string(),
            account_ids: params.account_ids,
            mailboxes: params
                .mailboxes
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            max_results,
        };

        let results = self.orchestrator.search_across_accounts(&request).await?;
        let results: Vec<ResultView> = results
            .iter()
            .filter(|r| {
                r.classification.urgency_score >= min_urgency
                    && r.classification.importance_score >= min_importance
            })
            .map(ResultView::from)
            .collect();

        info!(
            "Search {:?} returned {} result(s)",
            request.query,
            results.len()
        );
        Ok(SearchResponse {
            query: request.query,
            total: results.len(),
            results,
        })
    }

    /// Urgent and important buckets, optionally restricted to unread mail
    pub async fn get_urgent_emails(&self, params: UrgentEmailsParams) -> Result<UrgentResponse> {
        let limit = self.check_max_results(params.max_results)?;
        let buckets = self
            .orchestrator
            .get_urgent_and_important(limit, params.account_ids.as_deref())
            .await?;

        let keep = |r: &&ClassifiedResult| !params.only_unread || !r.message.is_read;
        Ok(UrgentResponse {
            urgent: buckets.urgent.iter().filter(keep).map(ResultView::from).collect(),
            important: buckets
                .important
                .iter()
                .filter(keep)
                .map(ResultView::from)
                .collect(),
        })
    }

    /// Check one account's connectivity and record the outcome
    pub async fn validate_account(&self, id: &str) -> Result<ValidationReport> {
        let account = self.require_account(id)?;
        let client = self.registry.client_for(&account).await?;

        let reachable = tokio::time::timeout(self.provider_timeout, client.validate_connection())
            .await
            .unwrap_or(false);

        if reachable {
            self.registry.record_sync_outcome(&account.id, None);
        } else {
            warn!("Account '{}' failed its connection check", account.name);
            self.registry
                .record_sync_outcome(&account.id, Some("connection check failed"));
        }

        Ok(ValidationReport {
            account_id: account.id,
            name: account.name,
            reachable,
        })
    }

    pub async fn list_mailboxes(&self, id: &str) -> Result<Vec<String>> {
        let account = self.require_account(id)?;
        let client = self.registry.client_for(&account).await?;
        match tokio::time::timeout(self.provider_timeout, client.list_mailboxes()).await {
            Ok(result) => result,
            Err(_) => Err(TriageError::provider(
                &account.id,
                account.provider.as_str(),
                crate::error::ProviderFailure::Timeout(self.provider_timeout.as_secs()),
            )),
        }
    }

    /// Cached classifications for one account, most urgent first
    pub fn cached_results(&self, account_id: &str) -> Result<Vec<ResultView>> {
        self.require_account(account_id)?;
        let results = self.cache.list_for_account(account_id)?;
        Ok(results.iter().map(ResultView::from).collect())
    }

    /// Look an account up by id, then friendly name, then email address
    pub fn find_account(&self, key: &str) -> Result<Account> {
        if let Some(account) = self.registry.get_by_id(key)? {
            return Ok(account);
        }
        if let Some(account) = self.registry.get_by_name(key)? {
            return Ok(account);
        }
        self.registry
            .get_by_email(key)?
            .ok_or_else(|| TriageError::NotFound(format!("no account matches '{}'", key)))
    }

    fn require_account(&self, id: &str) -> Result<Account> {
        self.registry.get_by_id(id)?.ok_or_else(|| not_found(id))
    }

    fn check_max_results(&self, requested: Option<usize>) -> Result<usize> {
        let value = requested.unwrap_or(self.default_max_results);
        if value == 0 || value > MAX_RESULTS_LIMIT {
            return Err(TriageError::Validation(format!(
                "max_results must be between 1 and {}, got {}",
                MAX_RESULTS_LIMIT, value
            )));
        }
        Ok(value)
    }
}

fn not_found(id: &str) -> TriageError {
    TriageError::NotFound(format!("account {}", id))
}

fn check_score_floor(name: &str, value: Option<f64>) -> Result<f64> {
    match value {
        None => Ok(0.0),
        Some(v) if (0.0..=1.0).contains(&v) => Ok(v),
        Some(v) => Err(TriageError::Validation(format!(
            "{} must be between 0 and 1, got {}",
            name, v
        ))),
    }
}

/// Two-decimal precision for reported scores
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(0.30000000000000004), 0.3);
        assert_eq!(round2(0.456), 0.46);
        assert_eq!(round2(1.0), 1.0);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_check_score_floor() {
        assert_eq!(check_score_floor("x", None).unwrap(), 0.0);
        assert_eq!(check_score_floor("x", Some(0.5)).unwrap(), 0.5);
        assert!(matches!(
            check_score_floor("x", Some(1.5)),
            Err(TriageError::Validation(_))
        ));
        assert!(check_score_floor("x", Some(f64::NAN)).is_err());
    }
}
