//! Cross-account fan-out: resolve, query concurrently, classify, cache, rank
//!
//! Per-account calls run concurrently on the caller's task and are buffered in
//! full before ranking, so output order depends only on scores. Nothing is
//! spawned: dropping the returned future cancels every in-flight call, and the
//! cache is only written once all accounts have answered.

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::classifier::Classifier;
use crate::error::{NoAccountsReason, ProviderFailure, Result, TriageError};
use crate::models::{
    Account, ClassifiedResult, EmailMessage, SearchCriteria, UrgentAndImportant,
};
use crate::provider::{dedupe_by_id, ProviderClient};
use crate::registry::AccountRegistry;

/// A cross-account search
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Explicit account scope; `None` means every active account
    pub account_ids: Option<Vec<String>>,
    /// Mailboxes to search in each account; empty means the account default
    pub mailboxes: Vec<String>,
    pub max_results: usize,
}

/// One account's messages plus the failures that did not sink the whole account
#[derive(Debug, Default)]
struct Fetched {
    messages: Vec<EmailMessage>,
    partial_failures: Vec<String>,
}

impl From<Vec<EmailMessage>> for Fetched {
    fn from(messages: Vec<EmailMessage>) -> Self {
        Self {
            messages,
            partial_failures: Vec::new(),
        }
    }
}

pub struct SearchOrchestrator {
    registry: Arc<AccountRegistry>,
    cache: ResultCache,
    classifier: Classifier,
    timeout: Duration,
    max_concurrent: usize,
}

impl SearchOrchestrator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        cache: ResultCache,
        classifier: Classifier,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            classifier,
            timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Search every targeted account and return one ranked list
    pub async fn search_across_accounts(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<ClassifiedResult>> {
        let accounts = self.resolve_accounts(request.account_ids.as_deref())?;
        let per_account = request.max_results.saturating_mul(2);
        let mailboxes: Vec<Option<String>> = if request.mailboxes.is_empty() {
            vec![None]
        } else {
            request.mailboxes.iter().cloned().map(Some).collect()
        };

        info!(
            "Searching {} account(s) for {:?} (max {})",
            accounts.len(),
            request.query,
            request.max_results
        );

        let batches = self
            .fan_out(&accounts, |client| {
                let criteria: Vec<SearchCriteria> = mailboxes
                    .iter()
                    .map(|mailbox| SearchCriteria {
                        query: request.query.clone(),
                        max_results: per_account,
                        mailbox: mailbox.clone(),
                    })
                    .collect();
                async move {
                    let outcomes = join_all(criteria.iter().map(|c| client.search(c))).await;
                    merge_mailboxes(&criteria, outcomes)
                }
            })
            .await?;

        let mut results = self.classify_and_cache(batches);
        results.sort_by(compare_by(|r| r.rank_score()));
        results.truncate(request.max_results);
        Ok(results)
    }

    /// Probe every targeted account for likely-urgent mail and bucket it
    pub async fn get_urgent_and_important(
        &self,
        limit: usize,
        account_ids: Option<&[String]>,
    ) -> Result<UrgentAndImportant> {
        let accounts = self.resolve_accounts(account_ids)?;
        let per_account = limit.saturating_mul(2);

        info!(
            "Fetching urgent mail from {} account(s) (limit {})",
            accounts.len(),
            limit
        );

        let batches = self
            .fan_out(&accounts, |client| async move {
                client.fetch_urgent(per_account).await.map(Fetched::from)
            })
            .await?;

        let results = self.classify_and_cache(batches);

        let mut urgent: Vec<ClassifiedResult> = results
            .iter()
            .filter(|r| r.classification.is_urgent)
            .cloned()
            .collect();
        let mut important: Vec<ClassifiedResult> = results
            .into_iter()
            .filter(|r| r.classification.is_important)
            .collect();

        urgent.sort_by(compare_by(|r| r.classification.urgency_score));
        important.sort_by(compare_by(|r| r.classification.importance_score));
        urgent.truncate(limit);
        important.truncate(limit);

        Ok(UrgentAndImportant { urgent, important })
    }

    /// Explicit ids (unknown or inactive ones dropped), else all active accounts
    pub fn resolve_accounts(&self, account_ids: Option<&[String]>) -> Result<Vec<Account>> {
        let accounts = match account_ids {
            Some(ids) if !ids.is_empty() => {
                let mut seen = HashSet::new();
                let mut resolved = Vec::new();
                for id in ids.iter().filter(|id| seen.insert(id.as_str())) {
                    match self.registry.get_by_id(id)? {
                        Some(account) if account.active => resolved.push(account),
                        Some(_) => debug!("Skipping disabled account {}", id),
                        None => debug!("Skipping unknown account id {}", id),
                    }
                }
                if resolved.is_empty() {
                    return Err(self.empty_scope(NoAccountsReason::NoneResolved)?);
                }
                resolved
            }
            _ => {
                let active = self.registry.list_active()?;
                if active.is_empty() {
                    return Err(self.empty_scope(NoAccountsReason::NoneActive)?);
                }
                active
            }
        };
        Ok(accounts)
    }

    /// Prefer "none configured" whenever the registry is empty
    fn empty_scope(&self, reason: NoAccountsReason) -> Result<TriageError> {
        if self.registry.list_all()?.is_empty() {
            Ok(TriageError::NoAccounts(NoAccountsReason::NoneConfigured))
        } else {
            Ok(TriageError::NoAccounts(reason))
        }
    }

    /// Run `call` against every account concurrently under the timeout.
    ///
    /// Failed or timed-out accounts are logged, recorded and skipped. Fails
    /// only when no account succeeded.
    async fn fan_out<'a, F, Fut>(
        &'a self,
        accounts: &'a [Account],
        call: F,
    ) -> Result<Vec<(&'a Account, Vec<EmailMessage>)>>
    where
        F: Fn(Arc<dyn ProviderClient>) -> Fut,
        Fut: Future<Output = Result<Fetched>>,
    {
        let call = &call;
        let outcomes: Vec<(&Account, Result<Fetched>)> = stream::iter(accounts)
            .map(|account| async move {
                let attempt = async {
                    let client = self.registry.client_for(account).await?;
                    call(client).await
                };
                let outcome = match tokio::time::timeout(self.timeout, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TriageError::provider(
                        &account.id,
                        account.provider.as_str(),
                        ProviderFailure::Timeout(self.timeout.as_secs()),
                    )),
                };
                (account, outcome)
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut batches = Vec::with_capacity(outcomes.len());
        let mut failures = 0;
        for (account, outcome) in outcomes {
            match outcome {
                Ok(fetched) => {
                    debug!(
                        "Account '{}' returned {} message(s)",
                        account.name,
                        fetched.messages.len()
                    );
                    if fetched.partial_failures.is_empty() {
                        self.registry.record_sync_outcome(&account.id, None);
                    } else {
                        let summary = fetched.partial_failures.join("; ");
                        warn!(
                            "Account '{}' ({}) partially failed: {}",
                            account.name, account.id, summary
                        );
                        self.registry
                            .record_sync_outcome(&account.id, Some(&summary));
                    }
                    batches.push((account, fetched.messages));
                }
                Err(e) => {
                    warn!("Skipping account '{}' ({}): {}", account.name, account.id, e);
                    self.registry
                        .record_sync_outcome(&account.id, Some(&e.to_string()));
                    failures += 1;
                }
            }
        }

        if batches.is_empty() {
            return Err(TriageError::NoAccounts(NoAccountsReason::AllUnreachable));
        }
        if failures > 0 {
            info!(
                "{} of {} account(s) failed; returning partial results",
                failures,
                accounts.len()
            );
        }
        Ok(batches)
    }

    /// Deduplicate on (account id, message id), classify, and upsert into the cache
    fn classify_and_cache(
        &self,
        batches: Vec<(&Account, Vec<EmailMessage>)>,
    ) -> Vec<ClassifiedResult> {
        let now = Utc::now();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut results = Vec::new();

        for (account, messages) in batches {
            let rules = self.classifier.rules_for(&account.keyword_prefs());
            for message in messages {
                if !seen.insert((account.id.clone(), message.id.clone())) {
                    continue;
                }
                let classification = rules.classify(&message, now);
                results.push(ClassifiedResult {
                    account_id: account.id.clone(),
                    account_name: account.name.clone(),
                    message,
                    classification,
                    cached_at: now,
                });
            }
        }

        let mut cache_failures = 0;
        for result in &results {
            if let Err(e) = self.cache.upsert(result) {
                cache_failures += 1;
                debug!("Cache write failed for {}/{}: {}", result.account_id, result.message.id, e);
            }
        }
        if cache_failures > 0 {
            warn!(
                "Failed to cache {} of {} classification(s)",
                cache_failures,
                results.len()
            );
        }

        results
    }
}

/// Keep every mailbox that answered. The account fails only when all of them did.
fn merge_mailboxes(
    criteria: &[SearchCriteria],
    outcomes: Vec<Result<Vec<EmailMessage>>>,
) -> Result<Fetched> {
    let mut messages = Vec::new();
    let mut errors = Vec::new();
    for (c, outcome) in criteria.iter().zip(outcomes) {
        match outcome {
            Ok(found) => messages.extend(found),
            Err(e) => errors.push((c.mailbox.as_deref().unwrap_or("default mailbox"), e)),
        }
    }

    if !errors.is_empty() && errors.len() == criteria.len() {
        let (_, first) = errors.swap_remove(0);
        return Err(first);
    }

    Ok(Fetched {
        messages: dedupe_by_id(messages),
        partial_failures: errors
            .into_iter()
            .map(|(mailbox, e)| format!("{}: {}", mailbox, e))
            .collect(),
    })
}

/// Descending by `score`, then newest, then account id and message id
fn compare_by<F>(score: F) -> impl Fn(&ClassifiedResult, &ClassifiedResult) -> Ordering
where
    F: Fn(&ClassifiedResult) -> f64,
{
    move |a, b| {
        score(b)
            .total_cmp(&score(a))
            .then_with(|| b.message.received_at.cmp(&a.message.received_at))
            .then_with(|| a.account_id.cmp(&b.account_id))
            .then_with(|| a.message.id.cmp(&b.message.id))
    }
}
