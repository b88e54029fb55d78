//! Gmail API provider with refresh-token auth, bounded concurrency and retry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use google_gmail1::{api::Message, hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{dedupe_by_id, normalize_snippet, provider_error, with_retry, ProviderClient};
use crate::config::GmailConfig;
use crate::error::{ProviderFailure, Result, TriageError};
use crate::models::{EmailMessage, GmailCredentials, ProviderKind, SearchCriteria};

/// Read-only scope; search never modifies mail
pub const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Gmail caps `messages.list` page size at 500
const MAX_PAGE_SIZE: u32 = 500;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Sub-queries issued by the urgent probe
const URGENT_QUERIES: &[&str] = &[
    "is:important is:unread",
    "is:starred",
    "newer_than:1d is:unread",
];

/// System labels addressed with `in:` rather than `label:`
const SYSTEM_MAILBOXES: &[&str] = &["inbox", "sent", "drafts", "spam", "trash", "anywhere"];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

pub struct GmailProvider {
    account_id: String,
    hub: GmailHub,
    rate_limiter: Arc<Semaphore>,
    /// Searched when the request names no mailbox; `anywhere` covers all mail
    default_mailbox: String,
    snippet_length: usize,
}

impl GmailProvider {
    /// Build a hub that renews access tokens from the stored refresh token
    pub async fn connect(
        account_id: &str,
        credentials: &GmailCredentials,
        default_mailbox: &str,
        config: &GmailConfig,
        snippet_length: usize,
    ) -> Result<Self> {
        let to_error = provider_error(account_id, ProviderKind::Gmail);

        let client_id = credentials
            .client_id
            .clone()
            .unwrap_or_else(|| config.client_id.clone());
        let client_secret = credentials
            .client_secret
            .clone()
            .unwrap_or_else(|| config.client_secret.clone());
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(TriageError::Config(
                "gmail.client_id and gmail.client_secret must be set to refresh Gmail tokens"
                    .to_string(),
            ));
        }

        let secret = yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id,
            client_secret,
            refresh_token: credentials.refresh_token.clone(),
            key_type: "authorized_user".to_string(),
        };

        let auth = yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(|e| {
                to_error(ProviderFailure::Auth(format!(
                    "Failed to build authenticator: {}",
                    e
                )))
            })?;

        // HTTP/1 works better with google-gmail1 than the HTTP/2 default
        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(
                    hyper_rustls::HttpsConnectorBuilder::new()
                        .with_native_roots()
                        .map_err(|e| {
                            to_error(ProviderFailure::Network(format!(
                                "Failed to load TLS roots: {}",
                                e
                            )))
                        })?
                        .https_or_http()
                        .enable_http1()
                        .build(),
                );

        Ok(Self {
            account_id: account_id.to_string(),
            hub: Gmail::new(client, auth),
            rate_limiter: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            default_mailbox: default_mailbox.to_string(),
            snippet_length,
        })
    }

    fn to_error(&self, failure: ProviderFailure) -> TriageError {
        TriageError::provider(&self.account_id, ProviderKind::Gmail.as_str(), failure)
    }

    /// List up to `limit` message ids for a query, newest first
    async fn list_message_ids(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<String>, ProviderFailure> {
        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        while all_ids.len() < limit {
            let remaining = (limit - all_ids.len()).min(MAX_PAGE_SIZE as usize) as u32;
            let token = page_token.clone();

            let response = with_retry("messages.list", MAX_RETRIES, RETRY_BASE_DELAY, || {
                let token = token.clone();
                async move {
                    let mut call = self
                        .hub
                        .users()
                        .messages_list("me")
                        .q(query)
                        .max_results(remaining);
                    if let Some(token) = token.as_ref() {
                        call = call.page_token(token);
                    }
                    let (_, response) = call.add_scope(READONLY_SCOPE).doit().await?;
                    Ok::<_, ProviderFailure>(response)
                }
            })
            .await?;

            for msg_ref in response.messages.unwrap_or_default() {
                if let Some(id) = msg_ref.id {
                    all_ids.push(id);
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        all_ids.truncate(limit);
        debug!("Gmail query {:?} matched {} messages", query, all_ids.len());
        Ok(all_ids)
    }

    async fn fetch_single(&self, id: &str) -> std::result::Result<EmailMessage, ProviderFailure> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ProviderFailure::Protocol(format!("rate limiter closed: {}", e)))?;

        let msg = with_retry("messages.get", MAX_RETRIES, RETRY_BASE_DELAY, || async {
            let (_, msg) = self
                .hub
                .users()
                .messages_get("me", id)
                .format("metadata")
                .add_metadata_headers("From")
                .add_metadata_headers("To")
                .add_metadata_headers("Cc")
                .add_metadata_headers("Subject")
                .add_metadata_headers("Date")
                .add_scope(READONLY_SCOPE)
                .doit()
                .await?;
            Ok::<_, ProviderFailure>(msg)
        })
        .await?;

        parse_message(msg, self.snippet_length)
    }

    /// Fetch metadata for ids, preserving the input order
    async fn fetch_messages(
        &self,
        ids: Vec<String>,
    ) -> std::result::Result<Vec<EmailMessage>, ProviderFailure> {
        let concurrency = self.rate_limiter.available_permits().max(1);
        stream::iter(ids)
            .map(|id| async move { self.fetch_single(&id).await })
            .buffered(concurrency)
            .try_collect()
            .await
    }
}

#[async_trait]
impl ProviderClient for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<EmailMessage>> {
        let query = search_query(criteria, &self.default_mailbox);
        let ids = self
            .list_message_ids(&query, criteria.max_results)
            .await
            .map_err(|e| self.to_error(e))?;
        self.fetch_messages(ids).await.map_err(|e| self.to_error(e))
    }

    async fn fetch_urgent(&self, limit: usize) -> Result<Vec<EmailMessage>> {
        let id_lists = try_join_all(
            URGENT_QUERIES
                .iter()
                .map(|query| self.list_message_ids(query, limit)),
        )
        .await
        .map_err(|e| self.to_error(e))?;

        let mut seen = std::collections::HashSet::new();
        let ids: Vec<String> = id_lists
            .into_iter()
            .flatten()
            .filter(|id| seen.insert(id.clone()))
            .take(limit)
            .collect();

        let mut messages = self
            .fetch_messages(ids)
            .await
            .map_err(|e| self.to_error(e))?;
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(dedupe_by_id(messages))
    }

    async fn validate_connection(&self) -> bool {
        let result = self
            .hub
            .users()
            .get_profile("me")
            .add_scope(READONLY_SCOPE)
            .doit()
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    "Gmail connection check failed for {}: {}",
                    self.account_id,
                    ProviderFailure::from(e)
                );
                false
            }
        }
    }

    async fn list_mailboxes(&self) -> Result<Vec<String>> {
        let response = with_retry("labels.list", MAX_RETRIES, RETRY_BASE_DELAY, || async {
            let (_, response) = self
                .hub
                .users()
                .labels_list("me")
                .add_scope(READONLY_SCOPE)
                .doit()
                .await?;
            Ok::<_, ProviderFailure>(response)
        })
        .await
        .map_err(|e| self.to_error(e))?;

        let mut names: Vec<String> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| label.name)
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Query for a search, falling back to the account's default mailbox
fn search_query(criteria: &SearchCriteria, default_mailbox: &str) -> String {
    let mailbox = criteria
        .mailbox
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(default_mailbox);
    build_query(&criteria.query, Some(mailbox))
}

/// Combine the user query with a mailbox restriction
fn build_query(query: &str, mailbox: Option<&str>) -> String {
    let query = query.trim();
    let mailbox_term = mailbox.map(str::trim).filter(|m| !m.is_empty()).map(|m| {
        let lower = m.to_lowercase();
        if SYSTEM_MAILBOXES.contains(&lower.as_str()) {
            format!("in:{}", lower)
        } else {
            format!("label:{}", m.replace(' ', "-"))
        }
    });

    match (query.is_empty(), mailbox_term) {
        (true, Some(term)) => term,
        (false, Some(term)) => format!("{} {}", query, term),
        (_, None) => query.to_string(),
    }
}

/// Parse Gmail API Message into an EmailMessage
fn parse_message(
    msg: Message,
    snippet_length: usize,
) -> std::result::Result<EmailMessage, ProviderFailure> {
    let id = msg
        .id
        .ok_or_else(|| ProviderFailure::Protocol("Missing message ID".to_string()))?;

    let labels = msg.label_ids.unwrap_or_default();
    let payload = msg.payload.unwrap_or_default();

    let mut sender = String::new();
    let mut subject = String::new();
    let mut recipients = Vec::new();
    let mut date_str = String::new();

    for header in payload.headers.unwrap_or_default() {
        if let (Some(name), Some(value)) = (header.name, header.value) {
            match name.to_lowercase().as_str() {
                "from" => sender = value,
                "subject" => subject = value,
                "to" | "cc" => recipients.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string),
                ),
                "date" => date_str = value,
                _ => {}
            }
        }
    }

    let received_at = msg
        .internal_date
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or_else(|| parse_date(&date_str))
        .unwrap_or_else(Utc::now);

    let has_attachments = payload
        .mime_type
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case("multipart/mixed"))
        .unwrap_or(false)
        || payload
            .parts
            .unwrap_or_default()
            .iter()
            .any(|part| part.filename.as_deref().map(|f| !f.is_empty()).unwrap_or(false));

    let snippet = normalize_snippet(
        &decode_html_entities(msg.snippet.as_deref().unwrap_or("")),
        snippet_length,
    );

    Ok(EmailMessage {
        id,
        subject,
        sender,
        recipients,
        snippet,
        received_at,
        is_read: !labels.iter().any(|l| l == "UNREAD"),
        has_attachments,
        labels,
    })
}

/// Parse RFC 2822 date string, falling back to RFC 3339
fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .or_else(|_| DateTime::parse_from_rfc3339(date_str))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Gmail snippets come HTML-escaped
fn decode_html_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePart, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn api_message(labels: &[&str], mime_type: &str) -> Message {
        Message {
            id: Some("18c2a".to_string()),
            thread_id: Some("18c2a".to_string()),
            label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
            snippet: Some("Can you review &quot;Q3 plan&quot; by Friday? Tom &amp; Jerry".to_string()),
            internal_date: Some(1_704_124_800_000),
            payload: Some(MessagePart {
                mime_type: Some(mime_type.to_string()),
                headers: Some(vec![
                    header("From", "Boss <boss@example.com>"),
                    header("To", "me@example.com, team@example.com"),
                    header("Cc", "cc@example.com"),
                    header("Subject", "Urgent: Q3 plan"),
                    header("Date", "Mon, 1 Jan 2024 16:00:00 +0000"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_message_metadata() {
        let msg = api_message(&["INBOX", "UNREAD", "IMPORTANT"], "multipart/alternative");
        let parsed = parse_message(msg, 200).unwrap();

        assert_eq!(parsed.id, "18c2a");
        assert_eq!(parsed.sender, "Boss <boss@example.com>");
        assert_eq!(parsed.subject, "Urgent: Q3 plan");
        assert_eq!(
            parsed.recipients,
            vec!["me@example.com", "team@example.com", "cc@example.com"]
        );
        assert!(!parsed.is_read);
        assert!(!parsed.has_attachments);
        assert!(parsed.labels.contains(&"IMPORTANT".to_string()));
        assert_eq!(parsed.snippet, "Can you review \"Q3 plan\" by Friday? Tom & Jerry");
        assert_eq!(parsed.received_at.timestamp_millis(), 1_704_124_800_000);
    }

    #[test]
    fn test_parse_message_read_with_attachment() {
        let msg = api_message(&["INBOX"], "multipart/mixed");
        let parsed = parse_message(msg, 10).unwrap();
        assert!(parsed.is_read);
        assert!(parsed.has_attachments);
        assert_eq!(parsed.snippet.chars().count(), 10);
    }

    #[test]
    fn test_parse_message_missing_id() {
        let mut msg = api_message(&[], "text/plain");
        msg.id = None;
        assert!(matches!(
            parse_message(msg, 200),
            Err(ProviderFailure::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_message_falls_back_to_date_header() {
        let mut msg = api_message(&[], "text/plain");
        msg.internal_date = None;
        let parsed = parse_message(msg, 200).unwrap();
        assert_eq!(parsed.received_at.to_rfc3339(), "2024-01-01T16:00:00+00:00");
    }

    #[test]
    fn test_build_query() {
        assert_eq!(build_query("invoice", None), "invoice");
        assert_eq!(build_query("invoice", Some("INBOX")), "invoice in:inbox");
        assert_eq!(build_query("", Some("Sent")), "in:sent");
        assert_eq!(
            build_query("from:bob", Some("Clients 2024")),
            "from:bob label:Clients-2024"
        );
        assert_eq!(build_query("  report ", Some("  ")), "report");
    }

    #[test]
    fn test_search_query_uses_default_mailbox() {
        let mut criteria = SearchCriteria {
            query: "invoice".to_string(),
            max_results: 10,
            mailbox: None,
        };
        assert_eq!(search_query(&criteria, "INBOX"), "invoice in:inbox");
        assert_eq!(search_query(&criteria, "anywhere"), "invoice in:anywhere");

        criteria.mailbox = Some(" ".to_string());
        assert_eq!(search_query(&criteria, "INBOX"), "invoice in:inbox");

        criteria.mailbox = Some("Receipts".to_string());
        assert_eq!(search_query(&criteria, "INBOX"), "invoice label:Receipts");
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000").is_some());
        assert!(parse_date("2025-11-24T10:30:00Z").is_some());
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn test_urgent_queries_cover_importance_star_and_recency() {
        assert!(URGENT_QUERIES.iter().any(|q| q.contains("is:important")));
        assert!(URGENT_QUERIES.iter().any(|q| q.contains("is:starred")));
        assert!(URGENT_QUERIES.iter().any(|q| q.contains("newer_than:1d")));
    }
}
