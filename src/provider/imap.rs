//! IMAP provider: one short-lived read-only session per operation

use async_imap::types::{Fetch, Flag, NameAttribute};
use async_imap::Session;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use std::collections::BTreeSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::{normalize_snippet, ProviderClient};
use crate::config::ImapConfig;
use crate::error::{ProviderFailure, Result, TriageError};
use crate::models::{EmailMessage, ImapCredentials, ProviderKind, SearchCriteria};

/// Headers plus the first 2 KiB of body; enough for subject, addresses and a snippet
const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.2048>)";

/// Candidate multiplier when attachments are filtered after the fetch
const ATTACHMENT_OVERFETCH: usize = 3;

/// Plain or TLS transport for an IMAP session
#[derive(Debug)]
pub enum ImapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

type ImapSession = Session<ImapStream>;

/// A translated search: the IMAP SEARCH keys plus filters IMAP cannot express
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapQuery {
    pub search: String,
    pub require_attachments: bool,
}

pub struct ImapProvider {
    account_id: String,
    credentials: ImapCredentials,
    default_mailbox: String,
    connect_timeout: Duration,
    snippet_length: usize,
}

impl ImapProvider {
    pub fn new(
        account_id: &str,
        credentials: ImapCredentials,
        default_mailbox: &str,
        config: &ImapConfig,
        snippet_length: usize,
    ) -> Self {
        let default_mailbox = if default_mailbox.trim().is_empty() {
            config.default_mailbox.clone()
        } else {
            default_mailbox.to_string()
        };

        Self {
            account_id: account_id.to_string(),
            credentials,
            default_mailbox,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            snippet_length,
        }
    }

    fn to_error(&self, failure: ProviderFailure) -> TriageError {
        TriageError::provider(&self.account_id, ProviderKind::Imap.as_str(), failure)
    }

    /// Open the transport and log in
    async fn connect(&self) -> std::result::Result<ImapSession, ProviderFailure> {
        let creds = &self.credentials;
        debug!(
            "Connecting to IMAP server {}:{} (tls: {})",
            creds.host, creds.port, creds.use_tls
        );

        let stream = tokio::time::timeout(self.connect_timeout, open_stream(creds))
            .await
            .map_err(|_| ProviderFailure::Timeout(self.connect_timeout.as_secs()))??;

        let client = async_imap::Client::new(stream);
        client
            .login(&creds.username, &creds.password)
            .await
            .map_err(|(e, _)| ProviderFailure::Auth(format!("IMAP login failed: {}", e)))
    }

    /// Run `op` inside a fresh session, logging out afterwards
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut ImapSession) -> BoxFuture<'s, std::result::Result<T, ProviderFailure>>
            + Send,
    {
        let mut session = self.connect().await.map_err(|e| self.to_error(e))?;
        let result = op(&mut session).await;
        if let Err(e) = session.logout().await {
            debug!("IMAP logout for {} failed: {}", self.account_id, e);
        }
        result.map_err(|e| self.to_error(e))
    }
}

#[async_trait]
impl ProviderClient for ImapProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<EmailMessage>> {
        let query = build_search_query(&criteria.query)?;
        let mailbox = criteria
            .mailbox
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_mailbox.clone());
        let max_results = criteria.max_results;
        let snippet_length = self.snippet_length;

        self.with_session(move |session| {
            Box::pin(async move {
                session.examine(&mailbox).await?;
                let uids = session.uid_search(&query.search).await?;

                let candidates = if query.require_attachments {
                    max_results.saturating_mul(ATTACHMENT_OVERFETCH)
                } else {
                    max_results
                };
                let selected = newest_uids(uids, candidates);
                debug!(
                    "IMAP search {:?} in {} matched {} candidates",
                    query.search,
                    mailbox,
                    selected.len()
                );

                let mut messages =
                    fetch_messages(session, &mailbox, &selected, snippet_length).await?;
                if query.require_attachments {
                    messages.retain(|m| m.has_attachments);
                }
                messages.truncate(max_results);
                Ok(messages)
            })
        })
        .await
    }

    async fn fetch_urgent(&self, limit: usize) -> Result<Vec<EmailMessage>> {
        let mailbox = self.default_mailbox.clone();
        let snippet_length = self.snippet_length;
        let since = imap_date((Utc::now() - ChronoDuration::days(1)).date_naive());

        self.with_session(move |session| {
            Box::pin(async move {
                session.examine(&mailbox).await?;

                let probes = [
                    "FLAGGED".to_string(),
                    "UNSEEN".to_string(),
                    "KEYWORD $Important".to_string(),
                    format!("SINCE {}", since),
                ];

                let mut all_uids = BTreeSet::new();
                for probe in &probes {
                    match session.uid_search(probe).await {
                        Ok(uids) => all_uids.extend(uids),
                        // Servers may refuse individual keys; the other probes still count
                        Err(async_imap::error::Error::No(msg))
                        | Err(async_imap::error::Error::Bad(msg)) => {
                            debug!("IMAP probe {:?} rejected: {}", probe, msg);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                let selected = newest_uids(all_uids, limit);
                fetch_messages(session, &mailbox, &selected, snippet_length).await
            })
        })
        .await
    }

    async fn validate_connection(&self) -> bool {
        let result = self
            .with_session(|session| {
                Box::pin(async move {
                    session.noop().await?;
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("IMAP connection check failed: {}", e);
                false
            }
        }
    }

    async fn list_mailboxes(&self) -> Result<Vec<String>> {
        self.with_session(|session| {
            Box::pin(async move {
                let names: Vec<_> = session
                    .list(Some(""), Some("*"))
                    .await?
                    .try_collect()
                    .await?;

                let mut mailboxes: Vec<String> = names
                    .iter()
                    .filter(|n| {
                        !n.attributes()
                            .iter()
                            .any(|a| matches!(a, NameAttribute::NoSelect))
                    })
                    .map(|n| n.name().to_string())
                    .collect();
                mailboxes.sort();
                Ok(mailboxes)
            })
        })
        .await
    }
}

async fn open_stream(creds: &ImapCredentials) -> std::result::Result<ImapStream, ProviderFailure> {
    let tcp = TcpStream::connect((creds.host.as_str(), creds.port))
        .await
        .map_err(|e| ProviderFailure::Network(format!("TCP connection failed: {}", e)))?;

    if !creds.use_tls {
        return Ok(ImapStream::Plain(tcp));
    }

    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(creds.host.clone())
        .map_err(|e| ProviderFailure::BadRequest(format!("Invalid IMAP host name: {}", e)))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProviderFailure::Network(format!("TLS handshake failed: {}", e)))?;

    info!("Established TLS session with {}", creds.host);
    Ok(ImapStream::Tls(Box::new(tls)))
}

/// Highest UIDs first, at most `limit`
fn newest_uids<I: IntoIterator<Item = u32>>(uids: I, limit: usize) -> Vec<u32> {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.dedup();
    uids.truncate(limit);
    uids
}

async fn fetch_messages(
    session: &mut ImapSession,
    mailbox: &str,
    uids: &[u32],
    snippet_length: usize,
) -> std::result::Result<Vec<EmailMessage>, ProviderFailure> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let uid_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let fetches: Vec<Fetch> = session
        .uid_fetch(&uid_set, FETCH_ITEMS)
        .await?
        .try_collect()
        .await?;

    let mut parsed: Vec<(u32, EmailMessage)> = fetches
        .iter()
        .filter_map(|fetch| {
            let uid = fetch.uid?;
            let flags: Vec<String> = fetch.flags().map(|f| flag_name(&f)).collect();
            let message = parse_message(
                mailbox,
                uid,
                fetch.header().unwrap_or(&[]),
                fetch.text().unwrap_or(&[]),
                flags,
                fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                snippet_length,
            );
            Some((uid, message))
        })
        .collect();

    // FETCH responses arrive in server order
    parsed.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(parsed.into_iter().map(|(_, m)| m).collect())
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Build a message from raw header and body bytes
fn parse_message(
    mailbox: &str,
    uid: u32,
    header: &[u8],
    text: &[u8],
    flags: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
    snippet_length: usize,
) -> EmailMessage {
    use mailparse::MailHeaderMap;

    let headers = mailparse::parse_headers(header)
        .map(|(headers, _)| headers)
        .unwrap_or_default();

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let sender = headers.get_first_value("From").unwrap_or_default();

    let mut recipients = Vec::new();
    for name in ["To", "Cc"] {
        for value in headers.get_all_values(name) {
            recipients.extend(address_list(&value));
        }
    }

    let received_at = internal_date
        .or_else(|| {
            headers
                .get_first_value("Date")
                .and_then(|d| mailparse::dateparse(&d).ok())
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        })
        .unwrap_or_else(Utc::now);

    let (body_text, has_attachments) = parse_body(header, text);
    let is_read = flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"));
    let labels = normalize_labels(flags);

    EmailMessage {
        id: format!("{}:{}", mailbox, uid),
        subject,
        sender,
        recipients,
        snippet: normalize_snippet(&body_text, snippet_length),
        received_at,
        is_read,
        has_attachments,
        labels,
    }
}

/// Keep raw flags and add the Gmail-style labels they correspond to
fn normalize_labels(flags: Vec<String>) -> Vec<String> {
    let mut labels = flags;
    if labels.iter().any(|f| f.eq_ignore_ascii_case("\\Flagged")) {
        labels.push("STARRED".to_string());
    }
    if labels.iter().any(|f| f.eq_ignore_ascii_case("$Important")) {
        labels.push("IMPORTANT".to_string());
    }
    labels
}

fn address_list(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => vec![info.addr.clone()],
                mailparse::MailAddr::Group(group) => {
                    group.addrs.iter().map(|a| a.addr.clone()).collect()
                }
            })
            .collect(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// First text part of the (possibly truncated) body and whether it carries attachments
fn parse_body(header: &[u8], text: &[u8]) -> (String, bool) {
    let mut raw = Vec::with_capacity(header.len() + text.len());
    raw.extend_from_slice(header);
    raw.extend_from_slice(text);

    let parsed = match mailparse::parse_mail(&raw) {
        Ok(parsed) => parsed,
        Err(_) => return (String::from_utf8_lossy(text).into_owned(), false),
    };

    let has_attachments = parsed.ctype.mimetype.eq_ignore_ascii_case("multipart/mixed")
        || parsed.parts().any(|part| {
            part.get_content_disposition().disposition == mailparse::DispositionType::Attachment
        });

    let body = parsed
        .parts()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
        .or_else(|| {
            parsed
                .parts()
                .find(|part| part.ctype.mimetype.to_lowercase().starts_with("text/"))
        })
        .and_then(|part| part.get_body().ok())
        .unwrap_or_default();

    (body, has_attachments)
}

/// Translate the Gmail-style query syntax into IMAP SEARCH keys
///
/// Supported operators: `from:`, `to:`, `subject:`, `is:unread`, `is:read`,
/// `is:flagged`/`is:starred`, `since:YYYY-MM-DD`, `before:YYYY-MM-DD` and
/// `has:attachment`. Anything else is matched as free text.
pub fn build_search_query(query: &str) -> Result<ImapQuery> {
    let mut keys = Vec::new();
    let mut free_text = Vec::new();
    let mut require_attachments = false;

    for token in tokenize(query) {
        let (operator, value) = match token.split_once(':') {
            Some((op, value)) if !value.is_empty() => (op.to_lowercase(), value.to_string()),
            _ => {
                free_text.push(token);
                continue;
            }
        };

        match (operator.as_str(), value.to_lowercase().as_str()) {
            ("from", _) => keys.push(format!("FROM {}", quote(&value))),
            ("to", _) => keys.push(format!("TO {}", quote(&value))),
            ("subject", _) => keys.push(format!("SUBJECT {}", quote(&value))),
            ("is", "unread") => keys.push("UNSEEN".to_string()),
            ("is", "read") => keys.push("SEEN".to_string()),
            ("is", "flagged") | ("is", "starred") => keys.push("FLAGGED".to_string()),
            ("has", "attachment") => require_attachments = true,
            ("since", _) => keys.push(format!("SINCE {}", imap_date(parse_query_date(&value)?))),
            ("before", _) => keys.push(format!("BEFORE {}", imap_date(parse_query_date(&value)?))),
            _ => free_text.push(token),
        }
    }

    if !free_text.is_empty() {
        keys.push(format!("TEXT {}", quote(&free_text.join(" "))));
    }

    let search = if keys.is_empty() {
        "ALL".to_string()
    } else {
        keys.join(" ")
    };
    let search = if search.is_ascii() {
        search
    } else {
        format!("CHARSET UTF-8 {}", search)
    };

    Ok(ImapQuery {
        search,
        require_attachments,
    })
}

/// Split on whitespace, keeping double-quoted runs together and dropping the quotes
fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in query.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_query_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y/%m/%d"))
        .map_err(|_| {
            TriageError::Validation(format!(
                "Invalid date '{}' in query; expected YYYY-MM-DD",
                value
            ))
        })
}

/// RFC 3501 date, e.g. `01-Jan-2024`
fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_search_query_operators() {
        let q = build_search_query("from:boss@example.com is:unread subject:\"Q3 plan\"").unwrap();
        assert_eq!(q.search, "FROM \"boss@example.com\" UNSEEN SUBJECT \"Q3 plan\"");
        assert!(!q.require_attachments);
    }

    #[test]
    fn test_build_search_query_free_text_and_dates() {
        let q = build_search_query("invoice since:2024-01-05 before:2024-02-01 overdue").unwrap();
        assert_eq!(
            q.search,
            "SINCE 05-Jan-2024 BEFORE 01-Feb-2024 TEXT \"invoice overdue\""
        );
    }

    #[test]
    fn test_build_search_query_attachment_is_post_filter() {
        let q = build_search_query("has:attachment is:starred").unwrap();
        assert_eq!(q.search, "FLAGGED");
        assert!(q.require_attachments);
    }

    #[test]
    fn test_build_search_query_empty_matches_all() {
        assert_eq!(build_search_query("").unwrap().search, "ALL");
        assert_eq!(build_search_query("   ").unwrap().search, "ALL");
    }

    #[test]
    fn test_build_search_query_non_ascii_uses_charset() {
        let q = build_search_query("réunion").unwrap();
        assert_eq!(q.search, "CHARSET UTF-8 TEXT \"réunion\"");
    }

    #[test]
    fn test_build_search_query_escapes_quotes() {
        let q = build_search_query(r"subject:a\b").unwrap();
        assert_eq!(q.search, r#"SUBJECT "a\\b""#);
    }

    #[test]
    fn test_build_search_query_rejects_bad_date() {
        assert!(matches!(
            build_search_query("since:last-week"),
            Err(TriageError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_operator_is_free_text() {
        let q = build_search_query("label:work").unwrap();
        assert_eq!(q.search, "TEXT \"label:work\"");
    }

    #[test]
    fn test_newest_uids() {
        assert_eq!(newest_uids(vec![3, 10, 7, 10, 1], 3), vec![10, 7, 3]);
        assert!(newest_uids(Vec::<u32>::new(), 5).is_empty());
    }

    #[test]
    fn test_parse_message_plain() {
        let header = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Subject: Server down\r\n\
Date: Tue, 2 Jan 2024 09:30:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\r\n";
        let text = b"The   production server\r\nis unreachable.\r\n";

        let msg = parse_message(
            "INBOX",
            42,
            header,
            text,
            vec!["\\Seen".to_string(), "\\Flagged".to_string()],
            None,
            200,
        );

        assert_eq!(msg.id, "INBOX:42");
        assert_eq!(msg.subject, "Server down");
        assert_eq!(msg.sender, "Alice <alice@example.com>");
        assert_eq!(msg.recipients, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(msg.snippet, "The production server is unreachable.");
        assert!(msg.is_read);
        assert!(!msg.has_attachments);
        assert!(msg.labels.contains(&"\\Flagged".to_string()));
        assert!(msg.labels.contains(&"STARRED".to_string()));
        assert!(!msg.labels.contains(&"IMPORTANT".to_string()));
        assert_eq!(msg.received_at.to_rfc3339(), "2024-01-02T09:30:00+00:00");
    }

    #[test]
    fn test_parse_message_multipart_with_attachment() {
        let header = b"From: a@example.com\r\n\
Subject: Report\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\r\n";
        let text = b"--XYZ\r\n\
Content-Type: text/plain\r\n\r\n\
See attached.\r\n\
--XYZ\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\r\n\
JVBERi0=\r\n\
--XYZ--\r\n";

        let msg = parse_message("INBOX", 7, header, text, vec![], None, 200);
        assert!(msg.has_attachments);
        assert!(!msg.is_read);
        assert_eq!(msg.snippet, "See attached.");
    }

    #[test]
    fn test_internal_date_takes_precedence() {
        let internal = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let header = b"Subject: x\r\nDate: Tue, 2 Jan 2024 09:30:00 +0000\r\n\r\n";
        let msg = parse_message("INBOX", 1, header, b"", vec![], Some(internal), 200);
        assert_eq!(msg.received_at, internal);
    }

    #[test]
    fn test_flag_name() {
        assert_eq!(flag_name(&Flag::Seen), "\\Seen");
        assert_eq!(flag_name(&Flag::Flagged), "\\Flagged");
        assert_eq!(
            flag_name(&Flag::Custom(std::borrow::Cow::Borrowed("$Important"))),
            "$Important"
        );
    }

    #[test]
    fn test_provider_uses_config_mailbox_when_blank() {
        let creds = ImapCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "u".to_string(),
            password: "p".to_string(),
            use_tls: true,
        };
        let provider = ImapProvider::new("acc", creds, "", &ImapConfig::default(), 100);
        assert_eq!(provider.default_mailbox, "INBOX");
        assert_eq!(provider.kind(), ProviderKind::Imap);
    }
}
