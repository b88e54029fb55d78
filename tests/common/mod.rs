//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mail_triage::config::Config;
use mail_triage::crypto::CredentialCipher;
use mail_triage::db::Database;
use mail_triage::error::{ProviderFailure, Result, TriageError};
use mail_triage::models::{Account, Credentials, EmailMessage, NewAccount, ProviderKind, SearchCriteria};
use mail_triage::provider::{ProviderClient, ProviderFactory};
use mail_triage::service::TriageService;
use mockall::mock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

mock! {
    pub Provider {}

    #[async_trait]
    impl ProviderClient for Provider {
        fn kind(&self) -> ProviderKind;
        async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<EmailMessage>>;
        async fn fetch_urgent(&self, limit: usize) -> Result<Vec<EmailMessage>>;
        async fn validate_connection(&self) -> bool;
        async fn list_mailboxes(&self) -> Result<Vec<String>>;
    }
}

/// Hands out pre-registered clients by account name and counts creations
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Arc<dyn ProviderClient>>>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn register(&self, account_name: &str, client: MockProvider) {
        self.clients
            .lock()
            .unwrap()
            .insert(account_name.to_string(), Arc::new(client));
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFactory for FakeFactory {
    async fn create(
        &self,
        account: &Account,
        _credentials: Credentials,
    ) -> Result<Arc<dyn ProviderClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap()
            .get(&account.name)
            .cloned()
            .ok_or_else(|| TriageError::NotFound(format!("no fake client for {}", account.name)))
    }
}

pub struct Harness {
    pub service: TriageService,
    pub factory: Arc<FakeFactory>,
    pub db: Database,
}

/// Service over an in-memory database and the fake factory
pub fn harness() -> Harness {
    let config = Config::default();
    let db = Database::open_in_memory().unwrap();
    let cipher = CredentialCipher::from_secret(b"integration-secret", b"integration-salt").unwrap();
    let factory = Arc::new(FakeFactory::default());
    let service = TriageService::with_parts(&config, db.clone(), cipher, factory.clone());
    Harness {
        service,
        factory,
        db,
    }
}

impl Harness {
    /// Register an IMAP account backed by `client`
    pub fn add(&self, name: &str, client: MockProvider) -> Account {
        self.add_with(imap_account(name), client)
    }

    pub fn add_with(&self, new: NewAccount, client: MockProvider) -> Account {
        let name = new.name.clone();
        let account = self.service.add_account(new).unwrap();
        self.factory.register(&name, client);
        account
    }
}

pub fn imap_account(name: &str) -> NewAccount {
    NewAccount {
        name: name.to_string(),
        email: format!("{}@example.com", name),
        provider: "imap".to_string(),
        host: Some("imap.example.com".to_string()),
        port: Some(993),
        username: Some(name.to_string()),
        password: Some("app-password".to_string()),
        ..Default::default()
    }
}

/// A read, three-day-old message with no other signals
pub fn message(id: &str, subject: &str) -> EmailMessage {
    EmailMessage {
        id: id.to_string(),
        subject: subject.to_string(),
        sender: "colleague@example.com".to_string(),
        recipients: vec!["me@example.com".to_string()],
        snippet: String::new(),
        received_at: Utc::now() - Duration::days(3),
        is_read: true,
        has_attachments: false,
        labels: vec!["INBOX".to_string()],
    }
}

/// Unread message received an hour ago
pub fn fresh_unread(id: &str, subject: &str) -> EmailMessage {
    let mut msg = message(id, subject);
    msg.is_read = false;
    msg.received_at = Utc::now() - Duration::hours(1);
    msg
}

pub fn searching(messages: Vec<EmailMessage>) -> MockProvider {
    let mut mock = MockProvider::new();
    mock.expect_search()
        .returning(move |_| Ok(messages.clone()));
    mock
}

pub fn urgent_probe(messages: Vec<EmailMessage>) -> MockProvider {
    let mut mock = MockProvider::new();
    mock.expect_fetch_urgent()
        .returning(move |_| Ok(messages.clone()));
    mock
}

pub fn failing() -> MockProvider {
    let mut mock = MockProvider::new();
    mock.expect_search().returning(|_| {
        Err(TriageError::provider(
            "down",
            "imap",
            ProviderFailure::Network("connection refused".to_string()),
        ))
    });
    mock.expect_fetch_urgent().returning(|_| {
        Err(TriageError::provider(
            "down",
            "imap",
            ProviderFailure::Auth("LOGIN failed".to_string()),
        ))
    });
    mock
}
