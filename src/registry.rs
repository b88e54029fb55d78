//! Account registry: owns account records and their sealed credentials

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::CredentialCipher;
use crate::db::Database;
use crate::error::{Result, TriageError};
use crate::models::{
    Account, AccountUpdate, Credentials, GmailCredentials, ImapCredentials, NewAccount,
    ProviderKind,
};
use crate::provider::{ProviderClient, ProviderFactory};

/// Columns for generic reads. `credentials` is deliberately absent.
const ACCOUNT_COLUMNS: &str = "id, name, email, provider, active, default_mailbox, \
     urgent_keywords, important_keywords, created_at, updated_at, last_sync_at, last_sync_error";

pub struct AccountRegistry {
    db: Database,
    cipher: Arc<CredentialCipher>,
    factory: Arc<dyn ProviderFactory>,
    default_mailbox: String,
}

impl AccountRegistry {
    pub fn new(
        db: Database,
        cipher: Arc<CredentialCipher>,
        factory: Arc<dyn ProviderFactory>,
        default_mailbox: impl Into<String>,
    ) -> Self {
        Self {
            db,
            cipher,
            factory,
            default_mailbox: default_mailbox.into(),
        }
    }

    /// Validate and store a new account, returning it with its assigned id
    pub fn add_account(&self, new: NewAccount) -> Result<Account> {
        let name = required("name", Some(&new.name))?;
        let email = required("email", Some(&new.email))?;
        if !email.contains('@') {
            return Err(TriageError::Validation(format!(
                "Invalid email address '{}'",
                email
            )));
        }
        let provider: ProviderKind = new.provider.parse()?;
        let credentials = credentials_from_new(provider, &new)?;
        let sealed = self.cipher.seal_credentials(&credentials)?;

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            name,
            email,
            provider,
            active: true,
            default_mailbox: new
                .default_mailbox
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(&self.default_mailbox)
                .to_string(),
            urgent_keywords: clean_keywords(&new.urgent_keywords),
            important_keywords: clean_keywords(&new.important_keywords),
            created_at: now,
            updated_at: now,
            last_sync_at: None,
            last_sync_error: None,
        };

        let urgent = serde_json::to_string(&account.urgent_keywords)?;
        let important = serde_json::to_string(&account.important_keywords)?;

        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO accounts (
                        id, name, email, provider, credentials, active, default_mailbox,
                        urgent_keywords, important_keywords, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        account.id,
                        account.name,
                        account.email,
                        account.provider.as_str(),
                        sealed,
                        account.default_mailbox,
                        urgent,
                        important,
                        account.created_at,
                        account.updated_at,
                    ],
                )
            })
            .map_err(|e| name_conflict(e, &account.name))?;

        info!(
            "Registered {} account '{}' ({})",
            account.provider, account.name, account.id
        );
        Ok(account)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Account>> {
        self.find_one("id = ?1", id)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.find_one("name = ?1", name)
    }

    /// First account registered for an address; several accounts may share one
    pub fn get_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.find_one("email = ?1 COLLATE NOCASE", email)
    }

    /// Active accounts, most recently created first
    pub fn list_active(&self) -> Result<Vec<Account>> {
        self.list_where("WHERE active = 1")
    }

    /// All accounts, most recently created first
    pub fn list_all(&self) -> Result<Vec<Account>> {
        self.list_where("")
    }

    /// Apply a partial update. Returns `None` when the account does not exist.
    pub fn update_account(&self, id: &str, update: AccountUpdate) -> Result<Option<Account>> {
        let mut account = match self.get_by_id(id)? {
            Some(account) => account,
            None => return Ok(None),
        };

        if let Some(name) = update.name.as_ref() {
            account.name = required("name", Some(name))?;
        }
        if let Some(email) = update.email.as_ref() {
            let email = required("email", Some(email))?;
            if !email.contains('@') {
                return Err(TriageError::Validation(format!(
                    "Invalid email address '{}'",
                    email
                )));
            }
            account.email = email;
        }
        if let Some(mailbox) = update.default_mailbox.as_ref() {
            account.default_mailbox = required("default_mailbox", Some(mailbox))?;
        }
        if let Some(keywords) = update.urgent_keywords.as_ref() {
            account.urgent_keywords = clean_keywords(keywords);
        }
        if let Some(keywords) = update.important_keywords.as_ref() {
            account.important_keywords = clean_keywords(keywords);
        }

        let sealed = if update.touches_credentials() {
            let merged = merge_credentials(self.credentials(id)?, &update)?;
            Some(self.cipher.seal_credentials(&merged)?)
        } else {
            None
        };

        account.updated_at = Utc::now();
        let urgent = serde_json::to_string(&account.urgent_keywords)?;
        let important = serde_json::to_string(&account.important_keywords)?;

        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE accounts SET
                        name = ?2, email = ?3, default_mailbox = ?4,
                        urgent_keywords = ?5, important_keywords = ?6,
                        credentials = COALESCE(?7, credentials), updated_at = ?8
                     WHERE id = ?1",
                    params![
                        account.id,
                        account.name,
                        account.email,
                        account.default_mailbox,
                        urgent,
                        important,
                        sealed,
                        account.updated_at,
                    ],
                )
            })
            .map_err(|e| name_conflict(e, &account.name))?;

        debug!(
            "Updated account {} (credentials changed: {})",
            account.id,
            update.touches_credentials()
        );
        Ok(Some(account))
    }

    /// Returns whether the account existed
    pub fn enable(&self, id: &str) -> Result<bool> {
        self.set_active(id, true)
    }

    /// Returns whether the account existed
    pub fn disable(&self, id: &str) -> Result<bool> {
        self.set_active(id, false)
    }

    /// Hard delete; cached classifications go with it
    pub fn delete_account(&self, id: &str) -> Result<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM accounts WHERE id = ?1", params![id]))?;
        if deleted > 0 {
            info!("Removed account {}", id);
        }
        Ok(deleted > 0)
    }

    /// Stamp the last sync attempt. Storage failures are logged, never returned.
    pub fn record_sync_outcome(&self, id: &str, error: Option<&str>) {
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET last_sync_at = ?2, last_sync_error = ?3 WHERE id = ?1",
                params![id, Utc::now(), error],
            )
        });

        if let Err(e) = result {
            warn!("Failed to record sync outcome for account {}: {}", id, e);
        }
    }

    /// Decrypt an account's credentials. Only used to build provider clients.
    pub fn credentials(&self, id: &str) -> Result<Credentials> {
        let sealed: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT credentials FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;

        let sealed = sealed.ok_or_else(|| TriageError::NotFound(format!("account {}", id)))?;
        self.cipher.open_credentials(&sealed)
    }

    /// Instantiate the provider client for an account
    pub async fn client_for(&self, account: &Account) -> Result<Arc<dyn ProviderClient>> {
        let credentials = self.credentials(&account.id)?;
        if credentials.kind() != account.provider {
            return Err(TriageError::Crypto(format!(
                "stored credentials for account {} are for {}, expected {}",
                account.id,
                credentials.kind(),
                account.provider
            )));
        }
        self.factory.create(account, credentials).await
    }

    fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active, Utc::now()],
            )
        })?;
        if changed > 0 {
            info!(
                "{} account {}",
                if active { "Enabled" } else { "Disabled" },
                id
            );
        }
        Ok(changed > 0)
    }

    fn find_one(&self, condition: &str, value: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE {}", ACCOUNT_COLUMNS, condition);
        self.db.with_conn(|conn| {
            conn.query_row(&sql, params![value], row_to_account)
                .optional()
        })
    }

    fn list_where(&self, clause: &str) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts {} ORDER BY created_at DESC, rowid DESC",
            ACCOUNT_COLUMNS, clause
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_account)?;
            rows.collect()
        })
    }
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let provider: String = row.get(3)?;
    let provider = provider
        .parse::<ProviderKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        provider,
        active: row.get(4)?,
        default_mailbox: row.get(5)?,
        urgent_keywords: keyword_column(row, 6)?,
        important_keywords: keyword_column(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        last_sync_at: row.get(10)?,
        last_sync_error: row.get(11)?,
    })
}

fn keyword_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a UNIQUE violation on `name` to a conflict
fn name_conflict(error: TriageError, name: &str) -> TriageError {
    match error {
        TriageError::Database(rusqlite::Error::SqliteFailure(ref e, _))
            if e.code == ErrorCode::ConstraintViolation =>
        {
            TriageError::Conflict(format!("An account named '{}' already exists", name))
        }
        other => other,
    }
}

fn required(field: &str, value: Option<&String>) -> Result<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TriageError::Validation(format!("'{}' is required", field)))
}

fn clean_keywords(keywords: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for keyword in keywords {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !cleaned.contains(&keyword) {
            cleaned.push(keyword);
        }
    }
    cleaned
}

fn credentials_from_new(provider: ProviderKind, new: &NewAccount) -> Result<Credentials> {
    match provider {
        ProviderKind::Gmail => Ok(Credentials::Gmail(GmailCredentials {
            refresh_token: required("refresh_token", new.refresh_token.as_ref())?,
            client_id: new.client_id.clone().filter(|v| !v.trim().is_empty()),
            client_secret: new.client_secret.clone().filter(|v| !v.trim().is_empty()),
        })),
        ProviderKind::Imap => {
            let host = required("host", new.host.as_ref())?;
            let port = match new.port {
                Some(port) if port > 0 => port,
                _ => {
                    return Err(TriageError::Validation(
                        "'port' is required for IMAP accounts".to_string(),
                    ))
                }
            };
            let username = required("username", new.username.as_ref())?;
            let password = new
                .password
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| TriageError::Validation("'password' is required".to_string()))?;

            Ok(Credentials::Imap(ImapCredentials {
                host,
                port,
                username,
                password,
                use_tls: new.use_tls.unwrap_or(true),
            }))
        }
    }
}

/// Overlay updated credential fields; fields for the other provider are rejected
fn merge_credentials(current: Credentials, update: &AccountUpdate) -> Result<Credentials> {
    match current {
        Credentials::Gmail(mut creds) => {
            if update.host.is_some()
                || update.port.is_some()
                || update.username.is_some()
                || update.password.is_some()
                || update.use_tls.is_some()
            {
                return Err(TriageError::Validation(
                    "IMAP connection fields cannot be set on a Gmail account".to_string(),
                ));
            }
            if let Some(token) = update.refresh_token.as_ref() {
                creds.refresh_token = required("refresh_token", Some(token))?;
            }
            if let Some(client_id) = update.client_id.as_ref() {
                creds.client_id = Some(client_id.clone()).filter(|v| !v.trim().is_empty());
            }
            if let Some(secret) = update.client_secret.as_ref() {
                creds.client_secret = Some(secret.clone()).filter(|v| !v.trim().is_empty());
            }
            Ok(Credentials::Gmail(creds))
        }
        Credentials::Imap(mut creds) => {
            if update.refresh_token.is_some()
                || update.client_id.is_some()
                || update.client_secret.is_some()
            {
                return Err(TriageError::Validation(
                    "Gmail OAuth fields cannot be set on an IMAP account".to_string(),
                ));
            }
            if let Some(host) = update.host.as_ref() {
                creds.host = required("host", Some(host))?;
            }
            if let Some(port) = update.port {
                if port == 0 {
                    return Err(TriageError::Validation("'port' must be non-zero".to_string()));
                }
                creds.port = port;
            }
            if let Some(username) = update.username.as_ref() {
                creds.username = required("username", Some(username))?;
            }
            if let Some(password) = update.password.as_ref() {
                if password.is_empty() {
                    return Err(TriageError::Validation("'password' is required".to_string()));
                }
                creds.password = password.clone();
            }
            if let Some(use_tls) = update.use_tls {
                creds.use_tls = use_tls;
            }
            Ok(Credentials::Imap(creds))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopFactory;

    #[async_trait]
    impl ProviderFactory for NoopFactory {
        async fn create(
            &self,
            _account: &Account,
            _credentials: Credentials,
        ) -> Result<Arc<dyn ProviderClient>> {
            Err(TriageError::Config("no providers in unit tests".to_string()))
        }
    }

    fn registry() -> AccountRegistry {
        let db = Database::open_in_memory().unwrap();
        let cipher = CredentialCipher::from_secret(b"registry-test-secret", b"registry-salt-0001").unwrap();
        AccountRegistry::new(db, Arc::new(cipher), Arc::new(NoopFactory), "INBOX")
    }

    fn imap_account(name: &str) -> NewAccount {
        NewAccount {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            provider: "imap".to_string(),
            host: Some("imap.example.com".to_string()),
            port: Some(993),
            username: Some(name.to_string()),
            password: Some("hunter2-secret".to_string()),
            ..Default::default()
        }
    }

    fn gmail_account(name: &str) -> NewAccount {
        NewAccount {
            name: name.to_string(),
            email: format!("{}@gmail.com", name),
            provider: "gmail".to_string(),
            refresh_token: Some("1//refresh-token".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_imap_requires_host() {
        let reg = registry();
        let mut missing = imap_account("work");
        missing.host = None;
        assert!(matches!(
            reg.add_account(missing),
            Err(TriageError::Validation(_))
        ));

        let account = reg.add_account(imap_account("work")).unwrap();
        assert!(!account.id.is_empty());
        assert_eq!(account.default_mailbox, "INBOX");
    }

    #[test]
    fn test_gmail_requires_refresh_token() {
        let reg = registry();
        let mut missing = gmail_account("personal");
        missing.refresh_token = Some("   ".to_string());
        assert!(matches!(
            reg.add_account(missing),
            Err(TriageError::Validation(_))
        ));
        assert!(reg.add_account(gmail_account("personal")).is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let reg = registry();
        let mut account = imap_account("work");
        account.provider = "exchange".to_string();
        assert!(matches!(
            reg.add_account(account),
            Err(TriageError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let reg = registry();
        reg.add_account(imap_account("work")).unwrap();
        let mut again = gmail_account("work");
        again.email = "other@gmail.com".to_string();
        assert!(matches!(
            reg.add_account(again),
            Err(TriageError::Conflict(_))
        ));
    }

    #[test]
    fn test_lookups_and_ordering() {
        let reg = registry();
        let first = reg.add_account(imap_account("first")).unwrap();
        let second = reg.add_account(gmail_account("second")).unwrap();

        assert_eq!(reg.get_by_id(&first.id).unwrap().unwrap().name, "first");
        assert_eq!(reg.get_by_name("second").unwrap().unwrap().id, second.id);
        assert_eq!(
            reg.get_by_email("FIRST@example.com").unwrap().unwrap().id,
            first.id
        );
        assert!(reg.get_by_id("nope").unwrap().is_none());

        let names: Vec<String> = reg.list_all().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[test]
    fn test_stored_blob_is_not_plaintext() {
        let reg = registry();
        let account = reg.add_account(imap_account("work")).unwrap();
        let blob: String = reg
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT credentials FROM accounts WHERE id = ?1",
                    params![account.id],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(!blob.contains("hunter2"));

        match reg.credentials(&account.id).unwrap() {
            Credentials::Imap(creds) => assert_eq!(creds.password, "hunter2-secret"),
            other => panic!("unexpected credentials: {:?}", other),
        }
    }

    #[test]
    fn test_enable_disable_keeps_credentials() {
        let reg = registry();
        let account = reg.add_account(imap_account("work")).unwrap();

        assert!(reg.disable(&account.id).unwrap());
        assert!(reg.list_active().unwrap().is_empty());
        assert_eq!(reg.list_all().unwrap().len(), 1);

        assert!(reg.enable(&account.id).unwrap());
        assert_eq!(reg.list_active().unwrap().len(), 1);
        assert!(reg.credentials(&account.id).is_ok());
        assert!(!reg.disable("missing").unwrap());
    }

    #[test]
    fn test_partial_update() {
        let reg = registry();
        let account = reg.add_account(imap_account("work")).unwrap();

        let updated = reg
            .update_account(
                &account.id,
                AccountUpdate {
                    urgent_keywords: Some(vec![" ASAP ".to_string(), "asap".to_string()]),
                    password: Some("new-password".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(updated.name, "work");
        assert_eq!(updated.email, "work@example.com");
        assert_eq!(updated.urgent_keywords, vec!["asap"]);
        assert!(updated.updated_at >= account.updated_at);

        match reg.credentials(&account.id).unwrap() {
            Credentials::Imap(creds) => {
                assert_eq!(creds.password, "new-password");
                assert_eq!(creds.host, "imap.example.com");
            }
            other => panic!("unexpected credentials: {:?}", other),
        }

        let stored = reg.get_by_id(&account.id).unwrap().unwrap();
        assert_eq!(stored.urgent_keywords, vec!["asap"]);
    }

    #[test]
    fn test_update_rejects_foreign_credential_fields() {
        let reg = registry();
        let account = reg.add_account(gmail_account("personal")).unwrap();
        let result = reg.update_account(
            &account.id,
            AccountUpdate {
                host: Some("imap.example.com".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(TriageError::Validation(_))));
    }

    #[test]
    fn test_update_missing_and_rename_conflict() {
        let reg = registry();
        assert!(reg
            .update_account("missing", AccountUpdate::default())
            .unwrap()
            .is_none());

        reg.add_account(imap_account("a")).unwrap();
        let b = reg.add_account(imap_account("b")).unwrap();
        let result = reg.update_account(
            &b.id,
            AccountUpdate {
                name: Some("a".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(TriageError::Conflict(_))));
    }

    #[test]
    fn test_record_sync_outcome() {
        let reg = registry();
        let account = reg.add_account(imap_account("work")).unwrap();

        reg.record_sync_outcome(&account.id, Some("login failed"));
        let stored = reg.get_by_id(&account.id).unwrap().unwrap();
        assert!(stored.last_sync_at.is_some());
        assert_eq!(stored.last_sync_error.as_deref(), Some("login failed"));

        reg.record_sync_outcome(&account.id, None);
        let stored = reg.get_by_id(&account.id).unwrap().unwrap();
        assert!(stored.last_sync_error.is_none());

        // Unknown ids are a no-op
        reg.record_sync_outcome("missing", None);
    }

    #[test]
    fn test_delete_account() {
        let reg = registry();
        let account = reg.add_account(imap_account("work")).unwrap();
        assert!(reg.delete_account(&account.id).unwrap());
        assert!(!reg.delete_account(&account.id).unwrap());
        assert!(matches!(
            reg.credentials(&account.id),
            Err(TriageError::NotFound(_))
        ));
    }
}
