use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TriageError};

/// Hard ceiling on results per search or per urgent/important bucket
pub const MAX_RESULTS_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Environment variable holding the master secret for credential encryption
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_salt")]
    pub salt: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            salt: default_salt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
    #[serde(default = "default_snippet_length")]
    pub snippet_length: usize,
}

impl SearchConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_max_results: default_max_results(),
            provider_timeout_secs: default_provider_timeout_secs(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
            snippet_length: default_snippet_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    /// OAuth client used to refresh stored refresh tokens
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_gmail_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            max_concurrent_requests: default_gmail_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_mailbox")]
    pub default_mailbox: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            default_mailbox: default_mailbox(),
        }
    }
}

/// Global keyword lists; an account's own lists take precedence
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub urgent_keywords: Vec<String>,
    #[serde(default)]
    pub important_keywords: Vec<String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".mail-triage/accounts.db")
}

fn default_secret_env() -> String {
    "MAIL_TRIAGE_SECRET".to_string()
}

fn default_salt() -> String {
    "mail-triage.credentials.v1".to_string()
}

fn default_max_results() -> usize {
    20
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_accounts() -> usize {
    8
}

fn default_snippet_length() -> usize {
    200
}

fn default_gmail_max_concurrent() -> usize {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(TriageError::Config(
                "storage.database_path cannot be empty".to_string(),
            ));
        }

        if self.security.secret_env.trim().is_empty() {
            return Err(TriageError::Config(
                "security.secret_env cannot be empty".to_string(),
            ));
        }
        if self.security.salt.len() < 8 {
            return Err(TriageError::Config(
                "security.salt must be at least 8 bytes".to_string(),
            ));
        }

        if self.search.default_max_results == 0 {
            return Err(TriageError::Config(
                "search.default_max_results must be at least 1".to_string(),
            ));
        }
        if self.search.default_max_results > MAX_RESULTS_LIMIT {
            return Err(TriageError::Config(format!(
                "search.default_max_results cannot exceed {}",
                MAX_RESULTS_LIMIT
            )));
        }

        if self.search.provider_timeout_secs == 0 {
            return Err(TriageError::Config(
                "search.provider_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.search.max_concurrent_accounts == 0 {
            return Err(TriageError::Config(
                "search.max_concurrent_accounts must be at least 1".to_string(),
            ));
        }
        if self.search.max_concurrent_accounts > 64 {
            return Err(TriageError::Config(
                "search.max_concurrent_accounts cannot exceed 64".to_string(),
            ));
        }

        if !(16..=2000).contains(&self.search.snippet_length) {
            return Err(TriageError::Config(
                "search.snippet_length must be between 16 and 2000".to_string(),
            ));
        }

        // Keep Gmail fan-in well under the 250 quota units/sec per user
        if self.gmail.max_concurrent_requests == 0 {
            return Err(TriageError::Config(
                "gmail.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.gmail.max_concurrent_requests > 50 {
            return Err(TriageError::Config(
                "gmail.max_concurrent_requests cannot exceed 50".to_string(),
            ));
        }

        if self.imap.connect_timeout_secs == 0 {
            return Err(TriageError::Config(
                "imap.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.imap.default_mailbox.trim().is_empty() {
            return Err(TriageError::Config(
                "imap.default_mailbox cannot be empty".to_string(),
            ));
        }

        for keyword in self
            .classification
            .urgent_keywords
            .iter()
            .chain(self.classification.important_keywords.iter())
        {
            if keyword.trim().is_empty() {
                return Err(TriageError::Config(
                    "classification keyword lists cannot contain empty strings".to_string(),
                ));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
