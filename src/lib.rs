//! Mail Triage
//!
//! Searches several Gmail and IMAP mailboxes at once, scores every result for
//! urgency and importance, and ranks them into a single list.
//!
//! # Overview
//!
//! - **Accounts**: registry of mailboxes with encrypted credentials in SQLite
//! - **Providers**: one client per backend behind a common trait
//! - **Classification**: deterministic keyword and signal scoring
//! - **Search**: concurrent fan-out with per-account failure isolation
//! - **Cache**: last classification per message, removed with its account
//!
//! # Example Usage
//!
//! ```no_run
//! use mail_triage::{config::Config, service::{SearchEmailsParams, TriageService}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("mail-triage.toml".as_ref()).await?;
//!     let service = TriageService::from_config(&config)?;
//!
//!     let response = service
//!         .search_emails(SearchEmailsParams {
//!             query: "from:boss is:unread".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     for result in response.results {
//!         println!("{:.2} {}", result.urgency_score, result.subject);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`cache`] - Classification cache keyed by account and message
//! - [`classifier`] - Urgency and importance scoring
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`crypto`] - Credential encryption at rest
//! - [`db`] - SQLite connection and schema
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures
//! - [`orchestrator`] - Multi-account search and ranking
//! - [`provider`] - Gmail and IMAP clients
//! - [`registry`] - Account registration and lookup
//! - [`service`] - Externally exposed operations

pub mod cache;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod service;

// Re-export commonly used types for convenience
pub use error::{ProviderFailure, Result, TriageError};

// Core data models
pub use models::{
    Account, AccountUpdate, Classification, ClassifiedResult, Credentials, EmailMessage,
    NewAccount, ProviderKind, SearchCriteria,
};

pub use classifier::Classifier;
pub use config::Config;
pub use provider::{ProviderClient, ProviderFactory};
pub use registry::AccountRegistry;
pub use service::{SearchEmailsParams, TriageService, UrgentEmailsParams};
