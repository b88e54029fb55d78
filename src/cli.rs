//! Command-line interface

use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{AccountUpdate, NewAccount};
use crate::service::{SearchEmailsParams, UrgentEmailsParams};

#[derive(Parser, Debug)]
#[command(name = "mail-triage")]
#[command(version)]
#[command(about = "Search and triage mail across Gmail and IMAP accounts", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mail-triage.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage registered accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Search all (or selected) accounts and print ranked results
    Search {
        /// Query; Gmail syntax, translated for IMAP accounts
        query: String,

        /// Restrict to these accounts (id, name or email); repeatable
        #[arg(short, long = "account")]
        accounts: Vec<String>,

        /// Mailboxes to search in each account; repeatable
        #[arg(short, long = "mailbox")]
        mailboxes: Vec<String>,

        /// Maximum number of results (1-500)
        #[arg(short = 'n', long)]
        max_results: Option<usize>,

        /// Drop results with a lower urgency score
        #[arg(long)]
        min_urgency: Option<f64>,

        /// Drop results with a lower importance score
        #[arg(long)]
        min_importance: Option<f64>,
    },

    /// Show urgent and important mail
    Urgent {
        /// Maximum results per category (1-500)
        #[arg(short = 'n', long)]
        max_results: Option<usize>,

        /// Restrict to these accounts (id, name or email); repeatable
        #[arg(short, long = "account")]
        accounts: Vec<String>,

        /// Only unread messages
        #[arg(long)]
        only_unread: bool,
    },

    /// List the selectable mailboxes of an account
    Mailboxes {
        /// Account id, name or email
        account: String,
    },

    /// Inspect cached classifications
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "mail-triage.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Register a Gmail or IMAP account
    Add(AddAccountArgs),

    /// List accounts
    List {
        /// Include disabled accounts
        #[arg(long)]
        all: bool,
    },

    /// Remove an account and its cached results
    Remove { account: String },

    /// Include an account in searches again
    Enable { account: String },

    /// Exclude an account from searches without removing it
    Disable { account: String },

    /// Change account settings or credentials
    Update(UpdateAccountArgs),

    /// Check that an account's credentials and server work
    Validate { account: String },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Cached classifications for an account, most urgent first
    Show { account: String },
}

/// Credential flags shared by `account add` and `account update`
#[derive(Args, Debug, Default)]
pub struct CredentialArgs {
    /// Gmail OAuth refresh token
    #[arg(long)]
    pub refresh_token: Option<String>,

    /// Gmail OAuth client id (overrides the config file)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Gmail OAuth client secret (overrides the config file)
    #[arg(long)]
    pub client_secret: Option<String>,

    /// IMAP server host
    #[arg(long)]
    pub host: Option<String>,

    /// IMAP server port
    #[arg(long)]
    pub port: Option<u16>,

    /// IMAP login
    #[arg(long)]
    pub username: Option<String>,

    /// IMAP password
    #[arg(long)]
    pub password: Option<String>,

    /// Connect to IMAP without TLS
    #[arg(long)]
    pub no_tls: bool,
}

#[derive(Args, Debug)]
pub struct AddAccountArgs {
    /// Unique friendly name
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub email: String,

    /// gmail or imap
    #[arg(long)]
    pub provider: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Mailbox searched when none is given
    #[arg(long)]
    pub mailbox: Option<String>,

    /// Urgent keywords for this account (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub urgent_keywords: Vec<String>,

    /// Important keywords for this account (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub important_keywords: Vec<String>,
}

impl From<AddAccountArgs> for NewAccount {
    fn from(args: AddAccountArgs) -> Self {
        let creds = args.credentials;
        NewAccount {
            name: args.name,
            email: args.email,
            provider: args.provider,
            refresh_token: creds.refresh_token,
            client_id: creds.client_id,
            client_secret: creds.client_secret,
            host: creds.host,
            port: creds.port,
            username: creds.username,
            password: creds.password,
            use_tls: creds.no_tls.then_some(false),
            default_mailbox: args.mailbox,
            urgent_keywords: args.urgent_keywords,
            important_keywords: args.important_keywords,
        }
    }
}

#[derive(Args, Debug)]
pub struct UpdateAccountArgs {
    /// Account id, name or email
    pub account: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub email: Option<String>,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Re-enable TLS for an IMAP account
    #[arg(long, conflicts_with = "no_tls")]
    pub tls: bool,

    #[arg(long)]
    pub mailbox: Option<String>,

    /// Replace the urgent keywords (comma separated, empty to clear)
    #[arg(long, value_delimiter = ',')]
    pub urgent_keywords: Option<Vec<String>>,

    /// Replace the important keywords (comma separated, empty to clear)
    #[arg(long, value_delimiter = ',')]
    pub important_keywords: Option<Vec<String>>,
}

impl UpdateAccountArgs {
    pub fn to_update(&self) -> AccountUpdate {
        let creds = &self.credentials;
        let use_tls = if self.tls {
            Some(true)
        } else if creds.no_tls {
            Some(false)
        } else {
            None
        };

        AccountUpdate {
            name: self.name.clone(),
            email: self.email.clone(),
            default_mailbox: self.mailbox.clone(),
            urgent_keywords: self.urgent_keywords.clone(),
            important_keywords: self.important_keywords.clone(),
            refresh_token: creds.refresh_token.clone(),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            host: creds.host.clone(),
            port: creds.port,
            username: creds.username.clone(),
            password: creds.password.clone(),
            use_tls,
        }
    }
}

/// Build search parameters; `account_ids` are already resolved to ids
pub fn search_params(
    query: String,
    account_ids: Vec<String>,
    mailboxes: Vec<String>,
    max_results: Option<usize>,
    min_urgency: Option<f64>,
    min_importance: Option<f64>,
) -> SearchEmailsParams {
    SearchEmailsParams {
        query,
        account_ids: (!account_ids.is_empty()).then_some(account_ids),
        mailboxes,
        max_results,
        min_urgency_score: min_urgency,
        min_importance_score: min_importance,
    }
}

pub fn urgent_params(
    account_ids: Vec<String>,
    max_results: Option<usize>,
    only_unread: bool,
) -> UrgentEmailsParams {
    UrgentEmailsParams {
        max_results,
        account_ids: (!account_ids.is_empty()).then_some(account_ids),
        only_unread,
    }
}

/// Spinner on stderr while provider calls run
pub fn spinner(multi: &MultiProgress, msg: &str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed:>4}] {msg}") {
        pb.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
