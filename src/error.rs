use std::fmt;

use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error taxonomy for account management and cross-account search
#[derive(Error, Debug)]
pub enum TriageError {
    /// Malformed or missing input, rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Uniqueness violation (e.g. duplicate account name)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown account id or name
    #[error("Not found: {0}")]
    NotFound(String),

    /// A specific account's transport or auth failure
    #[error("Provider error ({provider}, account {account_id}): {failure}")]
    Provider {
        account_id: String,
        provider: String,
        failure: ProviderFailure,
    },

    /// The resolved account scope is empty
    #[error("{0}")]
    NoAccounts(NoAccountsReason),

    /// Storage layer error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Credential encryption/decryption failure
    #[error("Credential encryption error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TriageError {
    /// Build a provider error for one account
    pub fn provider(
        account_id: impl Into<String>,
        provider: impl Into<String>,
        failure: ProviderFailure,
    ) -> Self {
        TriageError::Provider {
            account_id: account_id.into(),
            provider: provider.into(),
            failure,
        }
    }

    /// Check if the error is transient and the call may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            TriageError::Provider { failure, .. } => failure.is_transient(),
            _ => false,
        }
    }
}

/// Why a fan-out had no accounts to work with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoAccountsReason {
    /// No accounts have been registered at all
    NoneConfigured,
    /// Accounts exist but all are disabled
    NoneActive,
    /// An explicit id list was given and none resolved to an active account
    NoneResolved,
    /// Every targeted account failed or timed out
    AllUnreachable,
}

impl fmt::Display for NoAccountsReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NoAccountsReason::NoneConfigured => {
                "No email accounts configured. Add an account first."
            }
            NoAccountsReason::NoneActive => {
                "No active email accounts. Enable an account to search it."
            }
            NoAccountsReason::NoneResolved => {
                "None of the requested account ids match an active account."
            }
            NoAccountsReason::AllUnreachable => {
                "All targeted email accounts are unreachable."
            }
        };
        f.write_str(msg)
    }
}

/// Transport/auth failure kinds reported by a provider client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Rate limit exceeded - should retry after specified seconds
    #[error("rate limit exceeded, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    /// Network-related error (connection issues, resets, etc.)
    #[error("network error: {0}")]
    Network(String),

    /// Server returned 5xx error
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Call exceeded its deadline
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// Authentication or token refresh failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Bad request (400) or rejected command
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource not found (404) or unknown mailbox
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected or malformed provider response
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ProviderFailure {
    /// Check if the failure is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderFailure::RateLimited { .. }
                | ProviderFailure::Server { .. }
                | ProviderFailure::Network(_)
        )
    }

    /// Check if the failure is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = response.headers().get("retry-after") {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
                let now = std::time::SystemTime::now();
                if let Ok(duration) = http_date.duration_since(now) {
                    return duration.as_secs();
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<google_gmail1::Error> for ProviderFailure {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => ProviderFailure::RateLimited {
                        retry_after: parse_retry_after_header(response),
                    },
                    401 => ProviderFailure::Auth(message),
                    404 => ProviderFailure::NotFound("Resource not found".to_string()),
                    400 | 403 => ProviderFailure::BadRequest(message),
                    500..=599 => ProviderFailure::Server {
                        status: status_code,
                        message,
                    },
                    _ => ProviderFailure::Protocol(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => {
                ProviderFailure::BadRequest(format!("{}", err))
            }
            google_gmail1::Error::MissingToken(ref err) => ProviderFailure::Auth(err.to_string()),
            google_gmail1::Error::HttpError(ref err) => {
                ProviderFailure::Network(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => ProviderFailure::Network(err.to_string()),
            _ => ProviderFailure::Protocol(error.to_string()),
        }
    }
}

impl From<async_imap::error::Error> for ProviderFailure {
    fn from(error: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;

        match error {
            ImapError::Io(err) => ProviderFailure::Network(err.to_string()),
            ImapError::ConnectionLost => {
                ProviderFailure::Network("connection lost".to_string())
            }
            ImapError::No(msg) => ProviderFailure::BadRequest(msg),
            ImapError::Bad(msg) => ProviderFailure::BadRequest(msg),
            other => ProviderFailure::Protocol(other.to_string()),
        }
    }
}
