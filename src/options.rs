use serde::Deserialize;

use crate::retry::ErrorMatcher;

/// Configures HTTP timeout and retry behavior of [`crate::InterceptClient`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds. Zero disables the timeout.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 0,
            retry_backoff_ms: 250,
        }
    }
}

/// Retry eligibility settings.
///
/// This is the unvalidated form; call [`RetryOptions::provision`] once at
/// startup to obtain a [`crate::RetryPolicy`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Methods considered idempotent. Empty means every method is.
    pub idempotent_methods: Vec<String>,
    /// Regular expressions matched against error messages to suppress retry.
    pub no_retry_error_patterns: Vec<String>,
    /// Errors that must never trigger a retry.
    #[serde(skip)]
    pub no_retry_errors: Vec<ErrorMatcher>,
}

impl RetryOptions {
    /// Options treating the RFC 9110 idempotent methods as retry-safe.
    pub fn idempotent_only() -> Self {
        Self {
            idempotent_methods: ["GET", "HEAD", "OPTIONS", "TRACE", "PUT", "DELETE"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            ..Self::default()
        }
    }
}
