use std::{error::Error as StdError, fmt, io, sync::Arc};

use regex::Regex;
use reqwest::{Method, Request, Response, StatusCode};

use crate::{Error, RequestContext, Result, RetryOptions};

/// Header names that mark any request as idempotent, whatever its method.
pub const IDEMPOTENCY_KEY_HEADERS: [&str; 2] = ["idempotency-key", "x-idempotency-key"];

/// Returns `true` if `request` may be sent again without duplicating side effects.
///
/// An absent request is never idempotent. An empty `idempotent_methods` list
/// treats every request as idempotent.
pub fn is_idempotent(request: Option<&Request>, idempotent_methods: &[Method]) -> bool {
    let Some(request) = request else {
        return false;
    };
    if idempotent_methods.is_empty() {
        return true;
    }
    if IDEMPOTENCY_KEY_HEADERS
        .iter()
        .any(|name| request.headers().contains_key(*name))
    {
        return true;
    }
    idempotent_methods.contains(request.method())
}

type ErrorPredicate = dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync;

/// Identifies errors that must never be retried.
///
/// A matcher is tested against the error and every error in its `source()`
/// chain, so wrapped errors match as well.
#[derive(Clone)]
pub struct ErrorMatcher {
    name: String,
    predicate: Arc<ErrorPredicate>,
}

impl ErrorMatcher {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Matches any error of concrete type `E`.
    pub fn is<E: StdError + 'static>() -> Self {
        Self::new(std::any::type_name::<E>(), |err| err.is::<E>())
    }

    /// Matches I/O errors of the given kind.
    pub fn io_kind(kind: io::ErrorKind) -> Self {
        Self::new(format!("io::ErrorKind::{kind:?}"), move |err| {
            err.downcast_ref::<io::Error>()
                .is_some_and(|io_err| io_err.kind() == kind)
        })
    }

    pub fn matches(&self, err: &(dyn StdError + 'static)) -> bool {
        error_chain(err).any(|e| (self.predicate)(e))
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

/// Why a completed attempt was or was not retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    #[error("unsupported protocol scheme: {0}")]
    UnsupportedScheme(String),
    #[error("certificate signed by unknown authority: {0}")]
    UnknownAuthority(String),
    #[error("error excluded from retry: {0}")]
    Excluded(String),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(StatusCode),
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryVerdict {
    pub retry: bool,
    pub diagnostic: Option<Diagnostic>,
}

impl RetryVerdict {
    fn retry() -> Self {
        Self {
            retry: true,
            diagnostic: None,
        }
    }

    fn stop() -> Self {
        Self {
            retry: false,
            diagnostic: None,
        }
    }

    fn with(retry: bool, diagnostic: Diagnostic) -> Self {
        Self {
            retry,
            diagnostic: Some(diagnostic),
        }
    }
}

/// A single completed try, as seen by the retry engine.
#[derive(Clone, Copy)]
pub struct Attempt<'a> {
    pub request: Option<&'a Request>,
    pub context: &'a RequestContext,
    pub response: Option<&'a Response>,
    pub error: Option<&'a (dyn StdError + 'static)>,
}

impl<'a> Attempt<'a> {
    pub fn new(request: Option<&'a Request>, context: &'a RequestContext) -> Self {
        Self {
            request,
            context,
            response: None,
            error: None,
        }
    }

    pub fn with_response(mut self, response: &'a Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: &'a (dyn StdError + 'static)) -> Self {
        self.error = Some(error);
        self
    }
}

/// Patterns for error classes that no retry can fix.
#[derive(Debug)]
struct StructuralPatterns {
    redirects: Regex,
    scheme: Regex,
    unknown_authority: Regex,
}

impl StructuralPatterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            redirects: compile_pattern(r"(?i)stopped after \d+ redirects|too many redirects")?,
            scheme: compile_pattern(
                r"(?i)unsupported (?:protocol|url) scheme|url scheme is not allowed",
            )?,
            unknown_authority: compile_pattern(
                r"(?i)unknown ?issuer|unable to get local issuer certificate|self[- ]signed certificate|unknown authority",
            )?,
        })
    }
}

/// Provisioned, immutable form of [`RetryOptions`].
///
/// Safe to share across tasks; holds no per-request state.
#[derive(Debug)]
pub struct RetryPolicy {
    idempotent_methods: Vec<Method>,
    no_retry_errors: Vec<ErrorMatcher>,
    no_retry_patterns: Vec<Regex>,
    structural: StructuralPatterns,
}

impl RetryOptions {
    /// Validates methods and compiles error patterns.
    pub fn provision(&self) -> Result<RetryPolicy> {
        let idempotent_methods = self
            .idempotent_methods
            .iter()
            .map(|name| {
                Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| Error::InvalidMethod(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let no_retry_patterns = self
            .no_retry_error_patterns
            .iter()
            .map(|pattern| compile_pattern(pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(RetryPolicy {
            idempotent_methods,
            no_retry_errors: self.no_retry_errors.clone(),
            no_retry_patterns,
            structural: StructuralPatterns::compile()?,
        })
    }
}

impl RetryPolicy {
    pub fn idempotent_methods(&self) -> &[Method] {
        &self.idempotent_methods
    }

    /// Decides whether the attempt should be repeated.
    ///
    /// The first matching rule wins: cancelled context, non-idempotent
    /// request, error classification, then response status.
    pub fn should_retry(&self, attempt: &Attempt<'_>) -> RetryVerdict {
        if attempt.context.is_done() {
            return RetryVerdict::stop();
        }
        if !is_idempotent(attempt.request, &self.idempotent_methods) {
            return RetryVerdict::stop();
        }

        if let Some(err) = attempt.error {
            return self.classify_error(err);
        }

        let Some(response) = attempt.response else {
            return RetryVerdict::stop();
        };

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryVerdict::retry(),
            StatusCode::NOT_IMPLEMENTED => RetryVerdict::stop(),
            status if status.is_server_error() => {
                RetryVerdict::with(true, Diagnostic::UnexpectedStatus(status))
            }
            _ => RetryVerdict::stop(),
        }
    }

    fn classify_error(&self, err: &(dyn StdError + 'static)) -> RetryVerdict {
        let message = chain_message(err);

        let redirected = error_chain(err)
            .filter_map(|e| e.downcast_ref::<reqwest::Error>())
            .any(reqwest::Error::is_redirect);
        if redirected || self.structural.redirects.is_match(&message) {
            return RetryVerdict::with(false, Diagnostic::TooManyRedirects(message));
        }
        if self.structural.scheme.is_match(&message) {
            return RetryVerdict::with(false, Diagnostic::UnsupportedScheme(message));
        }
        if self.structural.unknown_authority.is_match(&message) {
            return RetryVerdict::with(false, Diagnostic::UnknownAuthority(message));
        }

        let excluded = self.no_retry_errors.iter().any(|m| m.matches(err))
            || self.no_retry_patterns.iter().any(|re| re.is_match(&message));
        if excluded {
            return RetryVerdict::with(false, Diagnostic::Excluded(message));
        }

        RetryVerdict::retry()
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })
}

fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Joins the messages of `err` and all of its sources with `": "`.
fn chain_message(err: &(dyn StdError + 'static)) -> String {
    error_chain(err)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
