use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or request execution error from `reqwest`.
    #[error("transport error")]
    Transport(#[source] reqwest::Error),
    /// The request context was cancelled or its deadline elapsed.
    #[error("request cancelled")]
    Cancelled,
    /// A no-retry error pattern failed to compile.
    #[error("invalid no-retry error pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    /// A configured idempotent method is not a valid HTTP method.
    #[error("invalid idempotent method '{0}'")]
    InvalidMethod(String),
    /// A mandatory component was not configured.
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    /// The mock matcher failed to evaluate a request.
    #[error("match mocker failed for {url}")]
    Match {
        url: String,
        #[source]
        source: BoxError,
    },
    /// A mock generator (synthetic or recorded round trip) failed.
    #[error("execute mock func failed for {url}")]
    Generate {
        url: String,
        #[source]
        source: Box<Error>,
    },
    /// The response cache could not fetch or compute an entry.
    #[error("get mock response from cache failed for {url}")]
    Cache {
        url: String,
        #[source]
        source: Arc<Error>,
    },
    /// A mock generator panicked instead of returning.
    #[error("mock generator panicked")]
    GeneratorPanicked,
    /// The in-memory cache lock was poisoned by a panicking holder.
    #[error("mock cache lock poisoned")]
    CachePoisoned,
    /// The cache resolved a key without producing a response.
    #[error("got empty mock response for {url}")]
    EmptyMock { url: String },
    /// A response could not be dumped to or parsed from its wire form.
    #[error("wire error: {0}")]
    Wire(String),
    /// Mock rule configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Wraps an arbitrary matcher failure with the request URL.
    pub fn matching(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Match {
            url: url.into(),
            source: source.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err)
    }
}
