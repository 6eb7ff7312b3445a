//! `intercept-http` composes transport-level behavior around outbound HTTP
//! requests without touching call sites.
//!
//! - [`chain`] links [`TransportWrapper`]s into one [`Transport`], first one outermost.
//! - [`RetryPolicy::should_retry`] classifies a completed [`Attempt`].
//! - [`MockerTransport`] serves cached, single-flight mock responses for
//!   requests carrying [`MOCK_SWITCH_HEADER`].
//! - [`InterceptClient`] drives a chain with retries and backoff.

mod cache;
mod client;
mod context;
mod error;
mod matcher;
mod mock;
mod options;
mod retry;
mod transport;
pub mod wire;

pub use cache::{Generator, MemoryCache, ResponseCache, SharedResult};
pub use client::InterceptClient;
pub use context::RequestContext;
pub use error::Error;
pub use matcher::{Matcher, MockMatch, MockRule, RuleMatcher};
pub use mock::{
    MockExtension, MockResponder, Mocker, MockerTransport, MockerTransportConfig,
    StaticResponder, MOCK_RESPONSE_HEADER, MOCK_RESPONSE_VALUE, MOCK_SWITCH_HEADER,
};
pub use options::{ClientOptions, RetryOptions};
pub use retry::{
    is_idempotent, Attempt, Diagnostic, ErrorMatcher, RetryPolicy, RetryVerdict,
    IDEMPOTENCY_KEY_HEADERS,
};
pub use transport::{chain, HttpTransport, PropagateHeaders, Transport, TransportWrapper};

pub type Result<T> = std::result::Result<T, Error>;
