use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request state threaded explicitly through the transport chain.
///
/// Carries the cancellation signal the retry engine must respect and the set
/// of headers [`crate::PropagateHeaders`] copies onto the outbound request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    propagate: HeaderMap,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `token` as the cancellation signal, e.g. one tied to the inbound
    /// server request that triggered this call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Adds a header to the propagation set, replacing any previous value.
    pub fn with_propagated_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.propagate.insert(name, value);
        self
    }

    /// Copies the named headers present in `inbound` into the propagation set.
    ///
    /// Missing names are skipped. All values of a repeated header are kept.
    pub fn propagate_from(mut self, inbound: &HeaderMap, names: &[HeaderName]) -> Self {
        for name in names {
            let mut values = inbound.get_all(name).iter();
            if let Some(first) = values.next() {
                self.propagate.insert(name.clone(), first.clone());
                for value in values {
                    self.propagate.append(name.clone(), value.clone());
                }
            }
        }
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn propagated_headers(&self) -> &HeaderMap {
        &self.propagate
    }

    /// Signals cancellation to everything observing this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or its deadline elapses.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}
