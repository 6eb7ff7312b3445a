use std::{fmt, sync::Arc, time::Duration};

use reqwest::{Request, Response};

use crate::{
    retry::Attempt,
    transport::{chain, Transport, TransportWrapper},
    ClientOptions, RequestContext, Result, RetryPolicy,
};

/// Sends requests through a composed transport chain, retrying attempts the
/// [`RetryPolicy`] deems safe and transient.
#[derive(Clone)]
pub struct InterceptClient {
    transport: Arc<dyn Transport>,
    retry: Option<Arc<RetryPolicy>>,
    options: ClientOptions,
}

impl fmt::Debug for InterceptClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptClient")
            .field("retry", &self.retry.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl InterceptClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: None,
            options: ClientOptions::default(),
        }
    }

    /// Creates a client over [`chain`]ed wrappers, first one outermost.
    pub fn from_wrappers(wrappers: Vec<Box<dyn TransportWrapper>>) -> Self {
        Self::new(chain(wrappers))
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Enables retries. Without a policy no attempt is ever repeated.
    pub fn with_retry_policy(mut self, policy: Arc<RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Executes `request`, retrying up to `max_retries` times.
    ///
    /// Requests whose body cannot be cloned are sent once. The last response
    /// or error is returned when the policy declines or retries run out.
    pub async fn execute(&self, mut request: Request, ctx: &RequestContext) -> Result<Response> {
        if self.options.timeout_ms > 0 && request.timeout().is_none() {
            *request.timeout_mut() = Some(Duration::from_millis(self.options.timeout_ms));
        }

        let mut attempt = 0usize;
        loop {
            let policy = self.retry.as_ref().filter(|_| attempt < self.options.max_retries);
            let replay = policy.and_then(|_| request.try_clone());

            let result = self.transport.round_trip(request, ctx).await;

            let (Some(policy), Some(next)) = (policy, replay) else {
                return result;
            };
            let verdict = {
                let seen = Attempt::new(Some(&next), ctx);
                let seen = match &result {
                    Ok(response) => seen.with_response(response),
                    Err(err) => seen.with_error(err),
                };
                policy.should_retry(&seen)
            };
            if !verdict.retry {
                return result;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, diagnostic = ?verdict.diagnostic, "retrying request");

            if !self.wait_before_retry(attempt, ctx).await {
                return result;
            }
            drop(result);
            attempt += 1;
            request = next;
        }
    }

    /// Sleeps with exponential backoff. Returns `false` if the context was
    /// cancelled while waiting.
    async fn wait_before_retry(&self, attempt: usize, ctx: &RequestContext) -> bool {
        let exp = attempt.min(16) as u32;
        let multiplier = 1u64 << exp;
        let delay_ms = self.options.retry_backoff_ms.saturating_mul(multiplier);

        #[cfg(feature = "tracing")]
        tracing::debug!("retrying request after {} ms", delay_ms);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
            _ = ctx.done() => false,
        }
    }
}
