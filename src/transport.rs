use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Request, Response};

use crate::{Error, RequestContext, Result};

/// Executes a single HTTP round trip.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request, ctx: &RequestContext) -> Result<Response>;
}

/// A transport that intercepts requests and delegates to another transport.
///
/// The delegate is set once while the chain is assembled. Wrappers are not
/// relinked after traffic starts flowing.
pub trait TransportWrapper: Transport {
    fn set_transport(&mut self, next: Arc<dyn Transport>);
}

/// Physical transport backed by a [`reqwest::Client`].
///
/// Resolves to [`Error::Cancelled`] when the context is cancelled or its
/// deadline elapses before the response headers arrive.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: Request, ctx: &RequestContext) -> Result<Response> {
        if ctx.is_done() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            result = self.http.execute(request) => result.map_err(Error::Transport),
            _ = ctx.done() => Err(Error::Cancelled),
        }
    }
}

struct Linked(Box<dyn TransportWrapper>);

#[async_trait]
impl Transport for Linked {
    async fn round_trip(&self, request: Request, ctx: &RequestContext) -> Result<Response> {
        self.0.round_trip(request, ctx).await
    }
}

/// Composes wrappers into a single transport.
///
/// Requests traverse the wrappers in the order given: the first wrapper is the
/// outermost and sees every request first and every response last. The last
/// wrapper keeps its own delegate. An empty list yields a plain
/// [`HttpTransport`].
pub fn chain(wrappers: Vec<Box<dyn TransportWrapper>>) -> Arc<dyn Transport> {
    let mut next: Option<Arc<dyn Transport>> = None;
    for mut wrapper in wrappers.into_iter().rev() {
        if let Some(inner) = next.take() {
            wrapper.set_transport(inner);
        }
        next = Some(Arc::new(Linked(wrapper)));
    }
    next.unwrap_or_else(|| Arc::new(HttpTransport::default()))
}

/// Copies the context's propagation set onto every outbound request.
///
/// Propagated headers replace same-named headers already on the request.
pub struct PropagateHeaders {
    next: Arc<dyn Transport>,
}

impl PropagateHeaders {
    pub fn new() -> Self {
        Self {
            next: Arc::new(HttpTransport::default()),
        }
    }
}

impl Default for PropagateHeaders {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for PropagateHeaders {
    async fn round_trip(&self, mut request: Request, ctx: &RequestContext) -> Result<Response> {
        let propagated = ctx.propagated_headers();
        if !propagated.is_empty() {
            let headers = request.headers_mut();
            for name in propagated.keys() {
                headers.remove(name);
                for value in propagated.get_all(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        self.next.round_trip(request, ctx).await
    }
}

impl TransportWrapper for PropagateHeaders {
    fn set_transport(&mut self, next: Arc<dyn Transport>) {
        self.next = next;
    }
}
