use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Request, Response, StatusCode,
};

use crate::{
    cache::{Generator, ResponseCache},
    matcher::Matcher,
    transport::{HttpTransport, Transport, TransportWrapper},
    wire::{decode_response, dump_response},
    Error, RequestContext, Result,
};

/// Request header whose presence enables mocking for that request.
pub const MOCK_SWITCH_HEADER: &str = "x-mock-switch";
/// Header stamped on every served mock response.
pub const MOCK_RESPONSE_HEADER: &str = "x-mock-response";
pub const MOCK_RESPONSE_VALUE: &str = "true";

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60 * 60);

/// Optional behavior attached to a mocker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockExtension {
    /// Delay applied before a served mock response is returned.
    pub latency: Duration,
}

/// Synthesizes a response without touching the network.
#[async_trait]
pub trait MockResponder: Send + Sync {
    async fn respond(&self, request: Request) -> Result<Response>;
}

/// Strategy producing a mock response.
#[derive(Clone)]
pub enum Mocker {
    /// Forwards to the real transport; the recorded response is cached.
    Transparent { extension: Option<MockExtension> },
    /// Serves a synthetic response.
    Opaque {
        responder: Arc<dyn MockResponder>,
        extension: Option<MockExtension>,
    },
}

impl Mocker {
    pub fn transparent() -> Self {
        Self::Transparent { extension: None }
    }

    pub fn opaque(responder: impl MockResponder + 'static) -> Self {
        Self::Opaque {
            responder: Arc::new(responder),
            extension: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        let ext = match &mut self {
            Self::Transparent { extension } | Self::Opaque { extension, .. } => extension,
        };
        ext.get_or_insert_with(MockExtension::default).latency = latency;
        self
    }

    pub fn is_transparent(&self) -> bool {
        matches!(self, Self::Transparent { .. })
    }

    pub fn extension(&self) -> Option<&MockExtension> {
        match self {
            Self::Transparent { extension } | Self::Opaque { extension, .. } => extension.as_ref(),
        }
    }
}

impl fmt::Debug for Mocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_transparent() {
            "Transparent"
        } else {
            "Opaque"
        };
        f.debug_struct("Mocker")
            .field("kind", &kind)
            .field("extension", &self.extension())
            .finish()
    }
}

/// Opaque responder serving a fixed status, header set and body.
#[derive(Clone, Debug)]
pub struct StaticResponder {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl StaticResponder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Responds with `body` serialized as JSON.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body.to_string())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[async_trait]
impl MockResponder for StaticResponder {
    async fn respond(&self, _request: Request) -> Result<Response> {
        let mut response = http::Response::new(self.body.clone());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        Ok(Response::from(response))
    }
}

/// Settings for [`MockerTransport`].
#[derive(Default)]
pub struct MockerTransportConfig {
    /// Required.
    pub matcher: Option<Arc<dyn Matcher>>,
    /// Required.
    pub cache: Option<Arc<dyn ResponseCache>>,
    /// Real transport; defaults to [`HttpTransport`].
    pub transport: Option<Arc<dyn Transport>>,
    /// Lifetime of cached mock responses; defaults to one hour.
    pub expiration: Option<Duration>,
}

impl MockerTransportConfig {
    /// Validates the configuration and fills defaults.
    pub fn build(self) -> Result<MockerTransport> {
        let matcher = self.matcher.ok_or(Error::MissingDependency("mock matcher"))?;
        let cache = self.cache.ok_or(Error::MissingDependency("mock cache"))?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::default()));
        let expiration = self
            .expiration
            .filter(|e| !e.is_zero())
            .unwrap_or(DEFAULT_EXPIRATION);

        #[cfg(feature = "tracing")]
        tracing::debug!(?expiration, "mocker transport provisioned");

        Ok(MockerTransport {
            matcher,
            cache,
            transport,
            expiration,
        })
    }
}

/// Transport serving cached mock responses for opted-in requests.
///
/// Requests without [`MOCK_SWITCH_HEADER`], or that the matcher does not
/// claim, go to the real transport untouched.
pub struct MockerTransport {
    matcher: Arc<dyn Matcher>,
    cache: Arc<dyn ResponseCache>,
    transport: Arc<dyn Transport>,
    expiration: Duration,
}

impl MockerTransport {
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    fn generator(&self, mocker: &Mocker, request: Request, ctx: &RequestContext) -> Generator {
        let url = request.url().to_string();
        let generate = match mocker {
            Mocker::Transparent { .. } => {
                let transport = self.transport.clone();
                let ctx = ctx.clone();
                async move { transport.round_trip(request, &ctx).await }.boxed()
            }
            Mocker::Opaque { responder, .. } => {
                let responder = responder.clone();
                async move { responder.respond(request).await }.boxed()
            }
        };
        async move {
            let response = generate.await.map_err(|err| Error::Generate {
                url: url.clone(),
                source: Box::new(err),
            })?;
            dump_response(response).await
        }
        .boxed()
    }
}

#[async_trait]
impl Transport for MockerTransport {
    async fn round_trip(&self, request: Request, ctx: &RequestContext) -> Result<Response> {
        if !request.headers().contains_key(MOCK_SWITCH_HEADER) {
            return self.transport.round_trip(request, ctx).await;
        }

        let url = request.url().to_string();
        let matched = self
            .matcher
            .match_request(&request)
            .map_err(|source| Error::Match {
                url: url.clone(),
                source,
            })?;
        let Some(matched) = matched else {
            #[cfg(feature = "tracing")]
            tracing::trace!(%url, "no mocker matched, passing through");
            return self.transport.round_trip(request, ctx).await;
        };

        let generate = self.generator(&matched.mocker, request, ctx);
        let raw = self
            .cache
            .fetch_or_compute(&matched.key, self.expiration, generate)
            .await
            .map_err(|source| Error::Cache {
                url: url.clone(),
                source,
            })?
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| Error::EmptyMock { url: url.clone() })?;

        let mut response = decode_response(&raw)?;
        response.headers_mut().insert(
            MOCK_RESPONSE_HEADER,
            HeaderValue::from_static(MOCK_RESPONSE_VALUE),
        );

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, key = %matched.key, status = %response.status(), "serving mock response");

        if let Some(ext) = matched.mocker.extension() {
            if !ext.latency.is_zero() {
                tokio::time::sleep(ext.latency).await;
            }
        }
        Ok(Response::from(response))
    }
}

impl TransportWrapper for MockerTransport {
    fn set_transport(&mut self, next: Arc<dyn Transport>) {
        self.transport = next;
    }
}
