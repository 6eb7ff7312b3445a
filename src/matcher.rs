use std::{collections::BTreeMap, hash::Hasher, time::Duration};

use reqwest::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    Method, Request, StatusCode,
};
use serde::Deserialize;
use twox_hash::XxHash64;

use crate::{
    mock::{Mocker, StaticResponder},
    Error, Result,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A request claimed by a [`Matcher`].
#[derive(Clone, Debug)]
pub struct MockMatch {
    /// Cache key; identical requests must map to identical keys.
    pub key: String,
    pub mocker: Mocker,
}

/// Decides whether a request is mocked, and how.
pub trait Matcher: Send + Sync {
    /// Returns `Ok(None)` when the request should go to the real transport.
    fn match_request(&self, request: &Request) -> std::result::Result<Option<MockMatch>, BoxError>;
}

/// One entry of a [`RuleMatcher`] document.
#[derive(Clone, Debug, Deserialize)]
pub struct MockRule {
    pub name: String,
    /// Matches any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    pub url_prefix: String,
    /// Record real traffic instead of synthesizing a response.
    #[serde(default)]
    pub transparent: bool,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Strings are sent verbatim; any other JSON value is sent as JSON.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    method: Option<Method>,
    url_prefix: String,
    mocker: Mocker,
}

/// Matches requests against an ordered rule list; the first hit wins.
///
/// Keys combine the rule name, method, URL and a hash of a buffered body.
#[derive(Debug)]
pub struct RuleMatcher {
    rules: Vec<CompiledRule>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<MockRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Loads rules from a JSON array of [`MockRule`] objects.
    pub fn from_json(document: &str) -> Result<Self> {
        let rules: Vec<MockRule> = serde_json::from_str(document)
            .map_err(|err| Error::Config(format!("invalid mock rules: {err}")))?;
        Self::new(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Matcher for RuleMatcher {
    fn match_request(&self, request: &Request) -> std::result::Result<Option<MockMatch>, BoxError> {
        let url = request.url().as_str();
        let Some(rule) = self.rules.iter().find(|rule| {
            rule.method.as_ref().map_or(true, |m| m == request.method())
                && url.starts_with(&rule.url_prefix)
        }) else {
            return Ok(None);
        };

        let mut key = format!("{}:{} {}", rule.name, request.method(), url);
        if let Some(body) = request.body() {
            let bytes = body
                .as_bytes()
                .ok_or("cannot derive mock key from a streaming request body")?;
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(bytes);
            key.push_str(&format!("#{:016x}", hasher.finish()));
        }

        Ok(Some(MockMatch {
            key,
            mocker: rule.mocker.clone(),
        }))
    }
}

fn compile_rule(rule: MockRule) -> Result<CompiledRule> {
    let invalid = |what: String| Error::Config(format!("mock rule '{}': {what}", rule.name));

    let method = rule
        .method
        .as_deref()
        .map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()))
        .transpose()
        .map_err(|_| invalid(format!("invalid method {:?}", rule.method)))?;

    let mut mocker = if rule.transparent {
        Mocker::transparent()
    } else {
        let status = StatusCode::from_u16(rule.status)
            .map_err(|_| invalid(format!("invalid status {}", rule.status)))?;
        let mut responder = StaticResponder::new(status);
        for (name, value) in &rule.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("invalid header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| invalid(format!("invalid value for header {name}")))?;
            responder = responder.with_header(name, value);
        }
        match &rule.body {
            None => {}
            Some(serde_json::Value::String(text)) => responder = responder.with_body(text.clone()),
            Some(json) => {
                if !rule.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    responder = responder
                        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                responder = responder.with_body(json.to_string());
            }
        }
        Mocker::opaque(responder)
    };
    if rule.latency_ms > 0 {
        mocker = mocker.with_latency(Duration::from_millis(rule.latency_ms));
    }

    Ok(CompiledRule {
        name: rule.name,
        method,
        url_prefix: rule.url_prefix,
        mocker,
    })
}
