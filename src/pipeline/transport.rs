//! Single-attempt JSON request primitive.
//!
//! [`Transport::request`] sends one [`RequestSpec`] and returns the parsed
//! JSON body. It never retries and never caches; a caller that wants retries
//! wraps the whole pipeline run.
//!
//! The timeout is enforced by reqwest per request. When it elapses the
//! in-flight request future is dropped, which aborts the connection instead
//! of leaving it to finish in the background.

use crate::error::RepromptError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// One HTTP request, built per call and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

const JSON: &str = "application/json";

impl RequestSpec {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: vec![(ACCEPT.to_string(), JSON.to_string())],
            body: None,
            timeout,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![
                (ACCEPT.to_string(), JSON.to_string()),
                (CONTENT_TYPE.to_string(), JSON.to_string()),
            ],
            body: Some(body),
            timeout,
        }
    }
}

/// Performs one request and yields its JSON body.
///
/// Implemented by [`HttpTransport`]; tests substitute a scripted double.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, spec: RequestSpec) -> Result<Value, RepromptError>;
}

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, spec: RequestSpec) -> Result<Value, RepromptError> {
        debug!("{} {}", spec.method, spec.url);

        let headers = build_headers(&spec)?;
        let mut req = self
            .client
            .request(spec.method.clone(), &spec.url)
            .headers(headers)
            .timeout(spec.timeout);
        if let Some(ref body) = spec.body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| classify(&spec.url, spec.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RepromptError::Http {
                url: spec.url,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| classify(&spec.url, spec.timeout, e))?;
        serde_json::from_str(&text).map_err(|e| RepromptError::Parse {
            url: spec.url,
            reason: e.to_string(),
        })
    }
}

fn build_headers(spec: &RequestSpec) -> Result<HeaderMap, RepromptError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &spec.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RepromptError::Internal(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RepromptError::Internal(format!("invalid header value for '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Map a reqwest failure onto the transport taxonomy.
pub(crate) fn classify(url: &str, timeout: Duration, e: reqwest::Error) -> RepromptError {
    if e.is_timeout() {
        RepromptError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_decode() {
        RepromptError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        RepromptError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}
