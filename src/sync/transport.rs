//! Network transport used by the processor and the read client.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::{Method, Operation};

/// One request issued verbatim from an operation descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
  pub method: Method,
  /// Absolute URL or a path relative to the transport's base URL
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
}

impl OutboundRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn from_operation(operation: &Operation) -> Self {
    Self {
      method: operation.method,
      url: operation.endpoint.clone(),
      headers: operation.headers.clone(),
      body: Some(operation.mutation.body()),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  pub body: String,
}

impl TransportResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json(&self) -> Result<Value> {
    if self.body.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

/// A request that produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("network error: {0}")]
  Network(String),
  /// The request could not be built; retrying cannot help
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Request/response transport.
///
/// Implementations return a response for every HTTP status; only failures to
/// obtain one are errors.
pub trait Transport: Send + Sync {
  fn send(
    &self,
    request: OutboundRequest,
  ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

/// HTTP transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Option<Url>,
  token: Option<String>,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(base_url: Option<&str>, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base_url = base_url
      .map(|u| Url::parse(u).map_err(|e| eyre!("Invalid API base URL {}: {}", u, e)))
      .transpose()?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
      timeout,
    })
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  fn resolve(&self, target: &str) -> Result<Url, TransportError> {
    if let Ok(url) = Url::parse(target) {
      return Ok(url);
    }

    let base = self.base_url.as_ref().ok_or_else(|| {
      TransportError::InvalidRequest(format!("relative endpoint {} without a base URL", target))
    })?;
    base
      .join(target)
      .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", target, e)))
  }

  fn headers(&self, headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();

    if let Some(token) = &self.token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| TransportError::InvalidRequest(format!("API token: {}", e)))?;
      map.insert(AUTHORIZATION, value);
    }

    for (name, value) in headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::InvalidRequest(format!("header {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidRequest(format!("header {}: {}", name.as_str(), e)))?;
      map.insert(name, value);
    }

    Ok(map)
  }

  async fn execute(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let headers = self.headers(&request.headers)?;

    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url).headers(headers);
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| self.classify(e))?;

    Ok(TransportResponse { status, body })
  }

  fn classify(&self, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
      TransportError::Timeout(self.timeout)
    } else if err.is_builder() {
      TransportError::InvalidRequest(err.to_string())
    } else {
      TransportError::Network(err.to_string())
    }
  }
}

impl Transport for HttpTransport {
  fn send(
    &self,
    request: OutboundRequest,
  ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
    Box::pin(self.execute(request))
  }
}
