//! `reqwest`-backed transport for the tracker API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::time::Duration;
use url::Url;

use super::{HttpRequest, HttpResponse, Transport};
use crate::config::ApiConfig;
use crate::error::TransportError;

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  timeout: Duration,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;
    let timeout = Duration::from_secs(config.request_timeout_secs);

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      timeout,
      token,
    })
  }

  fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(url)
      .map_err(|e| TransportError::Connectivity(format!("invalid url {}: {}", url, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn call(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|e| {
      TransportError::Connectivity(format!("invalid method {}: {}", request.method, e))
    })?;

    let mut builder = self.client.request(method, url);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        TransportError::Timeout(self.timeout)
      } else {
        TransportError::Connectivity(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| TransportError::Connectivity(format!("failed reading body: {}", e)))?;

    Ok(HttpResponse {
      status,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_relative_urls_join_base() {
    let config = ApiConfig {
      base_url: "http://localhost:8000/".to_string(),
      ..ApiConfig::default()
    };
    let transport = HttpTransport::new(&config, None).unwrap();

    let url = transport.resolve("/api/v1/positions/").unwrap();
    assert_eq!(url.as_str(), "http://localhost:8000/api/v1/positions/");

    let absolute = transport.resolve("https://example.com/health").unwrap();
    assert_eq!(absolute.as_str(), "https://example.com/health");
  }

  #[test]
  fn test_rejects_bad_base_url() {
    let config = ApiConfig {
      base_url: "not a url".to_string(),
      ..ApiConfig::default()
    };
    assert!(HttpTransport::new(&config, None).is_err());
  }
}
