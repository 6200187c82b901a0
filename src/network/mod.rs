//! The narrow network contract the engine consumes.
//!
//! Everything remote goes through `Transport::call`. A returned `HttpResponse`
//! means the server answered (with any status); `TransportError` means nothing
//! came back. Connectivity is tracked separately by `Connectivity`.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::info;

use crate::error::{SyncError, TransportError};

pub use http::HttpTransport;

/// An outgoing request. `url` may be absolute or relative to the API base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
  pub method: String,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      method: method.into(),
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Attach a JSON body and content type.
  pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
    self
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    self.body = Some(body);
    self
  }
}

/// A response from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Trait for network backends.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn call(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Issue `request` and classify the outcome: 2xx/3xx is `Ok`, anything else is a `SyncError`.
pub async fn call_checked(
  transport: &dyn Transport,
  request: &HttpRequest,
) -> Result<HttpResponse, SyncError> {
  let response = transport.call(request).await?;
  match SyncError::from_status(response.status, &response.body) {
    Some(err) => Err(err),
    None => Ok(response),
  }
}

/// Shared online/offline flag with change notification.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true when this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Receiver that wakes on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_online_reports_transitions() {
    let connectivity = Connectivity::new(true);
    assert!(!connectivity.set_online(true));
    assert!(connectivity.set_online(false));
    assert!(!connectivity.is_online());
    assert!(connectivity.set_online(true));
  }

  #[tokio::test]
  async fn test_subscribe_sees_change() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow());
  }

  #[test]
  fn test_request_builder() {
    let request = HttpRequest::new("PUT", "/api/v1/positions/7")
      .with_header("x-client", "sync")
      .with_json_body(b"{}".to_vec());
    assert_eq!(request.headers["content-type"], "application/json");
    assert_eq!(request.headers["x-client"], "sync");
    assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
  }
}
