//! Cache keys and prefetchable resources for the tracker API.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Resource type names used in invalidation rules and queue items.
pub const POSITION: &str = "position";
pub const INTERVIEW: &str = "interview";
pub const STATISTICS: &str = "statistics";

/// API prefix of the tracker backend.
pub const API_PREFIX: &str = "/api/v1";

/// Cache keys for tracker queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerKey {
  /// A single position
  Position { id: String },
  /// Position list, optionally filtered (status, company, paging...)
  Positions { filter: Option<String> },
  /// A single interview
  Interview { id: String },
  /// Interviews, optionally scoped to a position
  Interviews {
    position_id: Option<String>,
    filter: Option<String>,
  },
  /// A statistics view (dashboard, timeline, companies...)
  Statistics { view: String },
}

impl TrackerKey {
  /// Cache key. List keys live under `<type>:list:` so wildcard rules catch them.
  pub fn cache_key(&self) -> String {
    match self {
      Self::Position { id } => format!("positions:{}", id),
      Self::Positions { filter } => format!("positions:list:{}", filter_segment(filter.as_deref())),
      Self::Interview { id } => format!("interviews:{}", id),
      Self::Interviews {
        position_id,
        filter,
      } => match position_id {
        Some(pid) => format!(
          "interviews:list:position:{}:{}",
          pid,
          filter_segment(filter.as_deref())
        ),
        None => format!("interviews:list:{}", filter_segment(filter.as_deref())),
      },
      Self::Statistics { view } => format!("statistics:{}", view),
    }
  }

  /// API path serving this resource.
  pub fn path(&self) -> String {
    match self {
      Self::Position { id } => format!("{}/positions/{}", API_PREFIX, id),
      Self::Positions { filter } => with_query(format!("{}/positions/", API_PREFIX), filter),
      Self::Interview { id } => format!("{}/interviews/{}", API_PREFIX, id),
      Self::Interviews {
        position_id: Some(pid),
        filter,
      } => with_query(format!("{}/positions/{}/interviews", API_PREFIX, pid), filter),
      Self::Interviews {
        position_id: None,
        filter,
      } => with_query(format!("{}/interviews/", API_PREFIX), filter),
      Self::Statistics { view } => format!("{}/statistics/{}", API_PREFIX, view),
    }
  }

  /// Resource type for invalidation and metrics.
  pub fn resource_type(&self) -> &'static str {
    match self {
      Self::Position { .. } | Self::Positions { .. } => POSITION,
      Self::Interview { .. } | Self::Interviews { .. } => INTERVIEW,
      Self::Statistics { .. } => STATISTICS,
    }
  }

  /// Build a prefetchable resource from this key.
  pub fn resource(&self, ttl: Duration) -> ResourceSpec {
    ResourceSpec {
      key: self.cache_key(),
      path: self.path(),
      ttl_secs: ttl.as_secs(),
      type_tag: self.resource_type().to_string(),
    }
  }
}

fn with_query(path: String, filter: &Option<String>) -> String {
  match filter {
    Some(q) if !q.trim().is_empty() => format!("{}?{}", path, q.trim()),
    _ => path,
  }
}

/// Stable key segment for a list filter: `all` when unfiltered, otherwise a
/// short hash of the normalized query string.
fn filter_segment(filter: Option<&str>) -> String {
  match filter.map(normalize_filter) {
    Some(f) if !f.is_empty() => {
      let mut hasher = Sha256::new();
      hasher.update(f.as_bytes());
      hex::encode(&hasher.finalize()[..8])
    }
    _ => "all".to_string(),
  }
}

/// Normalize a query string: trimmed, parameter names lowercased, parameters
/// sorted. Values keep their case since the server may distinguish them.
fn normalize_filter(filter: &str) -> String {
  let mut params: Vec<String> = filter
    .trim()
    .trim_start_matches('?')
    .split('&')
    .filter(|p| !p.is_empty())
    .map(|p| match p.split_once('=') {
      Some((name, value)) => format!("{}={}", name.to_lowercase(), value),
      None => p.to_lowercase(),
    })
    .collect();
  params.sort();
  params.join("&")
}

/// A resource the coordinator can fetch and cache on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
  /// Cache key to store under
  pub key: String,
  /// API path (relative to the base URL)
  pub path: String,
  pub ttl_secs: u64,
  #[serde(default = "default_type_tag")]
  pub type_tag: String,
}

fn default_type_tag() -> String {
  "json".to_string()
}

impl ResourceSpec {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

/// High-value, low-volatility resources warmed at startup.
pub fn default_warm_resources() -> Vec<ResourceSpec> {
  vec![
    TrackerKey::Positions { filter: None }.resource(Duration::from_secs(600)),
    TrackerKey::Interviews {
      position_id: None,
      filter: None,
    }
    .resource(Duration::from_secs(600)),
    TrackerKey::Statistics {
      view: "dashboard".into(),
    }
    .resource(Duration::from_secs(300)),
  ]
}

/// Short-TTL resources revalidated in the background.
pub fn default_critical_resources() -> Vec<ResourceSpec> {
  vec![TrackerKey::Statistics {
    view: "dashboard".into(),
  }
  .resource(Duration::from_secs(120))]
}

/// Lower-priority resources fetched when the user is idle.
pub fn default_idle_resources() -> Vec<ResourceSpec> {
  ["timeline", "companies", "success-rates", "top-companies"]
    .into_iter()
    .map(|view| TrackerKey::Statistics { view: view.into() }.resource(Duration::from_secs(900)))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_keys() {
    assert_eq!(TrackerKey::Position { id: "7".into() }.cache_key(), "positions:7");
    assert_eq!(
      TrackerKey::Positions { filter: None }.cache_key(),
      "positions:list:all"
    );
    assert_eq!(
      TrackerKey::Interviews {
        position_id: Some("7".into()),
        filter: None
      }
      .cache_key(),
      "interviews:list:position:7:all"
    );
    assert_eq!(
      TrackerKey::Statistics {
        view: "dashboard".into()
      }
      .cache_key(),
      "statistics:dashboard"
    );
  }

  #[test]
  fn test_filter_order_and_name_case_do_not_matter() {
    let a = TrackerKey::Positions {
      filter: Some("status=applied&company=Acme".into()),
    };
    let b = TrackerKey::Positions {
      filter: Some(" Company=Acme&STATUS=applied ".into()),
    };
    assert_eq!(a.cache_key(), b.cache_key());
    assert!(a.cache_key().starts_with("positions:list:"));
    assert_ne!(a.cache_key(), "positions:list:all");
  }

  #[test]
  fn test_filter_values_keep_their_case() {
    let upper = TrackerKey::Positions {
      filter: Some("company=Acme".into()),
    };
    let lower = TrackerKey::Positions {
      filter: Some("company=acme".into()),
    };
    assert_ne!(upper.cache_key(), lower.cache_key());
  }

  #[test]
  fn test_paths() {
    assert_eq!(
      TrackerKey::Interviews {
        position_id: Some("3".into()),
        filter: Some("page=2".into())
      }
      .path(),
      "/api/v1/positions/3/interviews?page=2"
    );
    assert_eq!(
      TrackerKey::Statistics {
        view: "timeline".into()
      }
      .path(),
      "/api/v1/statistics/timeline"
    );
  }

  #[test]
  fn test_resource_spec_defaults_type_tag() {
    let yaml = "key: statistics:dashboard\npath: /api/v1/statistics/dashboard\nttl_secs: 60\n";
    let spec: ResourceSpec = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(spec.type_tag, "json");
    assert_eq!(spec.ttl(), Duration::from_secs(60));
  }
}
