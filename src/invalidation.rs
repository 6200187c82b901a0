//! Declarative cache invalidation.
//!
//! A static rule table maps `(resource_type, operation)` to the cache key
//! patterns that must be dropped. Patterns may embed `{resourceId}` and may end
//! with `*` to match every currently cached key with that prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::cache::CacheStore;
use crate::resources::{INTERVIEW, POSITION};

/// Placeholder substituted with the mutated resource's id.
pub const RESOURCE_ID_PLACEHOLDER: &str = "{resourceId}";

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  /// HTTP method conventionally used for this operation.
  pub fn method(self) -> &'static str {
    match self {
      Self::Create => "POST",
      Self::Update => "PUT",
      Self::Delete => "DELETE",
    }
  }
}

/// One row of the invalidation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
  pub resource_type: String,
  pub on_operation: Operation,
  pub affected_key_patterns: Vec<String>,
}

impl InvalidationRule {
  pub fn new(resource_type: &str, on_operation: Operation, patterns: &[&str]) -> Self {
    Self {
      resource_type: resource_type.to_string(),
      on_operation,
      affected_key_patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
  }
}

/// A pattern after `{resourceId}` substitution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPattern {
  Exact(String),
  Prefix(String),
}

/// Check that a wildcard appears only as the trailing character.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
  match pattern.find('*') {
    Some(pos) if pos + 1 != pattern.len() => Err(format!(
      "pattern '{}': '*' is only allowed at the end",
      pattern
    )),
    _ => Ok(()),
  }
}

fn expand(pattern: &str, resource_id: Option<&str>) -> Option<KeyPattern> {
  let concrete = if pattern.contains(RESOURCE_ID_PLACEHOLDER) {
    pattern.replace(RESOURCE_ID_PLACEHOLDER, resource_id?)
  } else {
    pattern.to_string()
  };

  Some(match concrete.strip_suffix('*') {
    Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
    None => KeyPattern::Exact(concrete),
  })
}

/// Default rule table for the tracker's resources.
///
/// Statistics are derived from positions and interviews, so any mutation drops them.
pub fn default_rules() -> Vec<InvalidationRule> {
  use Operation::*;
  vec![
    InvalidationRule::new(POSITION, Create, &["positions:list:*", "statistics:*"]),
    InvalidationRule::new(
      POSITION,
      Update,
      &["positions:{resourceId}", "positions:list:*", "statistics:*"],
    ),
    InvalidationRule::new(
      POSITION,
      Delete,
      &[
        "positions:{resourceId}",
        "positions:list:*",
        "interviews:list:*",
        "statistics:*",
      ],
    ),
    InvalidationRule::new(INTERVIEW, Create, &["interviews:list:*", "statistics:*"]),
    InvalidationRule::new(
      INTERVIEW,
      Update,
      &["interviews:{resourceId}", "interviews:list:*", "statistics:*"],
    ),
    InvalidationRule::new(
      INTERVIEW,
      Delete,
      &["interviews:{resourceId}", "interviews:list:*", "statistics:*"],
    ),
  ]
}

/// Maps a mutated resource to the cache keys it makes stale.
pub struct InvalidationGraph {
  rules: Vec<InvalidationRule>,
  cache: Arc<CacheStore>,
}

impl InvalidationGraph {
  pub fn new(rules: Vec<InvalidationRule>, cache: Arc<CacheStore>) -> Self {
    Self { rules, cache }
  }

  fn patterns(
    &self,
    resource_type: &str,
    operation: Operation,
    resource_id: Option<&str>,
  ) -> BTreeSet<KeyPattern> {
    self
      .rules
      .iter()
      .filter(|r| r.resource_type == resource_type && r.on_operation == operation)
      .flat_map(|r| r.affected_key_patterns.iter())
      .filter_map(|p| {
        let expanded = expand(p, resource_id);
        if expanded.is_none() {
          debug!(pattern = %p, "Skipping id pattern: no resource id given");
        }
        expanded
      })
      .collect()
  }

  /// Concrete cache keys that `invalidate` would remove right now.
  pub fn affected_keys(
    &self,
    resource_type: &str,
    operation: Operation,
    resource_id: Option<&str>,
  ) -> BTreeSet<String> {
    self
      .patterns(resource_type, operation, resource_id)
      .into_iter()
      .flat_map(|pattern| match pattern {
        KeyPattern::Exact(key) => vec![key],
        KeyPattern::Prefix(prefix) => self.cache.keys_with_prefix(&prefix),
      })
      .collect()
  }

  /// Remove every cache key affected by this mutation. Idempotent; returns the
  /// keys that actually existed.
  pub fn invalidate(
    &self,
    resource_type: &str,
    operation: Operation,
    resource_id: Option<&str>,
  ) -> Vec<String> {
    let removed: Vec<String> = self
      .affected_keys(resource_type, operation, resource_id)
      .into_iter()
      .filter(|key| self.cache.remove(key))
      .collect();

    debug!(
      resource_type,
      ?operation,
      resource_id,
      removed = removed.len(),
      "Invalidated cache keys"
    );
    removed
  }
}
