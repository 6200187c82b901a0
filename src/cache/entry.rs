//! Cache entry and payload types.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::SyncError;

/// Opaque cached payload plus a type tag naming what it decodes to.
///
/// The cache never looks inside `bytes`; callers pick the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedValue {
  pub type_tag: String,
  #[serde(with = "crate::cache::hex_bytes")]
  pub bytes: Vec<u8>,
}

impl CachedValue {
  pub fn new(type_tag: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      type_tag: type_tag.into(),
      bytes: bytes.into(),
    }
  }

  /// Encode `value` as JSON.
  pub fn json<T: Serialize>(type_tag: impl Into<String>, value: &T) -> Result<Self, SyncError> {
    Ok(Self::new(type_tag, serde_json::to_vec(value)?))
  }

  /// Decode a JSON payload.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
    Ok(serde_json::from_slice(&self.bytes)?)
  }
}

/// A single stored cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: CachedValue,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub schema_version: String,
}

impl CacheEntry {
  /// Whether this entry may be served at `now` by a build running `schema_version`.
  pub fn is_readable(&self, now: DateTime<Utc>, schema_version: &str) -> bool {
    self.schema_version == schema_version && now < self.expires_at
  }
}

/// Approximate storage footprint of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSize {
  pub total_bytes: usize,
  pub item_count: usize,
}

/// Serde adapter storing byte payloads as hex strings.
pub(crate) mod hex_bytes {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    hex::decode(s).map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_readable_requires_version_and_time() {
    let now = Utc::now();
    let entry = CacheEntry {
      key: "positions:1".into(),
      value: CachedValue::new("position", b"{}".to_vec()),
      stored_at: now,
      expires_at: now + Duration::seconds(10),
      schema_version: "1.0.0".into(),
    };

    assert!(entry.is_readable(now, "1.0.0"));
    assert!(!entry.is_readable(now, "1.1.0"));
    assert!(!entry.is_readable(now + Duration::seconds(10), "1.0.0"));
  }

  #[test]
  fn test_payload_is_hex_in_json() {
    let value = CachedValue::new("raw", vec![0xde, 0xad]);
    let json = serde_json::to_string(&value).unwrap();
    assert_eq!(json, r#"{"type_tag":"raw","bytes":"dead"}"#);
    let back: CachedValue = serde_json::from_str(&json).unwrap();
    assert_eq!(back, value);
  }
}
