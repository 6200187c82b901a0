//! Versioned, TTL-aware cache for offline reads.
//!
//! This module provides the local side of the sync engine:
//! - Entries carry an expiry and the schema version of the build that wrote them
//! - Expired or foreign-version entries are misses and get purged when touched
//! - Payloads are opaque bytes with a type tag; the cache never decodes them
//! - Writes are best-effort: a full backend triggers one sweep-and-retry, then gives up

mod entry;
mod store;

pub(crate) use entry::hex_bytes;
pub use entry::{CacheEntry, CacheSize, CachedValue};
pub use store::{CacheStore, CACHE_PREFIX};
