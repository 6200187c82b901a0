//! Offline-first sync engine for the interview tracker client.
//!
//! Reads are served from a TTL cache with schema versioning. Writes that cannot
//! reach the server wait in a durable FIFO queue and replay when the network
//! returns. A declarative rule table invalidates cache keys after successful
//! writes, and a metrics collector condenses cache and network behaviour into a
//! single health score.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod invalidation;
pub mod metrics;
pub mod network;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use client::{MutationOutcome, SyncClient};
pub use config::Config;
pub use error::{StorageError, SyncError, TransportError};
pub use sync::{SyncCoordinator, SyncSettings};
