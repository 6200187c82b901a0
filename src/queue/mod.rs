//! Offline mutation queue.
//!
//! Mutations that could not reach the server are appended here and replayed in
//! order once connectivity returns. Each item moves through
//! `Pending -> InFlight -> {Succeeded, Retrying, PermanentlyFailed}`; succeeded and
//! permanently failed items leave the queue, retrying ones stay at the head.

mod item;
mod offline;

pub use item::{
  CacheSnapshot, FailureNotice, ItemState, NewMutation, OptimisticWrite, QueueEvent, QueueItem,
};
pub use offline::{DrainReport, DrainSkip, OfflineQueue, QueueDeps, FAILURES_KEY, QUEUE_KEY};
