//! Cache and sync metrics with a derived health score.
//!
//! Counters and latency windows are process-wide and never persisted. Snapshots
//! are computed on demand; nothing here feeds back into cache or queue behaviour.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::CacheSize;

/// Operation categories with their own latency windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyCategory {
  /// Local cache lookups
  CacheRead,
  /// Direct network calls (reads, writes, prefetches)
  Network,
  /// Offline queue replays
  Replay,
}

impl LatencyCategory {
  /// Categories that involve the remote API.
  fn is_remote(self) -> bool {
    matches!(self, Self::Network | Self::Replay)
  }
}

/// Point-in-time view of the collected metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
  pub hits: u64,
  pub misses: u64,
  pub queue_depth: usize,
  pub average_latency_ms: f64,
  pub error_rate: f64,
  pub hit_rate: f64,
  pub stale_ratio: f64,
  pub health_score: u8,
}

/// Snapshot plus raw samples, for offline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
  pub exported_at: chrono::DateTime<chrono::Utc>,
  pub snapshot: MetricsSnapshot,
  pub errors: u64,
  pub total_operations: u64,
  pub stale_reads: u64,
  pub cache_size: CacheSize,
  pub samples: BTreeMap<LatencyCategory, Vec<f64>>,
}

#[derive(Debug, Default)]
struct Counters {
  hits: u64,
  misses: u64,
  stale_reads: u64,
  errors: u64,
  total_operations: u64,
  samples: BTreeMap<LatencyCategory, VecDeque<f64>>,
}

/// Running counters and bounded latency windows.
#[derive(Debug)]
pub struct MetricsCollector {
  counters: Mutex<Counters>,
  window_size: usize,
}

impl MetricsCollector {
  pub fn new(window_size: usize) -> Self {
    Self {
      counters: Mutex::new(Counters::default()),
      window_size: window_size.max(1),
    }
  }

  fn with_counters<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
    match self.counters.lock() {
      Ok(mut counters) => f(&mut counters),
      Err(poisoned) => f(&mut poisoned.into_inner()),
    }
  }

  fn push_sample(
    counters: &mut Counters,
    window: usize,
    category: LatencyCategory,
    elapsed: Duration,
  ) {
    let samples = counters.samples.entry(category).or_default();
    if samples.len() == window {
      samples.pop_front();
    }
    samples.push_back(elapsed.as_secs_f64() * 1000.0);
  }

  /// Record a cache lookup. `stale` marks a miss caused by an expired or
  /// version-mismatched entry rather than an absent one.
  pub fn record_cache_read(&self, hit: bool, stale: bool, elapsed: Duration) {
    let window = self.window_size;
    self.with_counters(|c| {
      if hit {
        c.hits += 1;
      } else {
        c.misses += 1;
        if stale {
          c.stale_reads += 1;
        }
      }
      Self::push_sample(c, window, LatencyCategory::CacheRead, elapsed);
    });
  }

  /// Record a remote operation and whether it failed.
  pub fn record_operation(&self, category: LatencyCategory, elapsed: Duration, failed: bool) {
    let window = self.window_size;
    self.with_counters(|c| {
      c.total_operations += 1;
      if failed {
        c.errors += 1;
      }
      Self::push_sample(c, window, category, elapsed);
    });
  }

  /// Clear every counter and sample.
  pub fn reset(&self) {
    self.with_counters(|c| *c = Counters::default());
  }

  pub fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
    self.with_counters(|c| Self::snapshot_of(c, queue_depth))
  }

  fn snapshot_of(c: &Counters, queue_depth: usize) -> MetricsSnapshot {
    let reads = c.hits + c.misses;
    let hit_rate = if reads == 0 {
      1.0
    } else {
      c.hits as f64 / reads as f64
    };
    let stale_ratio = if reads == 0 {
      0.0
    } else {
      c.stale_reads as f64 / reads as f64
    };
    let error_rate = if c.total_operations == 0 {
      0.0
    } else {
      c.errors as f64 / c.total_operations as f64
    };

    let (sum, count) = c
      .samples
      .iter()
      .filter(|(category, _)| category.is_remote())
      .flat_map(|(_, samples)| samples.iter())
      .fold((0.0, 0usize), |(sum, n), ms| (sum + ms, n + 1));
    let average_latency_ms = if count == 0 { 0.0 } else { sum / count as f64 };

    MetricsSnapshot {
      hits: c.hits,
      misses: c.misses,
      queue_depth,
      average_latency_ms,
      error_rate,
      hit_rate,
      stale_ratio,
      health_score: health_score(hit_rate, error_rate, average_latency_ms, stale_ratio),
    }
  }

  /// Snapshot plus raw samples. Never mutates collected state.
  pub fn export(&self, queue_depth: usize, cache_size: CacheSize) -> MetricsExport {
    self.with_counters(|c| MetricsExport {
      exported_at: chrono::Utc::now(),
      snapshot: Self::snapshot_of(c, queue_depth),
      errors: c.errors,
      total_operations: c.total_operations,
      stale_reads: c.stale_reads,
      cache_size,
      samples: c
        .samples
        .iter()
        .map(|(category, samples)| (*category, samples.iter().copied().collect()))
        .collect(),
    })
  }
}

impl Default for MetricsCollector {
  fn default() -> Self {
    Self::new(100)
  }
}

/// Combine the four risk signals into a 0..=100 score.
///
/// Weights are fixed so the score is comparable across builds:
/// hit rate below 0.8 costs 50 per unit, error rate above 0.1 costs 100 per unit,
/// latency above 1s costs 1 per 100ms (at most 30), stale ratio above 0.3 costs 50 per unit.
pub fn health_score(
  hit_rate: f64,
  error_rate: f64,
  average_latency_ms: f64,
  stale_ratio: f64,
) -> u8 {
  let hit_penalty = (0.8 - hit_rate).max(0.0) * 50.0;
  let error_penalty = (error_rate - 0.1).max(0.0) * 100.0;
  let latency_penalty = ((average_latency_ms - 1000.0).max(0.0) / 100.0).min(30.0);
  let stale_penalty = (stale_ratio - 0.3).max(0.0) * 50.0;

  let score = 100.0 - hit_penalty - error_penalty - latency_penalty - stale_penalty;
  score.round().clamp(0.0, 100.0) as u8
}
