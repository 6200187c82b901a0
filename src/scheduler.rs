//! Timer scheduling behind a trait, so timer-driven behaviour can be driven by
//! tokio's paused clock (or a hand-rolled scheduler) in tests.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// A repeatable task body.
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// Cancels its task when cancelled or dropped.
pub struct TaskHandle {
  handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
  pub fn from_join(handle: JoinHandle<()>) -> Self {
    Self {
      handle: Some(handle),
    }
  }

  pub fn cancel(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }

  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().map_or(true, |h| h.is_finished())
  }
}

impl Drop for TaskHandle {
  fn drop(&mut self) {
    self.cancel();
  }
}

/// Source of periodic and one-shot timers.
pub trait Scheduler: Send + Sync {
  /// Run `task` every `period`, first after one full period.
  fn schedule_every(&self, period: Duration, task: Task) -> TaskHandle;

  /// Run `task` once after `delay`.
  fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle;
}

/// Scheduler on the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
  fn schedule_every(&self, period: Duration, task: Task) -> TaskHandle {
    let period = period.max(Duration::from_millis(1));
    TaskHandle::from_join(tokio::spawn(async move {
      let mut ticker = time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        task();
      }
    }))
  }

  fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle {
    TaskHandle::from_join(tokio::spawn(async move {
      time::sleep(delay).await;
      task();
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counter() -> (Arc<AtomicU32>, Task) {
    let count = Arc::new(AtomicU32::new(0));
    let c = count.clone();
    (count, Arc::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
    }))
  }

  async fn settle() {
    for _ in 0..5 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedule_every_ticks_per_period() {
    let (count, task) = counter();
    let _handle = TokioScheduler.schedule_every(Duration::from_secs(30), task);

    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    time::sleep(Duration::from_secs(95)).await;
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_timer_never_fires() {
    let (count, task) = counter();
    let mut handle = TokioScheduler.schedule_after(Duration::from_secs(30), task);

    time::sleep(Duration::from_secs(10)).await;
    handle.cancel();
    time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(handle.is_finished());
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedule_after_fires_once() {
    let (count, task) = counter();
    let _handle = TokioScheduler.schedule_after(Duration::from_secs(30), task);

    time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}
