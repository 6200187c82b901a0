//! Coordinator that keeps the cache warm and the offline queue moving.
//!
//! All cache and queue mutation driven by timers or platform callbacks goes
//! through [`SyncCoordinator::run`], a single loop consuming one event channel.
//! Timers never act directly; they post [`Event::Timer`] into that channel.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::event::{Event, EventHandler, EventSender, TimerKind};
use crate::fetch::{FetchSource, Fetcher};
use crate::network::{Connectivity, HttpRequest, Transport};
use crate::queue::{DrainReport, OfflineQueue};
use crate::resources::ResourceSpec;
use crate::scheduler::{Scheduler, TaskHandle};

/// Timing and resource lists for the coordinator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub warm: Vec<ResourceSpec>,
  pub critical: Vec<ResourceSpec>,
  pub idle: Vec<ResourceSpec>,
  pub prefetch_timeout: Duration,
  pub background_interval: Duration,
  pub idle_threshold: Duration,
  pub health_check_interval: Duration,
  pub sweep_interval: Duration,
  pub drain_interval: Duration,
  pub health_path: String,
}

impl SyncSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      warm: config.sync.warm.clone(),
      critical: config.sync.critical.clone(),
      idle: config.sync.idle.clone(),
      prefetch_timeout: config.sync.warm_timeout(),
      background_interval: config.sync.background_interval(),
      idle_threshold: config.sync.idle_threshold(),
      health_check_interval: config.sync.health_check_interval(),
      sweep_interval: config.cache.sweep_interval(),
      drain_interval: Duration::from_secs(config.queue.drain_interval_secs),
      health_path: config.api.health_path.clone(),
    }
  }
}

/// Outcome of a batch of prefetches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchReport {
  /// Fetched from the network
  pub fetched: usize,
  /// Already fresh in the cache
  pub cached: usize,
  /// Failed or timed out
  pub failed: usize,
}

/// What the coordinator knows about the user session.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {
  pub last_activity_at: Instant,
  pub visible: bool,
  /// Last connectivity state the coordinator acted on
  pub online: bool,
}

pub struct SyncCoordinator {
  fetcher: Fetcher,
  queue: Arc<OfflineQueue>,
  cache: Arc<CacheStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  scheduler: Arc<dyn Scheduler>,
  events: EventSender,
  settings: SyncSettings,
  session: SessionState,
  idle_timer: Option<TaskHandle>,
  timers: Vec<TaskHandle>,
}

impl SyncCoordinator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    fetcher: Fetcher,
    queue: Arc<OfflineQueue>,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    scheduler: Arc<dyn Scheduler>,
    events: EventSender,
    settings: SyncSettings,
  ) -> Self {
    let session = SessionState {
      last_activity_at: Instant::now(),
      visible: true,
      online: connectivity.is_online(),
    };
    Self {
      fetcher,
      queue,
      cache,
      transport,
      connectivity,
      scheduler,
      events,
      settings,
      session,
      idle_timer: None,
      timers: Vec::new(),
    }
  }

  pub fn session(&self) -> SessionState {
    self.session
  }

  /// Prefetch resources concurrently, each bounded by the prefetch timeout.
  ///
  /// Failures are logged and counted, never returned.
  async fn prefetch(&self, resources: &[ResourceSpec], force: bool) -> PrefetchReport {
    let mut report = PrefetchReport::default();
    if resources.is_empty() {
      return report;
    }
    if !self.connectivity.is_online() {
      debug!(count = resources.len(), "Offline, skipping prefetch");
      report.failed = resources.len();
      return report;
    }

    let limit = self.settings.prefetch_timeout;
    let results = join_all(resources.iter().map(|resource| async move {
      let fetch = async {
        if force {
          self.fetcher.refresh(resource).await
        } else {
          self.fetcher.fetch(resource).await
        }
      };
      (resource, timeout(limit, fetch).await)
    }))
    .await;

    for (resource, result) in results {
      match result {
        Ok(Ok(fetched)) if fetched.source == FetchSource::Cache => report.cached += 1,
        Ok(Ok(_)) => report.fetched += 1,
        Ok(Err(e)) => {
          warn!(key = %resource.key, error = %e, "Prefetch failed");
          report.failed += 1;
        }
        Err(_) => {
          warn!(key = %resource.key, ?limit, "Prefetch timed out");
          report.failed += 1;
        }
      }
    }
    report
  }

  /// Startup prefetch of high-value, low-volatility resources.
  pub async fn warm_cache(&self) -> PrefetchReport {
    let report = self.prefetch(&self.settings.warm, false).await;
    info!(
      fetched = report.fetched,
      cached = report.cached,
      failed = report.failed,
      "Cache warm complete"
    );
    report
  }

  /// Revalidate the critical short-TTL resources from the network.
  pub async fn refresh_critical(&self) -> PrefetchReport {
    self.prefetch(&self.settings.critical, true).await
  }

  /// Periodic revalidation, regardless of user activity.
  pub async fn background_sync(&self) -> PrefetchReport {
    let report = self.refresh_critical().await;
    debug!(fetched = report.fetched, failed = report.failed, "Background sync");
    report
  }

  /// Network came back: replay the queue, then revalidate critical data.
  pub async fn on_reconnect(&mut self) -> DrainReport {
    self.session.online = true;
    self.connectivity.set_online(true);
    info!(depth = self.queue.depth(), "Reconnected, draining offline queue");

    let report = self.queue.drain().await;
    self.refresh_critical().await;
    report
  }

  /// The UI became visible again.
  pub async fn on_foreground(&mut self) -> DrainReport {
    self.session.visible = true;
    let report = self.queue.drain().await;
    self.refresh_critical().await;
    report
  }

  /// Record activity and restart the idle countdown.
  pub fn on_user_input(&mut self) {
    self.session.last_activity_at = Instant::now();
    let events = self.events.clone();
    let handle = self.scheduler.schedule_after(
      self.settings.idle_threshold,
      Arc::new(move || {
        events.send(Event::Timer(TimerKind::IdlePrefetch));
      }),
    );
    // Replacing the handle cancels the previous countdown.
    self.idle_timer = Some(handle);
  }

  /// Warm low-priority resources once the user has been idle long enough.
  pub async fn idle_prefetch(&self) -> PrefetchReport {
    let idle_for = self.session.last_activity_at.elapsed();
    if idle_for < self.settings.idle_threshold || !self.session.visible {
      debug!(?idle_for, "Not idle, skipping prefetch");
      return PrefetchReport::default();
    }
    self.prefetch(&self.settings.idle, false).await
  }

  /// Check the health endpoint. Any HTTP response counts as online.
  pub async fn check_health(&self) -> bool {
    let request = HttpRequest::get(self.settings.health_path.clone());
    match self.transport.call(&request).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Health check failed");
        false
      }
    }
  }

  async fn apply_connectivity(&mut self, online: bool) {
    self.connectivity.set_online(online);
    if online == self.session.online {
      return;
    }
    if online {
      self.on_reconnect().await;
    } else {
      self.session.online = false;
      warn!(depth = self.queue.depth(), "Offline, mutations will be queued");
    }
  }

  /// Drop expired cache entries.
  pub fn sweep(&self) -> usize {
    let removed = self.cache.sweep_expired();
    if removed > 0 {
      info!(removed, "Swept expired cache entries");
    }
    removed
  }

  /// Post timer events for the periodic jobs.
  pub fn start_timers(&mut self) {
    let periodic = [
      (self.settings.background_interval, TimerKind::BackgroundSync),
      (self.settings.sweep_interval, TimerKind::Sweep),
      (self.settings.drain_interval, TimerKind::DrainSafetyNet),
      (self.settings.health_check_interval, TimerKind::HealthCheck),
    ];
    for (period, kind) in periodic {
      let events = self.events.clone();
      let handle = self.scheduler.schedule_every(
        period,
        Arc::new(move || {
          events.send(Event::Timer(kind));
        }),
      );
      self.timers.push(handle);
    }
  }

  pub fn stop_timers(&mut self) {
    self.idle_timer = None;
    self.timers.clear();
  }

  /// Handle one event. Returns false when the loop should stop.
  pub async fn handle(&mut self, event: Event) -> bool {
    match event {
      Event::ConnectivityChanged(online) => self.apply_connectivity(online).await,
      Event::VisibilityChanged(true) => {
        self.on_foreground().await;
      }
      Event::VisibilityChanged(false) => self.session.visible = false,
      Event::UserInput => self.on_user_input(),
      Event::Timer(TimerKind::BackgroundSync) => {
        self.background_sync().await;
      }
      Event::Timer(TimerKind::Sweep) => {
        self.sweep();
      }
      Event::Timer(TimerKind::DrainSafetyNet) => {
        if self.queue.depth() > 0 {
          self.queue.drain().await;
        }
      }
      Event::Timer(TimerKind::HealthCheck) => {
        let online = self.check_health().await;
        self.apply_connectivity(online).await;
      }
      Event::Timer(TimerKind::IdlePrefetch) => {
        self.idle_prefetch().await;
      }
      Event::Shutdown => return false,
    }
    true
  }

  /// Sweep, warm and replay anything left from the last session.
  pub async fn startup(&mut self) {
    self.sweep();
    self.warm_cache().await;
    if self.queue.depth() > 0 {
      self.queue.drain().await;
    }
  }

  /// Run the coordinator loop until shutdown.
  pub async fn run(mut self, mut events: EventHandler) -> Result<()> {
    self
      .events
      .forward_connectivity(self.connectivity.subscribe());
    self.start_timers();
    self.startup().await;
    self.on_user_input();

    while let Some(event) = events.next().await {
      if !self.handle(event).await {
        break;
      }
    }

    self.stop_timers();
    info!(depth = self.queue.depth(), "Sync coordinator stopped");
    Ok(())
  }
}
