use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Timers the coordinator schedules on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
  /// Revalidate short-TTL resources
  BackgroundSync,
  /// Expired-entry sweep
  Sweep,
  /// Periodic drain in case a connectivity event was missed
  DrainSafetyNet,
  /// Health check against the API
  HealthCheck,
  /// The user has been idle long enough to prefetch
  IdlePrefetch,
}

/// Engine events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Network came back (`true`) or went away (`false`)
  ConnectivityChanged(bool),
  /// The UI became visible (`true`) or hidden (`false`)
  VisibilityChanged(bool),
  /// Any user input; restarts the idle timer
  UserInput,
  /// A scheduled timer fired
  Timer(TimerKind),
  /// Stop the coordinator loop
  Shutdown,
}

/// Cloneable handle for feeding events into the coordinator
#[derive(Debug, Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
  /// Send an event. Returns false once the coordinator has stopped.
  pub fn send(&self, event: Event) -> bool {
    self.tx.send(event).is_ok()
  }

  pub fn connectivity_changed(&self, online: bool) -> bool {
    self.send(Event::ConnectivityChanged(online))
  }

  pub fn visibility_changed(&self, visible: bool) -> bool {
    self.send(Event::VisibilityChanged(visible))
  }

  pub fn user_input(&self) -> bool {
    self.send(Event::UserInput)
  }

  pub fn shutdown(&self) -> bool {
    self.send(Event::Shutdown)
  }

  /// Forward every transition of a connectivity flag as an event.
  pub fn forward_connectivity(&self, mut rx: watch::Receiver<bool>) {
    let sender = self.clone();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !sender.connectivity_changed(online) {
          break;
        }
      }
    });
  }
}

/// Event queue consumed by the single coordinator loop
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Receive the next event if one arrives within `timeout`
  pub async fn next_within(&mut self, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::Connectivity;

  #[tokio::test]
  async fn test_sender_feeds_handler() {
    let mut events = EventHandler::new();
    let sender = events.sender();

    assert!(sender.user_input());
    assert!(sender.visibility_changed(true));
    assert_eq!(events.next().await, Some(Event::UserInput));
    assert_eq!(events.next().await, Some(Event::VisibilityChanged(true)));
  }

  #[tokio::test]
  async fn test_connectivity_is_forwarded() {
    let mut events = EventHandler::new();
    let connectivity = Connectivity::new(true);
    events.sender().forward_connectivity(connectivity.subscribe());

    connectivity.set_online(false);
    assert_eq!(
      events.next_within(Duration::from_secs(1)).await,
      Some(Event::ConnectivityChanged(false))
    );
  }

  #[tokio::test]
  async fn test_send_after_handler_dropped() {
    let events = EventHandler::new();
    let sender = events.sender();
    drop(events);
    assert!(!sender.shutdown());
  }
}
