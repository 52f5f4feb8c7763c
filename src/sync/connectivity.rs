//! Online/offline signal supplied by the hosting environment.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared connectivity flag. The engine never checks reachability itself; the
/// host calls [`Connectivity::set_online`] on every transition it observes.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Publish a transition. Returns whether the state changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Receiver notified on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}
