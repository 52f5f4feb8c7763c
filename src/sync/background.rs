//! Best-effort background delivery hook.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Asks the hosting environment to attempt delivery later, even when the
/// application is no longer in the foreground. Tags are per resource type.
pub trait BackgroundSync: Send + Sync {
  fn register(&self, tag: &str) -> BoxFuture<'_, Result<()>>;
}

/// Used when the host offers no background delivery; draining stays
/// foreground-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackgroundSync;

impl BackgroundSync for NoopBackgroundSync {
  fn register(&self, _tag: &str) -> BoxFuture<'_, Result<()>> {
    Box::pin(async { Ok(()) })
  }
}

/// Delivers registered tags to the hosting loop over a channel.
#[derive(Debug, Clone)]
pub struct ChannelBackgroundSync {
  tx: mpsc::UnboundedSender<String>,
}

impl ChannelBackgroundSync {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl BackgroundSync for ChannelBackgroundSync {
  fn register(&self, tag: &str) -> BoxFuture<'_, Result<()>> {
    let sent = self
      .tx
      .send(tag.to_string())
      .map_err(|e| eyre!("Background sync receiver is gone: {}", e));
    Box::pin(async move { sent })
  }
}
