use tokio::sync::watch;

/// Handle on a cache entry's change notifications.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
  rx: watch::Receiver<u64>,
}

impl Subscription {
  pub(crate) fn new(rx: watch::Receiver<u64>) -> Self {
    Self { rx }
  }

  /// Wait for the next change. Returns `false` once the entry is gone.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }

  /// Whether a change arrived since the last `changed()`.
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  /// Whether the entry behind this subscription has left the cache.
  pub fn is_closed(&self) -> bool {
    self.rx.has_changed().is_err()
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("version", &*self.rx.borrow())
      .finish()
  }
}
