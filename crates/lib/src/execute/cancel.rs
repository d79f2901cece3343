use std::sync::Arc;

use tokio::sync::watch;

/// Shared cancellation flag for a build.
///
/// Checked before each transformer is dispatched and before each command
/// starts. Running processes are killed; running script commands finish.
#[derive(Debug, Clone)]
pub struct Canceler {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for Canceler {
  fn default() -> Self {
    Self::new()
  }
}

impl Canceler {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_canceled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once [`Canceler::cancel`] has been called.
  pub async fn canceled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as self, so this only returns once the flag is set.
    let _ = rx.wait_for(|canceled| *canceled).await;
  }
}
