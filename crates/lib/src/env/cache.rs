use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tracing::debug;

use super::{EnvironmentError, EnvironmentKind, setup_environment};
use crate::graph::ProductContext;
use crate::script::{Environment, ScriptEngine};

type Key = (String, EnvironmentKind);
type Slot = Arc<OnceCell<Arc<Environment>>>;

/// Computed environments per product and kind, kept until invalidated.
#[derive(Debug, Default)]
pub struct EnvironmentCache {
  entries: Mutex<HashMap<Key, Slot>>,
}

impl EnvironmentCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// A handle that yields the environment of `product`, computing it at most once.
  pub fn pending(&self, product: &Arc<ProductContext>, kind: EnvironmentKind) -> PendingEnvironment {
    let slot = self
      .lock()
      .entry((product.name.clone(), kind))
      .or_default()
      .clone();
    PendingEnvironment {
      slot,
      product: product.clone(),
      kind,
    }
  }

  /// Drops both environments of `product`.
  pub fn invalidate(&self, product: &str) {
    self.lock().retain(|(name, _), _| name != product);
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<Key, Slot>> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// An environment that may still need its setup scripts run.
#[derive(Debug, Clone)]
pub struct PendingEnvironment {
  slot: Slot,
  product: Arc<ProductContext>,
  kind: EnvironmentKind,
}

impl PendingEnvironment {
  /// Returns the cached environment or runs the setup scripts on the blocking pool.
  ///
  /// Concurrent callers for the same product and kind wait for one computation.
  /// A failed computation is not cached.
  pub async fn get(
    &self,
    engine: Arc<dyn ScriptEngine>,
    base: Arc<Environment>,
  ) -> Result<Arc<Environment>, EnvironmentError> {
    let env = self
      .slot
      .get_or_try_init(move || async move {
        let (product, kind) = (self.product.clone(), self.kind);
        let env = tokio::task::spawn_blocking(move || setup_environment(engine.as_ref(), &product, kind, &base))
          .await
          .map_err(|e| EnvironmentError::Task(e.to_string()))??;
        debug!(product = %self.product.name, kind = %self.kind, variables = env.len(), "environment computed");
        Ok::<_, EnvironmentError>(Arc::new(env))
      })
      .await?;
    Ok(env.clone())
  }
}
