//! Per-key mutual exclusion across processes.
//!
//! [`KeyedSerializer`] admits at most one evaluation at a time per
//! (entity, key), store-wide: a local per-key async gate serializes tasks
//! inside the process, and a store lock (`set-nx-px` with a random token,
//! deleted on release) excludes every other process sharing the store.
//!
//! Local admission state is created on demand and disposed as soon as no
//! task is waiting on the key, so idle keys cost nothing.
//!
//! The lock ttl bounds how long a crashed holder can block a key. Release
//! is best effort: a task error still releases, and an expired lock simply
//! lets the next contender in. Evaluations must stay idempotent on their
//! own; the serializer narrows races, it does not make them impossible.

use crate::error::CoordinationError;
use crate::keys::{self, EntityKind};
use crate::message::random_token;
use crate::store::Store;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Tuning for the store lock.
#[derive(Debug, Clone)]
pub struct SerializerOptions {
  /// Ttl on the store lock; bounds the damage of a crashed holder.
  pub lock_ttl: Duration,
  /// Pause between acquisition attempts while another holder has the key.
  pub retry_delay: Duration,
}

impl Default for SerializerOptions {
  fn default() -> Self {
    Self {
      lock_ttl: Duration::from_secs(30),
      retry_delay: Duration::from_millis(25),
    }
  }
}

impl SerializerOptions {
  /// Sets the lock ttl.
  #[must_use]
  pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
    self.lock_ttl = lock_ttl;
    self
  }

  /// Sets the retry delay.
  #[must_use]
  pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = retry_delay;
    self
  }
}

struct KeySlot {
  gate: tokio::sync::Mutex<()>,
  /// Tasks inside or waiting on this key. Only touched under the slot map
  /// mutex, so enter/leave stay consistent with map membership.
  waiters: AtomicUsize,
}

/// Store-backed, per-key concurrency cap of one.
pub struct KeyedSerializer {
  store: Arc<dyn Store>,
  kind: EntityKind,
  name: String,
  opts: SerializerOptions,
  slots: Mutex<HashMap<String, Arc<KeySlot>>>,
}

impl KeyedSerializer {
  /// Creates a serializer scoped to one entity.
  #[must_use]
  pub fn new(
    store: Arc<dyn Store>,
    kind: EntityKind,
    name: impl Into<String>,
    opts: SerializerOptions,
  ) -> Self {
    Self {
      store,
      kind,
      name: name.into(),
      opts,
      slots: Mutex::new(HashMap::new()),
    }
  }

  /// Runs `task` while holding the (entity, key) lock.
  ///
  /// Blocks until both the local gate and the store lock are held; the
  /// store lock is released afterwards whether or not the task succeeded.
  pub async fn run_exclusive<T, F, Fut>(&self, key: &str, task: F) -> Result<T, CoordinationError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CoordinationError>>,
  {
    let slot = self.enter(key);
    let result = self.run_gated(&slot, key, task).await;
    self.leave(key, &slot);
    result
  }

  async fn run_gated<T, F, Fut>(
    &self,
    slot: &KeySlot,
    key: &str,
    task: F,
  ) -> Result<T, CoordinationError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CoordinationError>>,
  {
    let _local = slot.gate.lock().await;

    let lock_key = keys::lock(self.kind, &self.name, key);
    let token = random_token();
    loop {
      match self.store.set_nx_px(&lock_key, &token, self.opts.lock_ttl).await {
        Ok(true) => break,
        Ok(false) => tokio::time::sleep(self.opts.retry_delay).await,
        Err(e) => return Err(e.into()),
      }
    }

    let result = task().await;

    if let Err(e) = self.store.delete(&lock_key).await {
      // The ttl will reap it; the next holder just waits a little longer.
      warn!(entity = %self.name, %key, error = %e, "failed to release key lock");
    }
    result
  }

  /// Registers interest in a key, creating its slot if needed.
  fn enter(&self, key: &str) -> Arc<KeySlot> {
    let mut slots = self.slots.lock().expect("serializer mutex poisoned");
    let slot = slots
      .entry(key.to_string())
      .or_insert_with(|| {
        Arc::new(KeySlot {
          gate: tokio::sync::Mutex::new(()),
          waiters: AtomicUsize::new(0),
        })
      })
      .clone();
    slot.waiters.fetch_add(1, Ordering::SeqCst);
    slot
  }

  /// Drops interest in a key, disposing its slot once nobody is left.
  fn leave(&self, key: &str, slot: &Arc<KeySlot>) {
    let mut slots = self.slots.lock().expect("serializer mutex poisoned");
    if slot.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
      slots.remove(key);
    }
  }

  /// Number of keys with live scheduling state, for tests.
  #[cfg(test)]
  pub(crate) fn active_keys(&self) -> usize {
    self.slots.lock().expect("serializer mutex poisoned").len()
  }
}
