//! Single-source many-events aggregation.
//!
//! An [`Accumulation`] watches one source queue, groups arriving items by a
//! caller-derived key, and emits exactly one aggregated result per key:
//! as soon as a caller-supplied completion predicate holds, or when the
//! timeout scheduled on the key's first item fires, whichever comes first.
//!
//! Per key, the lifecycle is `OPEN` (collecting) → `CLOSED` (guard set):
//!
//! - arrival appends the item to the key's partial list and refreshes its
//!   ttl; the very first append also schedules the one-and-only timeout
//!   task for the key
//! - every evaluation runs inside the [`KeyedSerializer`] and begins with a
//!   guard check, so a closed key is a no-op no matter how many deliveries
//!   or timeout firings still race in
//! - without an `is_complete` predicate, only the timeout ever closes a key
//!
//! Items whose derived key is absent or empty are logged and dropped
//! before any storage or scheduling happens.
//!
//! The timeout is a soft, at-least lower bound: its evaluation can queue
//! behind a slow evaluation in the serializer, completing later than
//! `timeout` after the first item. See the crate root for the default.

use crate::error::{CoordinationError, StoreError};
use crate::keys::{self, EntityKind};
use crate::message::JobOptions;
use crate::queue::{JobHandler, JobQueue, QueueFactory, WorkerHandle};
use crate::serializer::{KeyedSerializer, SerializerOptions};
use crate::store::Store;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Derives the correlation key from an item's payload.
///
/// Returning `None` (or an empty string) drops the item.
pub type GroupKeyFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Decides whether an accumulated list is complete.
pub type IsCompleteFn = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Aggregates an accumulated list into the published result.
pub type OnCompleteFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// The queue an accumulation consumes and how it keys its items.
#[derive(Clone)]
pub struct AccumulationSource {
  /// Source queue name.
  pub queue: String,
  /// Key derivation over item payloads.
  pub group_key: GroupKeyFn,
}

impl AccumulationSource {
  /// Creates a source.
  #[must_use]
  pub fn new(queue: impl Into<String>, group_key: GroupKeyFn) -> Self {
    Self {
      queue: queue.into(),
      group_key,
    }
  }
}

/// Configuration for an [`Accumulation`], assembled before construction.
#[derive(Clone)]
pub struct AccumulationConfig {
  /// Namespace for this accumulation's keys, guards, and timeout queue.
  pub name: String,
  /// Fallback closure delay, counted from a key's first item. Guard and
  /// partial-state ttls are derived as twice this.
  pub timeout: Duration,
  /// Optional early-completion predicate. Without it, only the timeout
  /// closes a key.
  pub is_complete: Option<IsCompleteFn>,
  /// Aggregation producing the published result.
  pub on_complete: OnCompleteFn,
  /// Where items come from.
  pub source: AccumulationSource,
  /// Queue results are published to; without one, results are dropped
  /// after the guard is set.
  pub target: Option<String>,
}

impl AccumulationConfig {
  /// Configuration with the crate default timeout and no predicate.
  #[must_use]
  pub fn new(
    name: impl Into<String>,
    source: AccumulationSource,
    on_complete: OnCompleteFn,
  ) -> Self {
    Self {
      name: name.into(),
      timeout: crate::DEFAULT_TIMEOUT,
      is_complete: None,
      on_complete,
      source,
      target: None,
    }
  }

  /// Sets the timeout.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets the completion predicate.
  #[must_use]
  pub fn with_is_complete(mut self, is_complete: IsCompleteFn) -> Self {
    self.is_complete = Some(is_complete);
    self
  }

  /// Sets the target queue.
  #[must_use]
  pub fn with_target(mut self, target: impl Into<String>) -> Self {
    self.target = Some(target.into());
    self
  }
}

/// Aggregates correlated items from one queue into one result per key.
pub struct Accumulation {
  queues: Arc<dyn QueueFactory>,
  engine: Arc<Engine>,
  workers: Vec<WorkerHandle>,
}

impl Accumulation {
  /// Creates an accumulation from its immutable configuration.
  #[must_use]
  pub fn new(
    store: Arc<dyn Store>,
    queues: Arc<dyn QueueFactory>,
    config: AccumulationConfig,
  ) -> Self {
    let serializer = KeyedSerializer::new(
      store.clone(),
      EntityKind::Accumulation,
      config.name.clone(),
      SerializerOptions::default(),
    );
    let timeout_queue = queues.queue(&keys::timeout_queue(EntityKind::Accumulation, &config.name));
    let target = config.target.as_deref().map(|name| queues.queue(name));
    Self {
      queues,
      engine: Arc::new(Engine {
        store,
        config,
        serializer,
        timeout_queue,
        target,
      }),
      workers: Vec::new(),
    }
  }

  /// Starts the source worker and the timeout worker.
  ///
  /// Calling `run` on an engine that is already running is a no-op.
  pub async fn run(&mut self) -> Result<(), CoordinationError> {
    if !self.workers.is_empty() {
      debug!(accumulation = %self.engine.config.name, "already running, ignoring");
      return Ok(());
    }
    let source = self.queues.queue(&self.engine.config.source.queue);
    self.workers.push(source.process(source_handler(self.engine.clone())).await?);
    self
      .workers
      .push(self.engine.timeout_queue.process(timeout_handler(self.engine.clone())).await?);
    Ok(())
  }

  /// Stops both workers and waits for in-flight items.
  pub async fn close(&mut self) {
    for worker in self.workers.drain(..) {
      worker.close().await;
    }
  }
}

fn source_handler(engine: Arc<Engine>) -> JobHandler {
  Arc::new(move |job| {
    let engine = engine.clone();
    Box::pin(async move {
      engine.on_item(job.payload).await?;
      Ok(())
    })
  })
}

fn timeout_handler(engine: Arc<Engine>) -> JobHandler {
  Arc::new(move |job| {
    let engine = engine.clone();
    Box::pin(async move {
      engine.on_timeout(&job.payload).await?;
      Ok(())
    })
  })
}

struct Engine {
  store: Arc<dyn Store>,
  config: AccumulationConfig,
  serializer: KeyedSerializer,
  timeout_queue: Arc<dyn JobQueue>,
  target: Option<Arc<dyn JobQueue>>,
}

impl Engine {
  async fn on_item(&self, payload: Value) -> Result<(), CoordinationError> {
    let key = (self.config.source.group_key)(&payload).filter(|k| !k.is_empty());
    let Some(key) = key else {
      // Dropped input: diagnosed here, never stored, never retried.
      warn!(accumulation = %self.config.name, "group key missing, dropping item");
      return Ok(());
    };

    self.store_item(&key, &payload).await?;
    self.evaluate_and_publish(&key, false).await
  }

  async fn on_timeout(&self, payload: &Value) -> Result<(), CoordinationError> {
    let Some(key) = payload.get("group_key").and_then(Value::as_str) else {
      warn!(accumulation = %self.config.name, "timeout task without group key, dropping");
      return Ok(());
    };
    self.evaluate_and_publish(key, true).await
  }

  /// Appends the item to the key's partial list; the append that creates
  /// the list also schedules the key's only timeout task.
  async fn store_item(&self, key: &str, payload: &Value) -> Result<(), CoordinationError> {
    let value_key = keys::partial(EntityKind::Accumulation, &self.config.name, key);
    let stored = self.store.list_push(&value_key, &payload.to_string()).await?;
    self.store.expire_ms(&value_key, self.config.timeout * 2).await?;

    if stored == 1 {
      self
        .timeout_queue
        .enqueue(
          json!({ "group_key": key }),
          JobOptions::delayed(self.config.timeout),
        )
        .await?;
      debug!(accumulation = %self.config.name, %key, "first item, timeout scheduled");
    }
    Ok(())
  }

  async fn evaluate_and_publish(&self, key: &str, terminate: bool) -> Result<(), CoordinationError> {
    let result = self
      .serializer
      .run_exclusive(key, || self.evaluate(key, terminate))
      .await?;
    if let Some(result) = result {
      debug!(accumulation = %self.config.name, %key, terminate, "completed");
      if let Some(target) = &self.target {
        target.enqueue(result, JobOptions::default()).await?;
      }
    }
    Ok(())
  }

  /// The completion decision. Always entered through the serializer.
  async fn evaluate(&self, key: &str, terminate: bool) -> Result<Option<Value>, CoordinationError> {
    let guard_key = keys::guard(EntityKind::Accumulation, &self.config.name, key);
    if self.store.exists(&guard_key).await? {
      // Already closed; later deliveries and the timeout all end up here.
      return Ok(None);
    }

    let value_key = keys::partial(EntityKind::Accumulation, &self.config.name, key);
    let raw = self.store.list_range(&value_key).await?;
    let items = raw
      .iter()
      .map(|item| serde_json::from_str(item))
      .collect::<Result<Vec<Value>, _>>()
      .map_err(StoreError::from)?;

    let done = terminate
      || self
        .config
        .is_complete
        .as_ref()
        .is_some_and(|is_complete| is_complete(&items));
    if !done {
      return Ok(None);
    }

    let result = (self.config.on_complete)(&items);
    self.store.set(&guard_key, "1").await?;
    self.store.expire_ms(&guard_key, self.config.timeout * 2).await?;
    Ok(Some(result))
  }
}

