//! Multi-source correlation.
//!
//! A [`Join`] watches S named source queues and correlates their items by a
//! caller-derived join key. Per (key, source) there is one overwritable
//! slot (last write wins), and the join completes for a key when every
//! source's slot is present, or when the timeout scheduled on the key's
//! first slot write fires, whichever comes first. A timeout completion is
//! partial: it aggregates whichever slots are present at that moment.
//!
//! The guard and serializer discipline is the same as for
//! [`Accumulation`](crate::accumulation::Accumulation): every evaluation
//! runs under the per-key lock and starts with a guard check, so exactly
//! one completion is ever published per key.
//!
//! Items whose derived key is absent or empty are logged and dropped
//! before any storage or scheduling, so no timeout can ever fire for them.

use crate::accumulation::GroupKeyFn;
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

/// Aggregates the present slots into the published result.
pub type OnJoinFn = Arc<dyn Fn(&[SourceSlot]) -> Value + Send + Sync>;

/// One source's contribution to a join key.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSlot {
  /// The source queue the value arrived on.
  pub source: String,
  /// The latest payload that source delivered for the key.
  pub value: Value,
}

/// One queue feeding a join and how it keys its items.
#[derive(Clone)]
pub struct JoinSource {
  /// Source queue name; also labels the source's slot in results.
  pub queue: String,
  /// Key derivation over item payloads.
  pub join_key: GroupKeyFn,
}

impl JoinSource {
  /// Creates a source.
  #[must_use]
  pub fn new(queue: impl Into<String>, join_key: GroupKeyFn) -> Self {
    Self {
      queue: queue.into(),
      join_key,
    }
  }
}

/// Configuration for a [`Join`], assembled before construction.
#[derive(Clone)]
pub struct JoinConfig {
  /// Namespace for this join's slots, guards, and timeout queue.
  pub name: String,
  /// Fallback completion delay, counted from a key's first slot write.
  /// Slot and guard ttls are derived as twice this.
  pub timeout: Duration,
  /// Aggregation producing the published result.
  pub on_complete: OnJoinFn,
  /// The named sources; a key completes early once all of them have a
  /// slot present.
  pub sources: Vec<JoinSource>,
  /// Queue results are published to.
  pub target: String,
}

impl JoinConfig {
  /// Configuration with the crate default timeout.
  #[must_use]
  pub fn new(
    name: impl Into<String>,
    sources: Vec<JoinSource>,
    target: impl Into<String>,
    on_complete: OnJoinFn,
  ) -> Self {
    Self {
      name: name.into(),
      timeout: crate::DEFAULT_TIMEOUT,
      on_complete,
      sources,
      target: target.into(),
    }
  }

  /// Sets the timeout.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

/// Correlates items from S source queues into one result per join key.
pub struct Join {
  queues: Arc<dyn QueueFactory>,
  engine: Arc<Engine>,
  workers: Vec<WorkerHandle>,
}

impl Join {
  /// Creates a join from its immutable configuration.
  #[must_use]
  pub fn new(store: Arc<dyn Store>, queues: Arc<dyn QueueFactory>, config: JoinConfig) -> Self {
    let serializer = KeyedSerializer::new(
      store.clone(),
      EntityKind::Join,
      config.name.clone(),
      SerializerOptions::default(),
    );
    let timeout_queue = queues.queue(&keys::timeout_queue(EntityKind::Join, &config.name));
    let target = queues.queue(&config.target);
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

  /// Starts one worker per source plus the timeout worker.
  ///
  /// Calling `run` on an engine that is already running is a no-op.
  pub async fn run(&mut self) -> Result<(), CoordinationError> {
    if !self.workers.is_empty() {
      debug!(join = %self.engine.config.name, "already running, ignoring");
      return Ok(());
    }
    for source in self.engine.config.sources.clone() {
      let queue = self.queues.queue(&source.queue);
      self
        .workers
        .push(queue.process(source_handler(self.engine.clone(), source)).await?);
    }
    self
      .workers
      .push(self.engine.timeout_queue.process(timeout_handler(self.engine.clone())).await?);
    Ok(())
  }

  /// Stops every worker and waits for in-flight items.
  pub async fn close(&mut self) {
    for worker in self.workers.drain(..) {
      worker.close().await;
    }
  }
}

fn source_handler(engine: Arc<Engine>, source: JoinSource) -> JobHandler {
  Arc::new(move |job| {
    let engine = engine.clone();
    let source = source.clone();
    Box::pin(async move {
      engine.on_item(&source, job.payload).await?;
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
  config: JoinConfig,
  serializer: KeyedSerializer,
  timeout_queue: Arc<dyn JobQueue>,
  target: Arc<dyn JobQueue>,
}

impl Engine {
  async fn on_item(&self, source: &JoinSource, payload: Value) -> Result<(), CoordinationError> {
    let key = (source.join_key)(&payload).filter(|k| !k.is_empty());
    let Some(key) = key else {
      // Dropped input: never stored, so no timeout can fire for it.
      warn!(join = %self.config.name, source = %source.queue, "join key missing, dropping item");
      return Ok(());
    };

    self.store_slot(&key, &source.queue, &payload).await?;
    self.evaluate_and_publish(&key, false).await
  }

  async fn on_timeout(&self, payload: &Value) -> Result<(), CoordinationError> {
    let Some(key) = payload.get("join_key").and_then(Value::as_str) else {
      warn!(join = %self.config.name, "timeout task without join key, dropping");
      return Ok(());
    };
    self.evaluate_and_publish(key, true).await
  }

  /// Writes the (key, source) slot, last write winning, and schedules the
  /// key's only timeout task if this is the first slot the key ever got.
  async fn store_slot(
    &self,
    key: &str,
    source: &str,
    payload: &Value,
  ) -> Result<(), CoordinationError> {
    let ttl = self.config.timeout * 2;
    let slot_key = keys::slot(EntityKind::Join, &self.config.name, key, source);
    self.store.set(&slot_key, &payload.to_string()).await?;
    self.store.expire_ms(&slot_key, ttl).await?;

    let seen_key = keys::first_seen(EntityKind::Join, &self.config.name, key);
    if self.store.set_nx_px(&seen_key, "1", ttl).await? {
      self
        .timeout_queue
        .enqueue(
          json!({ "join_key": key }),
          JobOptions::delayed(self.config.timeout),
        )
        .await?;
      debug!(join = %self.config.name, %key, "first slot, timeout scheduled");
    }
    Ok(())
  }

  async fn evaluate_and_publish(&self, key: &str, terminate: bool) -> Result<(), CoordinationError> {
    let result = self
      .serializer
      .run_exclusive(key, || self.evaluate(key, terminate))
      .await?;
    if let Some(result) = result {
      debug!(join = %self.config.name, %key, terminate, "completed");
      self.target.enqueue(result, JobOptions::default()).await?;
    }
    Ok(())
  }

  /// The completion decision. Always entered through the serializer.
  async fn evaluate(&self, key: &str, terminate: bool) -> Result<Option<Value>, CoordinationError> {
    let guard_key = keys::guard(EntityKind::Join, &self.config.name, key);
    if self.store.exists(&guard_key).await? {
      return Ok(None);
    }

    // Gather whichever slots are present, in configured source order.
    let mut present = Vec::new();
    for source in &self.config.sources {
      let slot_key = keys::slot(EntityKind::Join, &self.config.name, key, &source.queue);
      if let Some(raw) = self.store.get(&slot_key).await? {
        present.push(SourceSlot {
          source: source.queue.clone(),
          value: serde_json::from_str(&raw).map_err(StoreError::from)?,
        });
      }
    }

    if present.len() < self.config.sources.len() && !terminate {
      return Ok(None);
    }

    let result = (self.config.on_complete)(&present);
    self.store.set(&guard_key, "1").await?;
    self.store.expire_ms(&guard_key, self.config.timeout * 2).await?;
    Ok(Some(result))
  }
}
