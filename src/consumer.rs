//! Consumer-group delivery over a raw log stream.
//!
//! [`GroupConsumer`] turns the store's append-only log into Kafka-style
//! consumer-group consumption: each `consume` call runs a loop that first
//! recovers the group's pending (delivered-but-unacknowledged) entries, then
//! trims entries older than the retention window off the head of the
//! stream, then reads new entries, sleeping briefly whenever both reads
//! came back empty.
//!
//! Delivery is at-least-once. An entry is acknowledged only after the
//! handler returns `Ok`; a failing handler leaves it pending, to be retried
//! on a later pending phase until the retention window evicts it
//! (acknowledged without the handler; this is the bounded-retry backstop).
//!
//! Ordering is preserved per stream. Within one group each entry goes to
//! exactly one member; nothing is guaranteed across members.
//!
//! Failures never cross the loop boundary: every error is pushed onto the
//! consumer's error channel (see [`GroupConsumer::errors`]) and logged, and
//! the loop carries on. `close` flips a cooperative flag checked between
//! iterations of all three phases and waits for every loop to exit.

use crate::error::{CoordinationError, HandlerError, StoreError};
use crate::message::{EntryId, JobOptions, now_ms, random_token};
use crate::store::{ReadPosition, Store};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Async processor for delivered entries.
///
/// Receives the deserialized payload and the job options the entry was
/// produced with. Returning `Err` leaves the entry unacknowledged.
pub type EntryHandler =
  Arc<dyn Fn(serde_json::Value, JobOptions) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Tuning for a consume loop.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
  /// Entries read per store call.
  pub batch_size: usize,
  /// Sleep between polls when both reads came back empty.
  pub block_time: Duration,
  /// Entries older than this are evicted: trimmed from the stream head and,
  /// when still pending, acknowledged without the handler.
  pub max_retention: Duration,
  /// Minimum interval between head trims.
  pub trim_interval: Duration,
}

impl Default for ConsumerOptions {
  fn default() -> Self {
    Self {
      batch_size: 1,
      block_time: Duration::from_millis(1000),
      max_retention: Duration::from_secs(60 * 60 * 24),
      trim_interval: Duration::from_secs(60),
    }
  }
}

impl ConsumerOptions {
  /// Sets the read batch size.
  #[must_use]
  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  /// Sets the idle sleep.
  #[must_use]
  pub fn with_block_time(mut self, block_time: Duration) -> Self {
    self.block_time = block_time;
    self
  }

  /// Sets the retention window.
  #[must_use]
  pub fn with_max_retention(mut self, max_retention: Duration) -> Self {
    self.max_retention = max_retention;
    self
  }

  /// Sets the minimum interval between trims.
  #[must_use]
  pub fn with_trim_interval(mut self, trim_interval: Duration) -> Self {
    self.trim_interval = trim_interval;
    self
  }
}

/// Consumer-group reader over one log stream.
///
/// `consume` may be called several times with different group names; all
/// loops share the stream, the options, the error channel, and the closing
/// flag. That is what lets a distribution engine attach one independent
/// group per target to a single consumer.
pub struct GroupConsumer {
  store: Arc<dyn Store>,
  stream: String,
  opts: ConsumerOptions,
  closing: Arc<AtomicBool>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  errors_tx: mpsc::UnboundedSender<CoordinationError>,
  errors_rx: Mutex<Option<mpsc::UnboundedReceiver<CoordinationError>>>,
}

impl GroupConsumer {
  /// Creates a consumer over `stream`.
  #[must_use]
  pub fn new(store: Arc<dyn Store>, stream: impl Into<String>, opts: ConsumerOptions) -> Self {
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    Self {
      store,
      stream: stream.into(),
      opts,
      closing: Arc::new(AtomicBool::new(false)),
      tasks: Mutex::new(Vec::new()),
      errors_tx,
      errors_rx: Mutex::new(Some(errors_rx)),
    }
  }

  /// The stream this consumer reads.
  #[must_use]
  pub fn stream_name(&self) -> &str {
    &self.stream
  }

  /// Takes the error channel. Every failure inside any consume loop of this
  /// consumer is delivered here; when nobody takes it, errors are only
  /// logged. Yields `None` for callers after the first.
  pub fn errors(&self) -> Option<mpsc::UnboundedReceiver<CoordinationError>> {
    self.errors_rx.lock().expect("consumer mutex poisoned").take()
  }

  /// Number of entries currently in the stream.
  pub async fn len(&self) -> Result<u64, StoreError> {
    self.store.stream_len(&self.stream).await
  }

  /// Starts a consume loop delivering the stream to `group`.
  ///
  /// The group is created if absent; losing the creation race to another
  /// member is swallowed. The loop runs until [`close`](Self::close).
  pub fn consume(&self, group: impl Into<String>, handler: EntryHandler) {
    let worker = GroupWorker {
      store: self.store.clone(),
      stream: self.stream.clone(),
      group: group.into(),
      consumer: random_token(),
      opts: self.opts.clone(),
      closing: self.closing.clone(),
      errors: self.errors_tx.clone(),
      handler,
      last_trim: 0,
    };
    let task = tokio::spawn(worker.run());
    self.tasks.lock().expect("consumer mutex poisoned").push(task);
  }

  /// Stops every consume loop and waits for them to exit.
  pub async fn close(&self) {
    self.closing.store(true, Ordering::SeqCst);
    let tasks: Vec<_> = self
      .tasks
      .lock()
      .expect("consumer mutex poisoned")
      .drain(..)
      .collect();
    for task in tasks {
      let _ = task.await;
    }
  }
}

/// One consume loop: a (stream, group) pair bound to a handler.
struct GroupWorker {
  store: Arc<dyn Store>,
  stream: String,
  group: String,
  consumer: String,
  opts: ConsumerOptions,
  closing: Arc<AtomicBool>,
  errors: mpsc::UnboundedSender<CoordinationError>,
  handler: EntryHandler,
  last_trim: u64,
}

impl GroupWorker {
  fn closing(&self) -> bool {
    self.closing.load(Ordering::SeqCst)
  }

  fn report(&self, error: CoordinationError) {
    warn!(
      stream = %self.stream,
      group = %self.group,
      error = %error,
      "consume loop error"
    );
    let _ = self.errors.send(error);
  }

  async fn run(mut self) {
    match self.store.create_group(&self.stream, &self.group).await {
      Ok(()) => {}
      // Another member created it first; the group existing is all we need.
      Err(StoreError::GroupExists(_)) => {}
      Err(e) => {
        self.report(e.into());
        return;
      }
    }

    while !self.closing() {
      let worked_pending = self.pending_phase().await;
      self.trim_phase().await;
      let worked_new = self.new_phase().await;
      if !worked_pending && !worked_new && !self.closing() {
        tokio::time::sleep(self.opts.block_time).await;
      }
    }
    debug!(stream = %self.stream, group = %self.group, "consume loop closed");
  }

  /// Drains the group's pending entries. Returns whether any entry was
  /// acknowledged, so an all-failing backlog still reaches the idle sleep.
  async fn pending_phase(&self) -> bool {
    let mut worked = false;
    while !self.closing() {
      let batch = match self
        .store
        .read_group(
          &self.stream,
          &self.group,
          &self.consumer,
          ReadPosition::Pending,
          self.opts.batch_size,
        )
        .await
      {
        Ok(batch) => batch,
        Err(e) => {
          self.report(e.into());
          break;
        }
      };
      if batch.is_empty() {
        break;
      }

      let now = now_ms();
      let retention_ms = self.opts.max_retention.as_millis() as u64;
      let mut acked = 0usize;
      for entry in batch {
        if now.saturating_sub(entry.id.ms) > retention_ms {
          // Out of retries: past the retention window, acknowledge without
          // invoking the handler.
          warn!(
            stream = %self.stream,
            group = %self.group,
            id = %entry.id,
            "evicting stale pending entry"
          );
          match self.store.ack(&self.stream, &self.group, entry.id).await {
            Ok(()) => acked += 1,
            Err(e) => self.report(e.into()),
          }
        } else if self.dispatch(entry).await {
          acked += 1;
        }
      }
      if acked == 0 {
        // Every entry in the batch failed; leave them for the next pending
        // phase instead of spinning on them here.
        break;
      }
      worked = true;
    }
    worked
  }

  /// Trims entries older than the retention window off the stream head,
  /// at most once per trim interval. Best effort.
  async fn trim_phase(&mut self) {
    let now = now_ms();
    if now < self.last_trim + self.opts.trim_interval.as_millis() as u64 {
      return;
    }
    self.last_trim = now;
    let cutoff = now.saturating_sub(self.opts.max_retention.as_millis() as u64);

    let head = match self.store.range_head(&self.stream, 1).await {
      Ok(head) => head,
      Err(e) => {
        self.report(e.into());
        return;
      }
    };
    let Some(oldest) = head.first() else {
      return;
    };
    if oldest.id.ms >= cutoff {
      return;
    }
    match self.store.trim_min_id(&self.stream, EntryId::min_at(cutoff)).await {
      Ok(dropped) => debug!(stream = %self.stream, dropped, "trimmed stream"),
      Err(e) => self.report(e.into()),
    }
  }

  /// Reads new entries until a read comes back empty. Returns whether
  /// anything was read.
  async fn new_phase(&self) -> bool {
    let mut worked = false;
    while !self.closing() {
      let batch = match self
        .store
        .read_group(
          &self.stream,
          &self.group,
          &self.consumer,
          ReadPosition::New,
          self.opts.batch_size,
        )
        .await
      {
        Ok(batch) => batch,
        Err(e) => {
          self.report(e.into());
          break;
        }
      };
      if batch.is_empty() {
        break;
      }
      worked = true;
      for entry in batch {
        self.dispatch(entry).await;
      }
    }
    worked
  }

  /// Hands one entry to the handler; acknowledges on success. Returns
  /// whether the entry was acknowledged.
  async fn dispatch(&self, entry: crate::message::StreamEntry) -> bool {
    let data: serde_json::Value = match serde_json::from_slice(&entry.data) {
      Ok(data) => data,
      Err(e) => {
        // Undecodable entries stay pending until retention evicts them.
        self.report(StoreError::from(e).into());
        return false;
      }
    };
    let opts: JobOptions = if entry.opts.is_empty() {
      JobOptions::default()
    } else {
      match serde_json::from_slice(&entry.opts) {
        Ok(opts) => opts,
        Err(e) => {
          self.report(StoreError::from(e).into());
          return false;
        }
      }
    };

    match (self.handler)(data, opts).await {
      Ok(()) => match self.store.ack(&self.stream, &self.group, entry.id).await {
        Ok(()) => true,
        Err(e) => {
          self.report(e.into());
          false
        }
      },
      Err(e) => {
        self.report(CoordinationError::Callback(e));
        false
      }
    }
  }
}
