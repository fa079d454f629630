//! Job-queue collaborator seam.
//!
//! The coordination core consumes job queues, it does not implement one:
//! durability, retry backoff, and cross-process dispatch are the queue's
//! business. The [`JobQueue`] trait is the slice of queue behavior the core
//! relies on: enqueue with options, and a worker loop whose failing
//! handler marks the item failed under the queue's own retry policy.
//!
//! [`QueueFactory`] resolves queue names to handles. Engines use it for the
//! queues named in their configuration and for the delayed-job queues that
//! carry their timeout tasks.

/// In-process queue backend.
pub mod memory;

pub use memory::{MemoryQueue, MemoryQueueFactory};

use crate::error::{HandlerError, QueueError};
use crate::message::{Job, JobId, JobOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

/// Async job processor attached to a queue worker.
///
/// Returning `Err` marks the delivery failed; whether and when the job is
/// redelivered is the queue's retry policy, not the handler's.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A queue of JSON jobs with at-least-once worker delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
  /// The queue's name.
  fn name(&self) -> &str;

  /// Enqueues a payload; `opts.delay` defers its availability.
  async fn enqueue(&self, payload: serde_json::Value, opts: JobOptions) -> Result<JobId, QueueError>;

  /// Starts a worker loop feeding jobs to `handler` until the returned
  /// handle is closed.
  async fn process(&self, handler: JobHandler) -> Result<WorkerHandle, QueueError>;
}

/// Resolves queue names to queue handles.
///
/// One factory spans one queue namespace; every component wired through the
/// same factory sees the same queues.
pub trait QueueFactory: Send + Sync {
  /// Returns the queue with the given name, creating it if needed.
  fn queue(&self, name: &str) -> Arc<dyn JobQueue>;
}

/// Handle to a running queue worker.
///
/// Dropping the handle does not stop the worker; call [`close`](Self::close).
pub struct WorkerHandle {
  closing: Arc<AtomicBool>,
  task: JoinHandle<()>,
}

impl WorkerHandle {
  /// Wraps a spawned worker task and its cooperative closing flag.
  #[must_use]
  pub fn new(closing: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
    Self { closing, task }
  }

  /// Signals the worker to stop and waits for in-flight work to finish.
  pub async fn close(self) {
    self.closing.store(true, Ordering::SeqCst);
    let _ = self.task.await;
  }
}
