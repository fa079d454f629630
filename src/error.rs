//! Error types for the coordination core.
//!
//! The taxonomy mirrors how each failure is handled rather than where it
//! came from:
//!
//! - [`StoreError`]: a store call failed. Transient variants are surfaced on
//!   the owning component's error channel and retried on the next loop
//!   iteration; they are never fatal.
//! - [`QueueError`]: a job-queue call failed.
//! - [`CoordinationError`]: the crate-level error. `Callback` marks a user
//!   processor failure; the entry or job stays unacknowledged and its own
//!   retry policy applies. `DroppedInput` marks a falsy correlation key,
//!   logged and discarded, never stored, never retried.
//!
//! Starting a component twice under the same name is deliberately *not* an
//! error: it is treated as a no-op by the component itself. No condition in
//! this crate terminates the process.

use thiserror::Error;

/// Boxed error produced by a user-supplied handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error from the key-value/log store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The store could not be reached or answered with a transient failure.
  /// Loops report it and retry on their next iteration.
  #[error("transient store error: {0}")]
  Transient(String),
  /// The store answered, but with something the caller cannot use.
  #[error("unexpected store response: {0}")]
  Response(String),
  /// Consumer-group creation raced with another creator. Swallowed by
  /// consumers; the group existing is the desired outcome.
  #[error("consumer group already exists: {0}")]
  GroupExists(String),
  /// A payload could not be serialized or deserialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
  fn from(e: redis::RedisError) -> Self {
    if e.code() == Some("BUSYGROUP") {
      StoreError::GroupExists(e.to_string())
    } else {
      StoreError::Transient(e.to_string())
    }
  }
}

/// Error from a job-queue collaborator.
#[derive(Debug, Error)]
pub enum QueueError {
  /// The queue is closed and no longer accepts work.
  #[error("queue {0} is closed")]
  Closed(String),
  /// The backing store failed while touching the queue.
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Crate-level error carried on error channels and returned by operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
  /// A store call failed.
  #[error(transparent)]
  Store(#[from] StoreError),
  /// A queue call failed.
  #[error(transparent)]
  Queue(#[from] QueueError),
  /// A user-supplied handler failed. The triggering entry or job remains
  /// unacknowledged and is retried under its own policy.
  #[error("handler failed: {0}")]
  Callback(#[source] HandlerError),
  /// An input arrived without a usable correlation key and was discarded.
  #[error("input dropped: {0}")]
  DroppedInput(String),
}
