//! Store trait seam and backends.
//!
//! The coordination core never talks to a concrete database. It is written
//! against two narrow traits, [`StreamStore`] for append-only log streams
//! with consumer groups and [`KvStore`] for atomic key and list operations
//! with expiry, combined into [`Store`], the handle every component receives at
//! construction.
//!
//! Two backends ship with the crate:
//!
//! - [`RedisStore`]: maps each trait method onto the corresponding stream or
//!   key command of a Redis-compatible server
//! - [`MemoryStore`]: a single-process implementation for tests, demos, and
//!   deployments that do not need durability
//!
//! Storage semantics (durability, replication, eviction under memory
//! pressure) belong to the backend; the core only assumes the contracts
//! documented on the trait methods.

/// In-process backend.
pub mod memory;
/// Redis-backed backend.
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::StoreError;
use crate::message::{EntryId, StreamEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Which entries a consumer-group read should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
  /// The group's delivered-but-unacknowledged entries, oldest first.
  Pending,
  /// Entries the group has never delivered, advancing the group cursor.
  New,
}

/// Append-only log streams with named consumer groups.
#[async_trait]
pub trait StreamStore: Send + Sync {
  /// Appends an entry and returns the store-assigned id.
  async fn append(&self, stream: &str, data: Bytes, opts: Bytes) -> Result<EntryId, StoreError>;

  /// Creates a consumer group positioned at the start of the stream.
  ///
  /// Returns [`StoreError::GroupExists`] when the group is already there;
  /// callers racing on creation swallow that variant.
  async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

  /// Reads up to `count` entries for `consumer` in `group`.
  ///
  /// With [`ReadPosition::New`] the returned entries are recorded as pending
  /// for the group until acknowledged. With [`ReadPosition::Pending`] the
  /// group's unacknowledged entries are returned again, re-claimed for
  /// `consumer`.
  async fn read_group(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    position: ReadPosition,
    count: usize,
  ) -> Result<Vec<StreamEntry>, StoreError>;

  /// Acknowledges one entry for the group, removing it from pending.
  async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError>;

  /// Reads up to `count` entries from the head (oldest end) of the stream.
  async fn range_head(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError>;

  /// Removes entries with ids below `min_id`; returns how many went.
  ///
  /// Best effort: backends may trim approximately.
  async fn trim_min_id(&self, stream: &str, min_id: EntryId) -> Result<u64, StoreError>;

  /// Number of entries currently in the stream.
  async fn stream_len(&self, stream: &str) -> Result<u64, StoreError>;
}

/// Atomic key and list operations with millisecond expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
  /// Sets a string value unconditionally.
  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  /// Reads a string value.
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Sets `key` only if absent, with a ttl. Returns whether it was set.
  ///
  /// This is the primitive behind first-seen markers and the per-key lock.
  async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

  /// Deletes a key. Returns whether it existed.
  async fn delete(&self, key: &str) -> Result<bool, StoreError>;

  /// Appends to the list at `key`; returns the new list length.
  async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError>;

  /// Reads the whole list at `key`, in push order.
  async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;

  /// Length of the list at `key` (0 when absent).
  async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

  /// Sets or refreshes a key's ttl. Returns whether the key existed.
  async fn expire_ms(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

  /// Whether `key` currently exists.
  async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// The combined store handle components are constructed with.
pub trait Store: StreamStore + KvStore {}

impl<T: StreamStore + KvStore> Store for T {}
