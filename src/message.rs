//! Entry and job envelope types.
//!
//! This module defines the wire-level types shared by every component:
//!
//! - [`EntryId`]: the monotonic timestamp-sequence id the store assigns to
//!   appended log entries
//! - [`StreamEntry`]: one entry in a log stream (`data` and `opts` payloads)
//! - [`Job`] / [`JobOptions`]: one item in a job queue and its delivery
//!   options
//!
//! Payloads travel as JSON. An entry carries two independent JSON documents,
//! the producer-supplied data and the job options that accompanied it, so a
//! distribution engine can re-enqueue the entry downstream with its original
//! options intact.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifier of a single entry in a log stream.
///
/// Ids are assigned by the store on append and are strictly increasing per
/// stream. The `ms` half is the wall-clock append time in milliseconds, the
/// `seq` half disambiguates entries appended within the same millisecond.
/// The rendered form is `ms-seq`, matching the store's native id syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
  /// Append time in milliseconds since the Unix epoch.
  pub ms: u64,
  /// Sequence number within the millisecond.
  pub seq: u64,
}

impl EntryId {
  /// Creates an id from its two halves.
  #[must_use]
  pub const fn new(ms: u64, seq: u64) -> Self {
    Self { ms, seq }
  }

  /// The smallest id with the given timestamp, used as a trim cutoff.
  #[must_use]
  pub const fn min_at(ms: u64) -> Self {
    Self { ms, seq: 0 }
  }
}

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.ms, self.seq)
  }
}

/// Error returned when an id string is not of the `ms-seq` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed entry id: {0}")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
  type Err = ParseEntryIdError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (ms, seq) = s
      .split_once('-')
      .ok_or_else(|| ParseEntryIdError(s.to_string()))?;
    let ms = ms.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
    let seq = seq.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
    Ok(Self { ms, seq })
  }
}

/// One entry read from a log stream.
///
/// `data` and `opts` are the serialized JSON documents written by
/// [`StreamProducer`](crate::producer::StreamProducer). `Bytes` keeps the
/// copies cheap when one entry is delivered to many consumer groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
  /// Store-assigned id; encodes the append time.
  pub id: EntryId,
  /// Serialized payload.
  pub data: Bytes,
  /// Serialized job options that accompanied the payload.
  pub opts: Bytes,
}

/// Identifier of a job in a queue.
pub type JobId = String;

/// Delivery options attached to a queued job.
///
/// A subset of what job-queue backends commonly support; unknown options are
/// the queue's concern, not this crate's. All fields are optional so that a
/// merge can distinguish "set" from "left alone".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
  /// Delay before the job becomes available, in milliseconds.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub delay: Option<u64>,
  /// Scheduling priority; lower runs first.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<i64>,
  /// Total delivery attempts before the queue gives up on the job.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub attempts: Option<u32>,
}

impl JobOptions {
  /// Options with only a delay set.
  #[must_use]
  pub fn delayed(delay: Duration) -> Self {
    Self {
      delay: Some(delay.as_millis() as u64),
      ..Self::default()
    }
  }

  /// Sets the delay.
  #[must_use]
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay.as_millis() as u64);
    self
  }

  /// Sets the priority.
  #[must_use]
  pub fn with_priority(mut self, priority: i64) -> Self {
    self.priority = Some(priority);
    self
  }

  /// Sets the attempt budget.
  #[must_use]
  pub fn with_attempts(mut self, attempts: u32) -> Self {
    self.attempts = Some(attempts);
    self
  }

  /// Overlays `overrides` on top of `self`, field by field.
  ///
  /// A field set on the override side wins; fields the override leaves
  /// `None` keep this side's value.
  #[must_use]
  pub fn merge(&self, overrides: &JobOptions) -> JobOptions {
    JobOptions {
      delay: overrides.delay.or(self.delay),
      priority: overrides.priority.or(self.priority),
      attempts: overrides.attempts.or(self.attempts),
    }
  }
}

/// One item pulled from a job queue.
#[derive(Debug, Clone)]
pub struct Job {
  /// Queue-assigned job id.
  pub id: JobId,
  /// JSON payload.
  pub payload: serde_json::Value,
  /// Delivery options the job was enqueued with.
  pub opts: JobOptions,
  /// Deliveries so far, maintained by the queue.
  pub(crate) attempts_made: u32,
}

impl Job {
  /// Creates a job on its first delivery.
  #[must_use]
  pub fn new(id: JobId, payload: serde_json::Value, opts: JobOptions) -> Self {
    Self {
      id,
      payload,
      opts,
      attempts_made: 0,
    }
  }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
  chrono::Utc::now().timestamp_millis() as u64
}

/// A 128-bit random hex token for consumer names and lock values.
pub(crate) fn random_token() -> String {
  let high: u64 = rand::random();
  let low: u64 = rand::random();
  format!("{:016x}{:016x}", high, low)
}
