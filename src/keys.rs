//! Key schema for everything the crate writes to the store.
//!
//! Every store key, derived stream name, and internal queue name is built
//! here, from the same four coordinates: the entity kind, the entity name,
//! the correlation key, and (for join slots) the source id. The kind is
//! always part of the key, so an accumulation named `orders` and a join
//! named `orders` can never collide.

use std::fmt;

/// Namespace prefix shared by every key this crate writes.
pub const NAMESPACE: &str = "queueweave";

/// The kind of entity a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  /// N-source, M-target distribution engine.
  Router,
  /// Single-source replication with a caller-chosen group prefix.
  Fanout,
  /// Single-source, M-target distribution engine.
  Pubsub,
  /// Single-source many-events aggregation.
  Accumulation,
  /// Multi-source correlation.
  Join,
}

impl EntityKind {
  /// The key-schema token for this kind.
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      EntityKind::Router => "router",
      EntityKind::Fanout => "fanout",
      EntityKind::Pubsub => "pubsub",
      EntityKind::Accumulation => "accumulation",
      EntityKind::Join => "join",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Name of the log stream a distribution engine mirrors `source` into.
#[must_use]
pub fn stream(kind: EntityKind, source: &str) -> String {
  format!("{NAMESPACE}:{kind}:stream:{source}")
}

/// Name of the delayed-job queue carrying an engine's timeout tasks.
#[must_use]
pub fn timeout_queue(kind: EntityKind, name: &str) -> String {
  format!("{NAMESPACE}:{kind}:timeout:{name}")
}

/// Key of the partial-accumulation list for one group key.
#[must_use]
pub fn partial(kind: EntityKind, name: &str, key: &str) -> String {
  format!("{NAMESPACE}:{kind}:value:{name}:{key}")
}

/// Key of the single-payload slot for one (join key, source) pair.
#[must_use]
pub fn slot(kind: EntityKind, name: &str, key: &str, source: &str) -> String {
  format!("{NAMESPACE}:{kind}:value:{name}:{key}:{source}")
}

/// Key of the completion guard for one correlation key.
#[must_use]
pub fn guard(kind: EntityKind, name: &str, key: &str) -> String {
  format!("{NAMESPACE}:{kind}:guard:{name}:{key}")
}

/// Key of the first-seen marker that makes timeout scheduling one-shot.
#[must_use]
pub fn first_seen(kind: EntityKind, name: &str, key: &str) -> String {
  format!("{NAMESPACE}:{kind}:seen:{name}:{key}")
}

/// Key of the per-key mutual-exclusion lock.
#[must_use]
pub fn lock(kind: EntityKind, name: &str, key: &str) -> String {
  format!("{NAMESPACE}:{kind}:lock:{name}:{key}")
}
