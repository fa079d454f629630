//! Distribution engines: replicating queues into queues.
//!
//! [`Router`], [`Fanout`], and [`Pubsub`] all move entries from source
//! queues to target queues through the same machinery: each source queue is
//! bridged into a log stream, and each (source, target) pair gets its own
//! consumer group named `source:target` on that stream. Independent groups
//! mean every target receives a full copy of the source, in source order,
//! including entries produced before the engine started; and entries a
//! group has acknowledged are never redelivered, across restarts included.
//!
//! The three engines differ only in shape and option handling:
//!
//! - `Router`: N sources × M targets; target options are the source job's
//!   options merged with an optional override function of the payload
//! - `Pubsub`: one source × M targets, same option merge
//! - `Fanout`: one source × M targets under a caller-chosen group prefix;
//!   only the override function's options are applied
//!
//! Configuration is immutable and complete before `run`; starting a
//! (source, target) pair twice is a no-op, not an error.

/// Single-source replication with a caller-chosen group prefix.
pub mod fanout;
/// Single-source, many-target replication.
pub mod pubsub;
/// Many-source, many-target replication.
pub mod router;

pub use fanout::{Fanout, FanoutConfig};
pub use pubsub::{Pubsub, PubsubConfig};
pub use router::{Router, RouterConfig};

#[cfg(test)]
mod router_test;

use crate::bridge::QueueToStreamBridge;
use crate::consumer::{ConsumerOptions, EntryHandler, GroupConsumer};
use crate::error::CoordinationError;
use crate::keys::{self, EntityKind};
use crate::message::JobOptions;
use crate::producer::StreamProducer;
use crate::queue::{JobQueue, QueueFactory};
use crate::store::Store;
use std::sync::Arc;
use tracing::debug;

/// Function deriving per-payload option overrides for forwarded entries.
pub type OptsOverrideFn = Arc<dyn Fn(&serde_json::Value) -> JobOptions + Send + Sync>;

/// One source queue mirrored into its stream: the bridge feeding it and the
/// consumer the engine attaches target groups to.
pub(crate) struct SourceRelay {
  pub(crate) consumer: GroupConsumer,
  bridge: QueueToStreamBridge,
}

impl SourceRelay {
  /// Bridges `source` into the engine's stream and readies a consumer.
  pub(crate) async fn start(
    kind: EntityKind,
    store: Arc<dyn Store>,
    queues: &Arc<dyn QueueFactory>,
    source: &str,
    opts: ConsumerOptions,
  ) -> Result<Self, CoordinationError> {
    let stream = keys::stream(kind, source);
    let producer = StreamProducer::new(store.clone(), stream.clone());
    let bridge = QueueToStreamBridge::start(&queues.queue(source), producer).await?;
    let consumer = GroupConsumer::new(store, stream, opts);
    Ok(Self { consumer, bridge })
  }

  /// Stops the bridge first so the stream quiesces, then the consumer.
  pub(crate) async fn close(self) {
    self.bridge.close().await;
    self.consumer.close().await;
  }
}

/// Builds the handler that re-enqueues delivered entries on `target`.
///
/// With `merge_source_opts` the source job's options are the base and the
/// override function's output wins on conflicts; without it only the
/// override output is applied.
pub(crate) fn forward_handler(
  target: Arc<dyn JobQueue>,
  merge_source_opts: bool,
  opts_override: Option<OptsOverrideFn>,
) -> EntryHandler {
  Arc::new(move |data, opts| {
    let target = target.clone();
    let overridden = opts_override
      .as_ref()
      .map(|render| render(&data))
      .unwrap_or_default();
    let merged = if merge_source_opts {
      opts.merge(&overridden)
    } else {
      overridden
    };
    Box::pin(async move {
      target.enqueue(data, merged).await?;
      debug!(target = %target.name(), "forwarded entry");
      Ok(())
    })
  })
}
