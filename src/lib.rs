//! # QueueWeave
//!
//! Distributed messaging-coordination patterns over log streams and job
//! queues.
//!
//! QueueWeave does not store anything itself. It is built on two external
//! primitives, a key-value/log store with append-only streams
//! ([`store::Store`]) and a job queue with push/acknowledge semantics
//! ([`queue::JobQueue`]), and layers coordination patterns on top:
//!
//! - **Consumer groups**: [`consumer::GroupConsumer`] turns raw log streams
//!   into ordered, acknowledged, replayable at-least-once delivery
//! - **Distribution**: [`distribution::Router`], [`distribution::Fanout`],
//!   and [`distribution::Pubsub`] replicate source queues to target queues
//!   through per-pair consumer groups
//! - **Stateful coordination**: [`accumulation::Accumulation`] and
//!   [`join::Join`] gather correlated events arriving at independent
//!   consumers into a single downstream result, with a timeout fallback and
//!   per-key mutual exclusion ([`serializer::KeyedSerializer`]) guaranteeing
//!   idempotent completion under concurrent delivery
//!
//! Delivery is at-least-once everywhere; completion is made effectively
//! once per key by the guard-and-lock discipline, not by the transport.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use queueweave::accumulation::{Accumulation, AccumulationConfig, AccumulationSource};
//! use queueweave::queue::MemoryQueueFactory;
//! use queueweave::store::MemoryStore;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let queues = MemoryQueueFactory::new();
//!
//! let source = AccumulationSource::new(
//!   "events",
//!   Arc::new(|data| data["order"].as_str().map(String::from)),
//! );
//! let config = AccumulationConfig::new(
//!   "order-totals",
//!   source,
//!   Arc::new(|items| json!({ "count": items.len() })),
//! )
//! .with_timeout(Duration::from_secs(30))
//! .with_target("totals");
//!
//! let mut accumulation = Accumulation::new(store, queues, config);
//! accumulation.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

use std::time::Duration;

/// Default engine timeout when a configuration does not set one: one hour.
///
/// Partial-state and guard ttls are always derived as twice the configured
/// timeout, so they outlive the timeout task by construction.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Single-source many-events aggregation per group key.
pub mod accumulation;
/// Bridging a job queue into a log stream.
pub mod bridge;
/// Consumer-group delivery over raw log streams.
pub mod consumer;
/// Distribution engines: router, fanout, pubsub.
pub mod distribution;
/// Error taxonomy for the coordination core.
pub mod error;
/// Multi-source correlation per join key.
pub mod join;
/// Key schema for everything written to the store.
pub mod keys;
/// Entry and job envelope types.
pub mod message;
/// Appending entries to log streams.
pub mod producer;
/// Job-queue collaborator seam and in-process backend.
pub mod queue;
/// Store-backed per-key mutual exclusion.
pub mod serializer;
/// Store trait seam and backends.
pub mod store;

#[cfg(test)]
mod consumer_test;
#[cfg(test)]
mod keys_test;
