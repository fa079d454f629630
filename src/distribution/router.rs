//! N-source, M-target replication.

use super::{OptsOverrideFn, SourceRelay, forward_handler};
use crate::consumer::ConsumerOptions;
use crate::error::CoordinationError;
use crate::keys::EntityKind;
use crate::queue::QueueFactory;
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Configuration for a [`Router`], assembled before construction.
#[derive(Clone, Default)]
pub struct RouterConfig {
  /// Source queue names.
  pub sources: Vec<String>,
  /// Target queue names; each receives a full copy of every source.
  pub targets: Vec<String>,
  /// Tuning for the per-source consume loops.
  pub consumer: ConsumerOptions,
  /// Optional per-payload option override; wins over source job options.
  pub opts_override: Option<OptsOverrideFn>,
}

impl RouterConfig {
  /// An empty configuration.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds source queues.
  #[must_use]
  pub fn with_sources<I, S>(mut self, sources: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.sources.extend(sources.into_iter().map(Into::into));
    self
  }

  /// Adds target queues.
  #[must_use]
  pub fn with_targets<I, S>(mut self, targets: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.targets.extend(targets.into_iter().map(Into::into));
    self
  }

  /// Sets the consume-loop tuning.
  #[must_use]
  pub fn with_consumer_options(mut self, consumer: ConsumerOptions) -> Self {
    self.consumer = consumer;
    self
  }

  /// Sets the option override function.
  #[must_use]
  pub fn with_opts_override(mut self, opts_override: OptsOverrideFn) -> Self {
    self.opts_override = Some(opts_override);
    self
  }
}

/// Replicates every source queue to every target queue.
///
/// Each (source, target) pair runs under its own consumer group, so targets
/// receive independent full copies in source order.
pub struct Router {
  store: Arc<dyn Store>,
  queues: Arc<dyn QueueFactory>,
  config: RouterConfig,
  relays: HashMap<String, SourceRelay>,
  started: HashSet<(String, String)>,
}

impl Router {
  /// Creates a router from its immutable configuration.
  #[must_use]
  pub fn new(
    store: Arc<dyn Store>,
    queues: Arc<dyn QueueFactory>,
    config: RouterConfig,
  ) -> Self {
    Self {
      store,
      queues,
      config,
      relays: HashMap::new(),
      started: HashSet::new(),
    }
  }

  /// Starts bridges and consume loops for every configured pair.
  ///
  /// Pairs that are already running are skipped, so calling `run` again is
  /// a no-op rather than an error.
  pub async fn run(&mut self) -> Result<(), CoordinationError> {
    for source in self.config.sources.clone() {
      if !self.relays.contains_key(&source) {
        let relay = SourceRelay::start(
          EntityKind::Router,
          self.store.clone(),
          &self.queues,
          &source,
          self.config.consumer.clone(),
        )
        .await?;
        self.relays.insert(source.clone(), relay);
      }
      let relay = &self.relays[&source];

      for target in self.config.targets.clone() {
        if !self.started.insert((source.clone(), target.clone())) {
          debug!(%source, %target, "route already running, ignoring");
          continue;
        }
        let group = format!("{source}:{target}");
        relay.consumer.consume(
          group,
          forward_handler(
            self.queues.queue(&target),
            true,
            self.config.opts_override.clone(),
          ),
        );
      }
    }
    Ok(())
  }

  /// Stops every bridge and consume loop.
  pub async fn close(&mut self) {
    for (_, relay) in self.relays.drain() {
      relay.close().await;
    }
  }
}
