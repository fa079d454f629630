//! Single-source, many-target replication.

use super::{OptsOverrideFn, SourceRelay, forward_handler};
use crate::consumer::ConsumerOptions;
use crate::error::CoordinationError;
use crate::keys::EntityKind;
use crate::queue::QueueFactory;
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Configuration for a [`Pubsub`], assembled before construction.
#[derive(Clone)]
pub struct PubsubConfig {
  /// Source queue name.
  pub source: String,
  /// Target queue names; each receives a full copy of the source.
  pub targets: Vec<String>,
  /// Tuning for the consume loops.
  pub consumer: ConsumerOptions,
  /// Optional per-payload option override; wins over source job options.
  pub opts_override: Option<OptsOverrideFn>,
}

impl PubsubConfig {
  /// Configuration with the given source and no targets yet.
  #[must_use]
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      targets: Vec::new(),
      consumer: ConsumerOptions::default(),
      opts_override: None,
    }
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

/// Publishes one source queue to every configured target.
pub struct Pubsub {
  store: Arc<dyn Store>,
  queues: Arc<dyn QueueFactory>,
  config: PubsubConfig,
  relay: Option<SourceRelay>,
  started: HashSet<String>,
}

impl Pubsub {
  /// Creates a pubsub from its immutable configuration.
  #[must_use]
  pub fn new(
    store: Arc<dyn Store>,
    queues: Arc<dyn QueueFactory>,
    config: PubsubConfig,
  ) -> Self {
    Self {
      store,
      queues,
      config,
      relay: None,
      started: HashSet::new(),
    }
  }

  /// Starts the bridge and one consume loop per target. Targets that are
  /// already running are skipped.
  pub async fn run(&mut self) -> Result<(), CoordinationError> {
    if self.relay.is_none() {
      self.relay = Some(
        SourceRelay::start(
          EntityKind::Pubsub,
          self.store.clone(),
          &self.queues,
          &self.config.source,
          self.config.consumer.clone(),
        )
        .await?,
      );
    }
    let Some(relay) = self.relay.as_ref() else {
      return Ok(());
    };

    for target in self.config.targets.clone() {
      if !self.started.insert(target.clone()) {
        debug!(source = %self.config.source, %target, "pubsub target already running, ignoring");
        continue;
      }
      let group = format!("{}:{}", self.config.source, target);
      relay.consumer.consume(
        group,
        forward_handler(
          self.queues.queue(&target),
          true,
          self.config.opts_override.clone(),
        ),
      );
    }
    Ok(())
  }

  /// Stops the bridge and every consume loop.
  pub async fn close(&mut self) {
    if let Some(relay) = self.relay.take() {
      relay.close().await;
    }
  }
}
