//! Single-source replication with a caller-chosen group prefix.

use super::{OptsOverrideFn, SourceRelay, forward_handler};
use crate::consumer::ConsumerOptions;
use crate::error::CoordinationError;
use crate::keys::EntityKind;
use crate::queue::QueueFactory;
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Configuration for a [`Fanout`], assembled before construction.
#[derive(Clone)]
pub struct FanoutConfig {
  /// Source queue name.
  pub source: String,
  /// Consumer-group prefix; defaults to the source name. Distinct prefixes
  /// over the same source give each subscriber set its own replay cursor.
  pub group: Option<String>,
  /// Target queue names.
  pub targets: Vec<String>,
  /// Tuning for the consume loops.
  pub consumer: ConsumerOptions,
  /// Optional per-payload option function; fanout applies only these,
  /// source job options are not carried over.
  pub opts_override: Option<OptsOverrideFn>,
}

impl FanoutConfig {
  /// Configuration with the given source and no targets yet.
  #[must_use]
  pub fn new(source: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      group: None,
      targets: Vec::new(),
      consumer: ConsumerOptions::default(),
      opts_override: None,
    }
  }

  /// Sets the group prefix.
  #[must_use]
  pub fn with_group(mut self, group: impl Into<String>) -> Self {
    self.group = Some(group.into());
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

  /// Sets the option function applied to forwarded entries.
  #[must_use]
  pub fn with_opts_override(mut self, opts_override: OptsOverrideFn) -> Self {
    self.opts_override = Some(opts_override);
    self
  }
}

/// Replicates one source queue to each configured target.
pub struct Fanout {
  store: Arc<dyn Store>,
  queues: Arc<dyn QueueFactory>,
  config: FanoutConfig,
  relay: Option<SourceRelay>,
  started: HashSet<String>,
}

impl Fanout {
  /// Creates a fanout from its immutable configuration.
  #[must_use]
  pub fn new(
    store: Arc<dyn Store>,
    queues: Arc<dyn QueueFactory>,
    config: FanoutConfig,
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
          EntityKind::Fanout,
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
    let prefix = self
      .config
      .group
      .clone()
      .unwrap_or_else(|| self.config.source.clone());

    for target in self.config.targets.clone() {
      if !self.started.insert(target.clone()) {
        debug!(source = %self.config.source, %target, "fanout target already running, ignoring");
        continue;
      }
      let group = format!("{prefix}:{target}");
      relay.consumer.consume(
        group,
        forward_handler(
          self.queues.queue(&target),
          false,
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
