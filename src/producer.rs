//! Appending entries to a log stream.

use crate::error::CoordinationError;
use crate::message::{EntryId, JobOptions};
use crate::store::Store;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Appends serialized `{data, opts}` entries to one log stream.
///
/// The store assigns each entry its monotonic timestamp-sequence id; the
/// producer carries no state beyond the store handle and the stream name,
/// so it can be cloned freely and shared across tasks.
#[derive(Clone)]
pub struct StreamProducer {
  store: Arc<dyn Store>,
  stream: String,
}

impl StreamProducer {
  /// Creates a producer for `stream`.
  #[must_use]
  pub fn new(store: Arc<dyn Store>, stream: impl Into<String>) -> Self {
    Self {
      store,
      stream: stream.into(),
    }
  }

  /// The stream this producer appends to.
  #[must_use]
  pub fn stream_name(&self) -> &str {
    &self.stream
  }

  /// Serializes `data` and `opts` and appends them as one entry.
  ///
  /// Returns the id the store assigned.
  pub async fn produce(
    &self,
    data: &serde_json::Value,
    opts: &JobOptions,
  ) -> Result<EntryId, CoordinationError> {
    let data = Bytes::from(serde_json::to_vec(data).map_err(crate::error::StoreError::from)?);
    let opts = Bytes::from(serde_json::to_vec(opts).map_err(crate::error::StoreError::from)?);
    let id = self.store.append(&self.stream, data, opts).await?;
    debug!(stream = %self.stream, id = %id, "produced entry");
    Ok(id)
  }
}
