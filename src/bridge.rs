//! Bridging a job queue into a log stream.
//!
//! A job queue delivers each item to exactly one worker, which is the wrong
//! shape for 1→N distribution. [`QueueToStreamBridge`] attaches one worker
//! to the source queue and appends every job to a log stream, one entry per
//! item, options preserved, after which any number of independent consumer
//! groups can replay the stream.

use crate::error::QueueError;
use crate::producer::StreamProducer;
use crate::queue::{JobHandler, JobQueue, WorkerHandle};
use std::sync::Arc;
use tracing::debug;

/// Worker that copies a job queue into a log stream.
pub struct QueueToStreamBridge {
  worker: WorkerHandle,
}

impl QueueToStreamBridge {
  /// Starts bridging `source` into `producer`'s stream.
  ///
  /// A job is acknowledged to the queue only once its entry is appended; a
  /// failed append falls back on the queue's retry policy.
  pub async fn start(
    source: &Arc<dyn JobQueue>,
    producer: StreamProducer,
  ) -> Result<Self, QueueError> {
    let stream = producer.stream_name().to_string();
    let source_name = source.name().to_string();
    let producer = Arc::new(producer);
    let handler: JobHandler = Arc::new(move |job| {
      let producer = producer.clone();
      Box::pin(async move {
        producer.produce(&job.payload, &job.opts).await?;
        Ok(())
      })
    });
    let worker = source.process(handler).await?;
    debug!(source = %source_name, stream = %stream, "bridge started");
    Ok(Self { worker })
  }

  /// Stops the bridge worker.
  pub async fn close(self) {
    self.worker.close().await;
  }
}
