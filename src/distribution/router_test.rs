use super::{Fanout, FanoutConfig, Pubsub, PubsubConfig, Router, RouterConfig};
use crate::consumer::ConsumerOptions;
use crate::message::{Job, JobOptions};
use crate::queue::{JobHandler, JobQueue, MemoryQueueFactory, QueueFactory, WorkerHandle};
use crate::store::MemoryStore;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_consumer() -> ConsumerOptions {
  ConsumerOptions::default()
    .with_batch_size(8)
    .with_block_time(Duration::from_millis(20))
}

async fn collect_jobs(queue: &Arc<dyn JobQueue>, into: Arc<Mutex<Vec<Job>>>) -> WorkerHandle {
  let handler: JobHandler = Arc::new(move |job| {
    let into = into.clone();
    Box::pin(async move {
      into.lock().unwrap().push(job);
      Ok(())
    })
  });
  queue.process(handler).await.unwrap()
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
  for _ in 0..250 {
    if cond() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("timed out waiting for {what}");
}

fn payloads(jobs: &[Job]) -> Vec<Value> {
  jobs.iter().map(|job| job.payload.clone()).collect()
}

#[tokio::test]
async fn every_target_gets_a_full_ordered_copy_including_prestart_entries() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  // Produced before the router exists; replay must still cover them.
  let source = queues.queue("src");
  for n in 0..3 {
    source.enqueue(json!({ "n": n }), JobOptions::default()).await.unwrap();
  }

  let t1 = Arc::new(Mutex::new(Vec::new()));
  let t2 = Arc::new(Mutex::new(Vec::new()));
  let c1 = collect_jobs(&queues.queue("t1"), t1.clone()).await;
  let c2 = collect_jobs(&queues.queue("t2"), t2.clone()).await;

  let config = RouterConfig::new()
    .with_sources(["src"])
    .with_targets(["t1", "t2"])
    .with_consumer_options(fast_consumer());
  let mut router = Router::new(store.clone(), queues.clone(), config);
  router.run().await.unwrap();

  wait_for(
    || t1.lock().unwrap().len() == 3 && t2.lock().unwrap().len() == 3,
    "both targets caught up",
  )
  .await;
  let expected: Vec<Value> = (0..3).map(|n| json!({ "n": n })).collect();
  assert_eq!(payloads(&t1.lock().unwrap()), expected);
  assert_eq!(payloads(&t2.lock().unwrap()), expected);

  router.close().await;
  c1.close().await;
  c2.close().await;
}

#[tokio::test]
async fn acknowledged_entries_are_not_redelivered_after_a_restart() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let collector = collect_jobs(&queues.queue("t"), seen.clone()).await;

  let config = RouterConfig::new()
    .with_sources(["src"])
    .with_targets(["t"])
    .with_consumer_options(fast_consumer());
  let mut router = Router::new(store.clone(), queues.clone(), config.clone());
  router.run().await.unwrap();

  let source = queues.queue("src");
  for n in 0..2 {
    source.enqueue(json!({ "n": n }), JobOptions::default()).await.unwrap();
  }
  wait_for(|| seen.lock().unwrap().len() == 2, "first batch").await;
  router.close().await;

  // A new router over the same store resumes the same consumer groups.
  let mut restarted = Router::new(store, queues.clone(), config);
  restarted.run().await.unwrap();
  source.enqueue(json!({ "n": 2 }), JobOptions::default()).await.unwrap();

  wait_for(|| seen.lock().unwrap().len() == 3, "entry after restart").await;
  tokio::time::sleep(Duration::from_millis(300)).await;
  let seen = seen.lock().unwrap().clone();
  assert_eq!(
    payloads(&seen),
    (0..3).map(|n| json!({ "n": n })).collect::<Vec<_>>(),
    "no duplicates, no gaps"
  );

  restarted.close().await;
  collector.close().await;
}

#[tokio::test]
async fn running_a_pair_twice_is_a_no_op() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let collector = collect_jobs(&queues.queue("t"), seen.clone()).await;

  let config = RouterConfig::new()
    .with_sources(["src"])
    .with_targets(["t"])
    .with_consumer_options(fast_consumer());
  let mut router = Router::new(store, queues.clone(), config);
  router.run().await.unwrap();
  router.run().await.unwrap();

  queues
    .queue("src")
    .enqueue(json!({ "n": 1 }), JobOptions::default())
    .await
    .unwrap();
  wait_for(|| !seen.lock().unwrap().is_empty(), "forwarded entry").await;
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(seen.lock().unwrap().len(), 1, "one copy despite the double start");

  router.close().await;
  collector.close().await;
}

#[tokio::test]
async fn router_merges_source_options_with_the_override_winning() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let collector = collect_jobs(&queues.queue("t"), seen.clone()).await;

  let config = RouterConfig::new()
    .with_sources(["src"])
    .with_targets(["t"])
    .with_consumer_options(fast_consumer())
    .with_opts_override(Arc::new(|data| {
      JobOptions::default().with_priority(data["urgent"].as_i64().unwrap_or(5))
    }));
  let mut router = Router::new(store, queues.clone(), config);
  router.run().await.unwrap();

  queues
    .queue("src")
    .enqueue(
      json!({ "urgent": 9 }),
      JobOptions::default().with_priority(1).with_attempts(4),
    )
    .await
    .unwrap();

  wait_for(|| !seen.lock().unwrap().is_empty(), "forwarded entry").await;
  let job = seen.lock().unwrap()[0].clone();
  assert_eq!(job.opts.priority, Some(9), "override wins the conflict");
  assert_eq!(job.opts.attempts, Some(4), "untouched fields carry over");

  router.close().await;
  collector.close().await;
}

#[tokio::test]
async fn fanout_applies_only_the_override_options() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let collector = collect_jobs(&queues.queue("t"), seen.clone()).await;

  let config = FanoutConfig::new("src")
    .with_group("copies")
    .with_targets(["t"])
    .with_consumer_options(fast_consumer())
    .with_opts_override(Arc::new(|_data| JobOptions::default().with_attempts(3)));
  let mut fanout = Fanout::new(store, queues.clone(), config);
  fanout.run().await.unwrap();

  queues
    .queue("src")
    .enqueue(json!({ "n": 1 }), JobOptions::default().with_priority(8))
    .await
    .unwrap();

  wait_for(|| !seen.lock().unwrap().is_empty(), "forwarded entry").await;
  let job = seen.lock().unwrap()[0].clone();
  assert_eq!(job.opts.attempts, Some(3));
  assert_eq!(job.opts.priority, None, "source options are not carried");

  fanout.close().await;
  collector.close().await;
}

#[tokio::test]
async fn pubsub_copies_the_source_to_every_target() {
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let t1 = Arc::new(Mutex::new(Vec::new()));
  let t2 = Arc::new(Mutex::new(Vec::new()));
  let c1 = collect_jobs(&queues.queue("t1"), t1.clone()).await;
  let c2 = collect_jobs(&queues.queue("t2"), t2.clone()).await;

  let config = PubsubConfig::new("src")
    .with_targets(["t1", "t2"])
    .with_consumer_options(fast_consumer());
  let mut pubsub = Pubsub::new(store, queues.clone(), config);
  pubsub.run().await.unwrap();

  let source = queues.queue("src");
  for n in 0..2 {
    source.enqueue(json!({ "n": n }), JobOptions::default()).await.unwrap();
  }

  wait_for(
    || t1.lock().unwrap().len() == 2 && t2.lock().unwrap().len() == 2,
    "both targets",
  )
  .await;

  pubsub.close().await;
  c1.close().await;
  c2.close().await;
}
