//! End-to-end runs of the coordination engines over the in-process
//! backends, exercising only the public API.

use queueweave::accumulation::{Accumulation, AccumulationConfig, AccumulationSource};
use queueweave::join::{Join, JoinConfig, JoinSource, SourceSlot};
use queueweave::message::JobOptions;
use queueweave::queue::{JobHandler, JobQueue, MemoryQueueFactory, QueueFactory, WorkerHandle};
use queueweave::store::MemoryStore;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().try_init();
}

async fn collect(queue: &Arc<dyn JobQueue>, into: Arc<Mutex<Vec<Value>>>) -> WorkerHandle {
  let handler: JobHandler = Arc::new(move |job| {
    let into = into.clone();
    Box::pin(async move {
      into.lock().unwrap().push(job.payload);
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

#[tokio::test]
async fn accumulation_aggregates_a_burst_into_one_result() {
  init_tracing();
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let source = AccumulationSource::new(
    "measurements",
    Arc::new(|data: &Value| data["sensor"].as_str().map(String::from)),
  );
  let config = AccumulationConfig::new(
    "sensor-windows",
    source,
    Arc::new(|items: &[Value]| {
      let sum: i64 = items.iter().filter_map(|item| item["value"].as_i64()).sum();
      json!({ "sum": sum, "count": items.len() })
    }),
  )
  .with_timeout(Duration::from_secs(10))
  .with_is_complete(Arc::new(|items: &[Value]| items.len() == 10))
  .with_target("windows");

  let mut accumulation = Accumulation::new(store, queues.clone(), config);
  accumulation.run().await.unwrap();

  let results = Arc::new(Mutex::new(Vec::new()));
  let collector = collect(&queues.queue("windows"), results.clone()).await;

  let measurements = queues.queue("measurements");
  for value in 1..=10 {
    measurements
      .enqueue(json!({ "sensor": "s1", "value": value }), JobOptions::default())
      .await
      .unwrap();
  }

  wait_for(|| !results.lock().unwrap().is_empty(), "aggregated window").await;
  assert_eq!(
    results.lock().unwrap().clone(),
    vec![json!({ "sum": 55, "count": 10 })]
  );

  accumulation.close().await;
  collector.close().await;
}

#[tokio::test]
async fn join_correlates_two_queues_per_key() {
  init_tracing();
  let store = Arc::new(MemoryStore::new());
  let queues = MemoryQueueFactory::new();

  let key_fn = || Arc::new(|data: &Value| data["order"].as_str().map(String::from));
  let config = JoinConfig::new(
    "order-legs",
    vec![
      JoinSource::new("payments", key_fn()),
      JoinSource::new("shipments", key_fn()),
    ],
    "fulfilled",
    Arc::new(|slots: &[SourceSlot]| {
      let total: i64 = slots.iter().filter_map(|slot| slot.value["amount"].as_i64()).sum();
      json!({ "total": total })
    }),
  )
  .with_timeout(Duration::from_secs(10));

  let mut join = Join::new(store, queues.clone(), config);
  join.run().await.unwrap();

  let results = Arc::new(Mutex::new(Vec::new()));
  let collector = collect(&queues.queue("fulfilled"), results.clone()).await;

  let payments = queues.queue("payments");
  let shipments = queues.queue("shipments");
  for order in 1..=5 {
    payments
      .enqueue(
        json!({ "order": order.to_string(), "amount": order * 10 }),
        JobOptions::default(),
      )
      .await
      .unwrap();
    shipments
      .enqueue(
        json!({ "order": order.to_string(), "amount": 1 }),
        JobOptions::default(),
      )
      .await
      .unwrap();
  }

  wait_for(|| results.lock().unwrap().len() == 5, "5 correlated orders").await;
  let totals: BTreeSet<i64> = results
    .lock()
    .unwrap()
    .iter()
    .filter_map(|r| r["total"].as_i64())
    .collect();
  assert_eq!(totals, (1..=5).map(|o| o * 10 + 1).collect::<BTreeSet<_>>());

  join.close().await;
  collector.close().await;
}
