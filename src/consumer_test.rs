use crate::consumer::{ConsumerOptions, EntryHandler, GroupConsumer};
use crate::message::{JobOptions, now_ms};
use crate::producer::StreamProducer;
use crate::store::{MemoryStore, ReadPosition, StreamStore};
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_options() -> ConsumerOptions {
  ConsumerOptions::default()
    .with_batch_size(4)
    .with_block_time(Duration::from_millis(20))
}

fn collector(seen: Arc<Mutex<Vec<Value>>>) -> EntryHandler {
  Arc::new(move |data, _opts| {
    let seen = seen.clone();
    Box::pin(async move {
      seen.lock().unwrap().push(data);
      Ok(())
    })
  })
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
async fn delivers_preexisting_entries_in_order_and_acks() {
  let store = Arc::new(MemoryStore::new());
  let producer = StreamProducer::new(store.clone(), "s");
  for n in 0..5 {
    producer.produce(&json!({ "n": n }), &JobOptions::default()).await.unwrap();
  }

  let consumer = GroupConsumer::new(store.clone(), "s", fast_options());
  let seen = Arc::new(Mutex::new(Vec::new()));
  consumer.consume("g", collector(seen.clone()));

  wait_for(|| seen.lock().unwrap().len() == 5, "5 entries").await;
  let seen = seen.lock().unwrap().clone();
  assert_eq!(
    seen,
    (0..5).map(|n| json!({ "n": n })).collect::<Vec<_>>()
  );
  consumer.close().await;

  let pending = store
    .read_group("s", "g", "probe", ReadPosition::Pending, 10)
    .await
    .unwrap();
  assert!(pending.is_empty(), "delivered entries must be acknowledged");
}

#[tokio::test]
async fn each_group_gets_its_own_copy() {
  let store = Arc::new(MemoryStore::new());
  let producer = StreamProducer::new(store.clone(), "s");
  for n in 0..3 {
    producer.produce(&json!(n), &JobOptions::default()).await.unwrap();
  }

  let consumer = GroupConsumer::new(store.clone(), "s", fast_options());
  let left = Arc::new(Mutex::new(Vec::new()));
  let right = Arc::new(Mutex::new(Vec::new()));
  consumer.consume("left", collector(left.clone()));
  consumer.consume("right", collector(right.clone()));

  wait_for(
    || left.lock().unwrap().len() == 3 && right.lock().unwrap().len() == 3,
    "both groups",
  )
  .await;
  consumer.close().await;
}

#[tokio::test]
async fn failed_entries_stay_pending_and_are_retried() {
  let store = Arc::new(MemoryStore::new());
  let producer = StreamProducer::new(store.clone(), "s");
  producer.produce(&json!({ "n": 1 }), &JobOptions::default()).await.unwrap();

  let attempts = Arc::new(AtomicUsize::new(0));
  let seen = Arc::new(Mutex::new(Vec::new()));
  let handler: EntryHandler = {
    let attempts = attempts.clone();
    let seen = seen.clone();
    Arc::new(move |data, _opts| {
      let attempts = attempts.clone();
      let seen = seen.clone();
      Box::pin(async move {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
          return Err("first delivery fails".into());
        }
        seen.lock().unwrap().push(data);
        Ok(())
      })
    })
  };

  let consumer = GroupConsumer::new(store.clone(), "s", fast_options());
  let mut errors = consumer.errors().expect("error channel");
  consumer.consume("g", handler);

  wait_for(|| seen.lock().unwrap().len() == 1, "retried entry").await;
  assert!(attempts.load(Ordering::SeqCst) >= 2);
  assert!(errors.try_recv().is_ok(), "failure surfaced on the channel");
  consumer.close().await;
}

#[tokio::test]
async fn stale_pending_entries_are_evicted_without_the_handler() {
  let store = Arc::new(MemoryStore::new());
  let producer = StreamProducer::new(store.clone(), "s");
  producer.produce(&json!({ "n": 1 }), &JobOptions::default()).await.unwrap();

  let attempts = Arc::new(AtomicUsize::new(0));
  let handler: EntryHandler = {
    let attempts = attempts.clone();
    Arc::new(move |_data, _opts| {
      let attempts = attempts.clone();
      Box::pin(async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err("never succeeds".into())
      })
    })
  };

  // The entry is fresh, so it survives the initial trim; it then fails
  // repeatedly until it ages past the short retention window, at which
  // point the pending phase must acknowledge it without the handler.
  let opts = fast_options()
    .with_max_retention(Duration::from_millis(300))
    .with_trim_interval(Duration::from_secs(3600));
  let consumer = GroupConsumer::new(store.clone(), "s", opts);
  consumer.consume("g", handler);

  wait_for(|| attempts.load(Ordering::SeqCst) >= 1, "first delivery").await;
  let mut evicted = false;
  for _ in 0..250 {
    let pending = store
      .read_group("s", "g", "probe", ReadPosition::Pending, 10)
      .await
      .unwrap();
    if pending.is_empty() {
      evicted = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  assert!(evicted, "stale entry was never evicted");

  // Once evicted, the retries stop for good.
  let after_eviction = attempts.load(Ordering::SeqCst);
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(attempts.load(Ordering::SeqCst), after_eviction);
  consumer.close().await;
}

#[tokio::test]
async fn stream_length_converges_to_the_retention_window() {
  let store = Arc::new(MemoryStore::new());
  let base = now_ms() - 30_000;
  for n in 0..3 {
    store
      .append_at("s", base + n, Bytes::from(format!("{{\"n\":{n}}}")), Bytes::new())
      .unwrap();
  }
  let producer = StreamProducer::new(store.clone(), "s");
  for n in 0..2 {
    producer.produce(&json!({ "fresh": n }), &JobOptions::default()).await.unwrap();
  }

  let opts = fast_options()
    .with_max_retention(Duration::from_secs(5))
    .with_trim_interval(Duration::from_millis(10));
  let consumer = GroupConsumer::new(store.clone(), "s", opts);
  let seen = Arc::new(Mutex::new(Vec::new()));
  consumer.consume("g", collector(seen.clone()));

  let mut trimmed = false;
  for _ in 0..250 {
    if consumer.len().await.unwrap() == 2 {
      trimmed = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  assert!(trimmed, "stream never converged to the retention window");
  consumer.close().await;
}

#[tokio::test]
async fn close_stops_all_loops() {
  let store = Arc::new(MemoryStore::new());
  let consumer = GroupConsumer::new(store, "s", fast_options());
  let seen = Arc::new(Mutex::new(Vec::new()));
  consumer.consume("a", collector(seen.clone()));
  consumer.consume("b", collector(seen));

  tokio::time::timeout(Duration::from_secs(2), consumer.close())
    .await
    .expect("close must resolve");
}
