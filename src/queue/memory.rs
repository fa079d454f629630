//! In-process job-queue backend.
//!
//! A [`MemoryQueue`] keeps ready jobs in a deque behind a mutex; delayed
//! jobs are parked on a timer task and pushed when due. Workers poll the
//! deque and compete for jobs, so attaching several workers to one queue
//! distributes items, it does not copy them.
//!
//! Retry policy: a failing handler consumes one attempt; the job is pushed
//! back until its `attempts` budget (default 1) is spent, then dropped with
//! a warning.

use crate::error::{HandlerError, QueueError};
use crate::message::{Job, JobId, JobOptions};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{JobHandler, JobQueue, QueueFactory, WorkerHandle};

/// How long an idle worker waits before re-checking the deque and its
/// closing flag.
const IDLE_POLL: Duration = Duration::from_millis(20);

struct Inner {
  name: String,
  ready: Mutex<VecDeque<Job>>,
  notify: Notify,
  next_id: AtomicU64,
}

impl Inner {
  fn push_ready(&self, job: Job) {
    self
      .ready
      .lock()
      .expect("queue mutex poisoned")
      .push_back(job);
    self.notify.notify_one();
  }

  async fn pop_ready(&self) -> Option<Job> {
    if let Some(job) = self.ready.lock().expect("queue mutex poisoned").pop_front() {
      return Some(job);
    }
    // Wait for a push, bounded so the worker can notice its closing flag.
    let _ = tokio::time::timeout(IDLE_POLL, self.notify.notified()).await;
    self.ready.lock().expect("queue mutex poisoned").pop_front()
  }

  fn handle_failure(&self, job: Job, error: &HandlerError) {
    let budget = job.opts.attempts.unwrap_or(1);
    if job.attempts_made < budget {
      warn!(
        queue = %self.name,
        job = %job.id,
        attempt = job.attempts_made,
        error = %error,
        "job failed, requeueing"
      );
      self.push_ready(job);
    } else {
      warn!(
        queue = %self.name,
        job = %job.id,
        attempts = job.attempts_made,
        error = %error,
        "job failed, attempts exhausted, dropping"
      );
    }
  }
}

/// Single-process [`JobQueue`] backend. Cloning yields another handle to
/// the same queue.
#[derive(Clone)]
pub struct MemoryQueue {
  inner: Arc<Inner>,
}

impl MemoryQueue {
  /// Creates an empty queue with the given name.
  #[must_use]
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(Inner {
        name: name.into(),
        ready: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  /// Number of jobs currently ready (delayed jobs not included).
  #[must_use]
  pub fn ready_len(&self) -> usize {
    self.inner.ready.lock().expect("queue mutex poisoned").len()
  }
}

#[async_trait]
impl JobQueue for MemoryQueue {
  fn name(&self) -> &str {
    &self.inner.name
  }

  async fn enqueue(&self, payload: serde_json::Value, opts: JobOptions) -> Result<JobId, QueueError> {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
    let job = Job::new(id.clone(), payload, opts.clone());
    match opts.delay {
      Some(delay) if delay > 0 => {
        let inner = self.inner.clone();
        tokio::spawn(async move {
          tokio::time::sleep(Duration::from_millis(delay)).await;
          inner.push_ready(job);
        });
      }
      _ => self.inner.push_ready(job),
    }
    debug!(queue = %self.inner.name, job = %id, "enqueued");
    Ok(id)
  }

  async fn process(&self, handler: JobHandler) -> Result<WorkerHandle, QueueError> {
    let closing = Arc::new(AtomicBool::new(false));
    let flag = closing.clone();
    let inner = self.inner.clone();
    let task = tokio::spawn(async move {
      while !flag.load(Ordering::SeqCst) {
        let Some(mut job) = inner.pop_ready().await else {
          continue;
        };
        job.attempts_made += 1;
        if let Err(e) = (handler)(job.clone()).await {
          inner.handle_failure(job, &e);
        }
      }
    });
    Ok(WorkerHandle::new(closing, task))
  }
}

/// Registry of named in-process queues.
#[derive(Default)]
pub struct MemoryQueueFactory {
  queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl MemoryQueueFactory {
  /// Creates an empty registry.
  #[must_use]
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }
}

impl QueueFactory for MemoryQueueFactory {
  fn queue(&self, name: &str) -> Arc<dyn JobQueue> {
    let mut queues = self.queues.lock().expect("factory mutex poisoned");
    let queue = queues
      .entry(name.to_string())
      .or_insert_with(|| MemoryQueue::new(name))
      .clone();
    Arc::new(queue)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn collector(seen: Arc<Mutex<Vec<serde_json::Value>>>) -> JobHandler {
    Arc::new(move |job| {
      let seen = seen.clone();
      Box::pin(async move {
        seen.lock().unwrap().push(job.payload);
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
  async fn delivers_in_order() {
    let queue = MemoryQueue::new("q");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = queue.process(collector(seen.clone())).await.unwrap();

    for n in 0..5 {
      queue.enqueue(json!(n), JobOptions::default()).await.unwrap();
    }
    wait_for(|| seen.lock().unwrap().len() == 5, "5 jobs").await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
    worker.close().await;
  }

  #[tokio::test]
  async fn delayed_jobs_arrive_after_their_delay() {
    let queue = MemoryQueue::new("q");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = queue.process(collector(seen.clone())).await.unwrap();

    let start = std::time::Instant::now();
    queue
      .enqueue(json!("late"), JobOptions::delayed(Duration::from_millis(150)))
      .await
      .unwrap();
    wait_for(|| !seen.lock().unwrap().is_empty(), "delayed job").await;
    assert!(start.elapsed() >= Duration::from_millis(150));
    worker.close().await;
  }

  #[tokio::test]
  async fn failing_jobs_respect_the_attempt_budget() {
    let queue = MemoryQueue::new("q");
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let handler: JobHandler = Arc::new(move |_job| {
      let seen = seen.clone();
      Box::pin(async move {
        seen.fetch_add(1, Ordering::SeqCst);
        Err::<(), HandlerError>("always fails".into())
      })
    });
    let worker = queue.process(handler).await.unwrap();

    queue
      .enqueue(json!(1), JobOptions::default().with_attempts(3))
      .await
      .unwrap();
    wait_for(|| calls.load(Ordering::SeqCst) == 3, "3 attempts").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(queue.ready_len(), 0);
    worker.close().await;
  }

  #[tokio::test]
  async fn workers_compete_rather_than_copy() {
    let queue = MemoryQueue::new("q");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let w1 = queue.process(collector(seen.clone())).await.unwrap();
    let w2 = queue.process(collector(seen.clone())).await.unwrap();

    for n in 0..10 {
      queue.enqueue(json!(n), JobOptions::default()).await.unwrap();
    }
    wait_for(|| seen.lock().unwrap().len() == 10, "10 jobs").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(seen.lock().unwrap().len(), 10);
    w1.close().await;
    w2.close().await;
  }
}
