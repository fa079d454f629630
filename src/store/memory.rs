//! In-process store backend.
//!
//! Implements the full [`Store`](super::Store) seam on top of plain maps and
//! vectors behind one mutex. Consumer-group bookkeeping (cursor plus pending
//! list) follows the same model as the Redis backend, with one deliberate
//! difference: a pending read returns the *group's* unacknowledged entries
//! regardless of which consumer they were last claimed by, re-claiming them
//! for the reader. That makes recovery observable in a single process.
//!
//! Key expiry is lazy: expired keys are dropped when next touched.

use crate::error::StoreError;
use crate::message::{EntryId, StreamEntry, now_ms};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use super::{KvStore, ReadPosition, StreamStore};

#[derive(Debug, Default)]
struct MemStream {
  entries: Vec<StreamEntry>,
  groups: HashMap<String, MemGroup>,
  last_id: Option<EntryId>,
}

#[derive(Debug, Default)]
struct MemGroup {
  cursor: Option<EntryId>,
  pending: BTreeMap<EntryId, PendingClaim>,
}

/// Delivery bookkeeping for one pending entry, per the group's PEL.
#[derive(Debug)]
#[allow(dead_code)]
struct PendingClaim {
  consumer: String,
  delivered_at: u64,
}

#[derive(Debug)]
enum KvValue {
  Str(String),
  List(Vec<String>),
}

#[derive(Debug)]
struct KvEntry {
  value: KvValue,
  expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
  streams: HashMap<String, MemStream>,
  kv: HashMap<String, KvEntry>,
}

impl Inner {
  /// Fetches a live kv entry, dropping it first if its ttl has passed.
  fn kv_live(&mut self, key: &str) -> Option<&mut KvEntry> {
    let expired = match self.kv.get(key) {
      Some(e) => e.expires_at.is_some_and(|at| at <= now_ms()),
      None => return None,
    };
    if expired {
      self.kv.remove(key);
      return None;
    }
    self.kv.get_mut(key)
  }
}

/// Single-process [`Store`](super::Store) backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  /// Creates an empty store.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an entry with an explicit timestamp, for backfilling streams
  /// in tests. Ids must still arrive in ascending order.
  pub(crate) fn append_at(
    &self,
    stream: &str,
    ms: u64,
    data: Bytes,
    opts: Bytes,
  ) -> Result<EntryId, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    let s = inner.streams.entry(stream.to_string()).or_default();
    let id = match s.last_id {
      Some(last) if ms < last.ms => {
        return Err(StoreError::Response(format!(
          "entry id {ms}-* below last id {last}"
        )));
      }
      Some(last) if ms == last.ms => EntryId::new(ms, last.seq + 1),
      _ => EntryId::new(ms, 0),
    };
    s.entries.push(StreamEntry { id, data, opts });
    s.last_id = Some(id);
    Ok(id)
  }
}

#[async_trait]
impl StreamStore for MemoryStore {
  async fn append(&self, stream: &str, data: Bytes, opts: Bytes) -> Result<EntryId, StoreError> {
    self.append_at(stream, now_ms(), data, opts)
  }

  async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    let s = inner.streams.entry(stream.to_string()).or_default();
    if s.groups.contains_key(group) {
      return Err(StoreError::GroupExists(group.to_string()));
    }
    s.groups.insert(group.to_string(), MemGroup::default());
    Ok(())
  }

  async fn read_group(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    position: ReadPosition,
    count: usize,
  ) -> Result<Vec<StreamEntry>, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    let s = inner
      .streams
      .get_mut(stream)
      .ok_or_else(|| StoreError::Response(format!("no such stream: {stream}")))?;
    // Split borrow: the group needs mutation while entries are read.
    let entries = &s.entries;
    let g = s
      .groups
      .get_mut(group)
      .ok_or_else(|| StoreError::Response(format!("no such group: {group}")))?;
    let now = now_ms();

    match position {
      ReadPosition::Pending => {
        let mut out = Vec::new();
        let mut gone = Vec::new();
        for (&id, claim) in g.pending.iter_mut() {
          if out.len() >= count {
            break;
          }
          match entries.iter().find(|e| e.id == id) {
            Some(e) => {
              claim.consumer = consumer.to_string();
              claim.delivered_at = now;
              out.push(e.clone());
            }
            // Trimmed out from under the group; nothing left to deliver.
            None => gone.push(id),
          }
        }
        for id in gone {
          g.pending.remove(&id);
        }
        Ok(out)
      }
      ReadPosition::New => {
        let mut out = Vec::new();
        for e in entries {
          if out.len() >= count {
            break;
          }
          if g.cursor.is_none_or(|c| e.id > c) {
            out.push(e.clone());
          }
        }
        for e in &out {
          g.cursor = Some(e.id);
          g.pending.insert(
            e.id,
            PendingClaim {
              consumer: consumer.to_string(),
              delivered_at: now,
            },
          );
        }
        Ok(out)
      }
    }
  }

  async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    if let Some(s) = inner.streams.get_mut(stream) {
      if let Some(g) = s.groups.get_mut(group) {
        g.pending.remove(&id);
      }
    }
    Ok(())
  }

  async fn range_head(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
    let inner = self.inner.lock().expect("store mutex poisoned");
    Ok(
      inner
        .streams
        .get(stream)
        .map(|s| s.entries.iter().take(count).cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn trim_min_id(&self, stream: &str, min_id: EntryId) -> Result<u64, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    let Some(s) = inner.streams.get_mut(stream) else {
      return Ok(0);
    };
    let before = s.entries.len();
    s.entries.retain(|e| e.id >= min_id);
    Ok((before - s.entries.len()) as u64)
  }

  async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
    let inner = self.inner.lock().expect("store mutex poisoned");
    Ok(inner.streams.get(stream).map_or(0, |s| s.entries.len() as u64))
  }
}

#[async_trait]
impl KvStore for MemoryStore {
  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    inner.kv.insert(
      key.to_string(),
      KvEntry {
        value: KvValue::Str(value.to_string()),
        expires_at: None,
      },
    );
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    match inner.kv_live(key) {
      Some(KvEntry {
        value: KvValue::Str(s),
        ..
      }) => Ok(Some(s.clone())),
      Some(_) => Err(StoreError::Response(format!(
        "wrong value kind at key: {key}"
      ))),
      None => Ok(None),
    }
  }

  async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    if inner.kv_live(key).is_some() {
      return Ok(false);
    }
    inner.kv.insert(
      key.to_string(),
      KvEntry {
        value: KvValue::Str(value.to_string()),
        expires_at: Some(now_ms() + ttl.as_millis() as u64),
      },
    );
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<bool, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    let live = inner.kv_live(key).is_some();
    inner.kv.remove(key);
    Ok(live)
  }

  async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    if let Some(entry) = inner.kv_live(key) {
      match &mut entry.value {
        KvValue::List(items) => {
          items.push(value.to_string());
          return Ok(items.len() as u64);
        }
        KvValue::Str(_) => {
          return Err(StoreError::Response(format!(
            "wrong value kind at key: {key}"
          )));
        }
      }
    }
    inner.kv.insert(
      key.to_string(),
      KvEntry {
        value: KvValue::List(vec![value.to_string()]),
        expires_at: None,
      },
    );
    Ok(1)
  }

  async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    match inner.kv_live(key) {
      Some(KvEntry {
        value: KvValue::List(items),
        ..
      }) => Ok(items.clone()),
      Some(_) => Err(StoreError::Response(format!(
        "wrong value kind at key: {key}"
      ))),
      None => Ok(Vec::new()),
    }
  }

  async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    match inner.kv_live(key) {
      Some(KvEntry {
        value: KvValue::List(items),
        ..
      }) => Ok(items.len() as u64),
      Some(_) => Err(StoreError::Response(format!(
        "wrong value kind at key: {key}"
      ))),
      None => Ok(0),
    }
  }

  async fn expire_ms(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    match inner.kv_live(key) {
      Some(entry) => {
        entry.expires_at = Some(now_ms() + ttl.as_millis() as u64);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn exists(&self, key: &str) -> Result<bool, StoreError> {
    let mut inner = self.inner.lock().expect("store mutex poisoned");
    Ok(inner.kv_live(key).is_some())
  }
}
