//! Redis-backed store.
//!
//! Each trait method maps onto one stream or key command; entry payloads are
//! carried as the `data`/`opts` fields of a stream entry. Reads go through a
//! cloned [`ConnectionManager`], which multiplexes and reconnects on its
//! own; any command failure surfaces as
//! [`StoreError::Transient`](crate::error::StoreError::Transient) and the
//! owning loop retries.
//!
//! One semantic note: a [`ReadPosition::Pending`] read returns the calling
//! consumer's own pending entries (the server scopes the pending list per
//! consumer). In-process retry after a handler failure relies on the
//! consumer name staying stable for the lifetime of a consume loop, which
//! [`GroupConsumer`](crate::consumer::GroupConsumer) guarantees.

use crate::error::StoreError;
use crate::message::{EntryId, StreamEntry};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use std::time::Duration;

use super::{KvStore, ReadPosition, StreamStore};

/// [`Store`](super::Store) backend over a Redis-compatible server.
#[derive(Clone)]
pub struct RedisStore {
  conn: ConnectionManager,
}

impl RedisStore {
  /// Connects to the server at `url` (e.g. `redis://localhost:6379`).
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let client = redis::Client::open(url).map_err(StoreError::from)?;
    let conn = client.get_connection_manager().await?;
    Ok(Self { conn })
  }

  /// Wraps an already-established connection.
  #[must_use]
  pub fn with_connection(conn: ConnectionManager) -> Self {
    Self { conn }
  }

  fn parse_id(id: &str) -> Result<EntryId, StoreError> {
    id.parse()
      .map_err(|e: crate::message::ParseEntryIdError| StoreError::Response(e.to_string()))
  }

  fn entry_from(sid: &StreamId) -> Result<StreamEntry, StoreError> {
    Ok(StreamEntry {
      id: Self::parse_id(&sid.id)?,
      data: Self::field_bytes(sid, "data"),
      opts: Self::field_bytes(sid, "opts"),
    })
  }

  fn field_bytes(sid: &StreamId, field: &str) -> Bytes {
    match sid.map.get(field) {
      Some(redis::Value::Data(raw)) => Bytes::from(raw.clone()),
      _ => Bytes::new(),
    }
  }
}

#[async_trait]
impl StreamStore for RedisStore {
  async fn append(&self, stream: &str, data: Bytes, opts: Bytes) -> Result<EntryId, StoreError> {
    let mut conn = self.conn.clone();
    let id: String = redis::cmd("XADD")
      .arg(stream)
      .arg("*")
      .arg("data")
      .arg(data.as_ref())
      .arg("opts")
      .arg(opts.as_ref())
      .query_async(&mut conn)
      .await?;
    Self::parse_id(&id)
  }

  async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
    let mut conn = self.conn.clone();
    // MKSTREAM so a group can be parked on a stream nobody produced to yet.
    let _: () = redis::cmd("XGROUP")
      .arg("CREATE")
      .arg(stream)
      .arg(group)
      .arg("0")
      .arg("MKSTREAM")
      .query_async(&mut conn)
      .await?;
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
    let mut conn = self.conn.clone();
    let position = match position {
      ReadPosition::Pending => "0",
      ReadPosition::New => ">",
    };
    let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
      .arg("GROUP")
      .arg(group)
      .arg(consumer)
      .arg("COUNT")
      .arg(count)
      .arg("STREAMS")
      .arg(stream)
      .arg(position)
      .query_async(&mut conn)
      .await?;

    let mut out = Vec::new();
    if let Some(reply) = reply {
      for key in &reply.keys {
        for sid in &key.ids {
          out.push(Self::entry_from(sid)?);
        }
      }
    }
    Ok(out)
  }

  async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError> {
    let mut conn = self.conn.clone();
    let _: i64 = redis::cmd("XACK")
      .arg(stream)
      .arg(group)
      .arg(id.to_string())
      .query_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn range_head(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
    let mut conn = self.conn.clone();
    let reply: StreamRangeReply = redis::cmd("XRANGE")
      .arg(stream)
      .arg("-")
      .arg("+")
      .arg("COUNT")
      .arg(count)
      .query_async(&mut conn)
      .await?;
    reply.ids.iter().map(Self::entry_from).collect()
  }

  async fn trim_min_id(&self, stream: &str, min_id: EntryId) -> Result<u64, StoreError> {
    let mut conn = self.conn.clone();
    let dropped: u64 = redis::cmd("XTRIM")
      .arg(stream)
      .arg("MINID")
      .arg(min_id.to_string())
      .query_async(&mut conn)
      .await?;
    Ok(dropped)
  }

  async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
    let mut conn = self.conn.clone();
    let len: u64 = redis::cmd("XLEN")
      .arg(stream)
      .query_async(&mut conn)
      .await?;
    Ok(len)
  }
}

#[async_trait]
impl KvStore for RedisStore {
  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let mut conn = self.conn.clone();
    let _: () = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .query_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let mut conn = self.conn.clone();
    let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
    Ok(value)
  }

  async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
    let mut conn = self.conn.clone();
    let reply: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("NX")
      .arg("PX")
      .arg(ttl.as_millis() as u64)
      .query_async(&mut conn)
      .await?;
    Ok(reply.is_some())
  }

  async fn delete(&self, key: &str) -> Result<bool, StoreError> {
    let mut conn = self.conn.clone();
    let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
    Ok(removed > 0)
  }

  async fn list_push(&self, key: &str, value: &str) -> Result<u64, StoreError> {
    let mut conn = self.conn.clone();
    let len: u64 = redis::cmd("RPUSH")
      .arg(key)
      .arg(value)
      .query_async(&mut conn)
      .await?;
    Ok(len)
  }

  async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
    let mut conn = self.conn.clone();
    let items: Vec<String> = redis::cmd("LRANGE")
      .arg(key)
      .arg(0)
      .arg(-1)
      .query_async(&mut conn)
      .await?;
    Ok(items)
  }

  async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
    let mut conn = self.conn.clone();
    let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
    Ok(len)
  }

  async fn expire_ms(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
    let mut conn = self.conn.clone();
    let set: i64 = redis::cmd("PEXPIRE")
      .arg(key)
      .arg(ttl.as_millis() as u64)
      .query_async(&mut conn)
      .await?;
    Ok(set == 1)
  }

  async fn exists(&self, key: &str) -> Result<bool, StoreError> {
    let mut conn = self.conn.clone();
    let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
    Ok(found > 0)
  }
}
