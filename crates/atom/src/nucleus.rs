//! Thin adapter over the nucleus (the shared Redis-shaped broker).
//!
//! Holds a bounded pool of connections; every multi-step operation checks
//! one out for its duration and the pool reclaims it on every exit path.
//! Nothing above this module speaks RESP directly.

use crate::config::NucleusConfig;
use crate::messages::EntryId;
use crate::{Error, Result};
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// One stream entry as it comes off the wire: the assigned id plus raw
/// field bytes, keys already text.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: EntryId,
    pub fields: HashMap<String, Vec<u8>>,
}

/// Entries returned for one stream of a multi-stream read.
#[derive(Debug, Clone)]
pub struct StreamEntries {
    pub key: String,
    pub entries: Vec<RawEntry>,
}

#[derive(Clone)]
pub struct Nucleus {
    pool: deadpool_redis::Pool,
}

impl Nucleus {
    /// Connect and verify the nucleus is reachable. Connectivity failure
    /// here is fatal for the element being constructed.
    pub async fn connect(config: &NucleusConfig) -> Result<Self> {
        let mut cfg = deadpool_redis::Config::from_url(&config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        let nucleus = Nucleus { pool };
        let mut conn = nucleus.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Error::Connect)?;
        Ok(nucleus)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    // ---- streams ----

    /// Append one entry, capping the stream at approximately `maxlen`.
    pub async fn stream_add(
        &self,
        key: &str,
        fields: &[(String, Vec<u8>)],
        maxlen: usize,
    ) -> Result<EntryId> {
        let mut conn = self.conn().await?;
        let id: String = conn
            .xadd_maxlen(key, StreamMaxlen::Approx(maxlen), "*", fields)
            .await?;
        id.parse()
    }

    /// Blocking multi-stream tail from the given cursors. An expired block
    /// or an absence of newer entries both come back as an empty vec.
    pub async fn stream_read(
        &self,
        cursors: &[(String, String)],
        count: Option<usize>,
        block: Option<u64>,
    ) -> Result<Vec<StreamEntries>> {
        let keys: Vec<&str> = cursors.iter().map(|(key, _)| key.as_str()).collect();
        let ids: Vec<&str> = cursors.iter().map(|(_, id)| id.as_str()).collect();

        let mut options = StreamReadOptions::default();
        if let Some(count) = count {
            options = options.count(count);
        }
        if let Some(block) = block {
            options = options.block(block as usize);
        }

        let mut conn = self.conn().await?;
        let reply: Option<StreamReadReply> = conn.xread_options(&keys, &ids, &options).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .into_iter()
            .map(|stream| {
                Ok(StreamEntries {
                    key: stream.key,
                    entries: stream
                        .ids
                        .into_iter()
                        .map(raw_entry)
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect()
    }

    /// The `n` most recent entries, newest first.
    pub async fn stream_revrange_n(&self, key: &str, n: usize) -> Result<Vec<RawEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", n).await?;
        reply.ids.into_iter().map(raw_entry).collect()
    }

    pub async fn stream_delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    // ---- keyed values with expiry ----

    /// SET if-absent with millisecond expiry (`ttl_ms == 0` means no
    /// expiry). Returns whether the key was created.
    pub async fn value_create(&self, key: &str, data: &[u8], ttl_ms: u64) -> Result<bool> {
        let mut options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX);
        if ttl_ms > 0 {
            options = options.with_expiration(redis::SetExpiry::PX(ttl_ms));
        }
        let mut conn = self.conn().await?;
        let reply: Option<String> = conn.set_options(key, data, options).await?;
        Ok(reply.is_some())
    }

    /// Pipelined multi-get; absent keys come back as `None`.
    pub async fn value_multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = conn.mget(keys).await?;
        Ok(values)
    }

    /// Unlink keys, returning how many existed.
    pub async fn value_unlink(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.unlink(keys).await?;
        Ok(removed)
    }

    /// Returns false when the key does not exist.
    pub async fn value_expire_ms(&self, key: &str, ttl_ms: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let set: bool = conn.pexpire(key, ttl_ms).await?;
        Ok(set)
    }

    /// Drop any expiry. Returns false when the key does not exist.
    pub async fn value_persist(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let persisted: bool = conn.persist(key).await?;
        Ok(persisted)
    }

    /// Remaining ms; −1 for no expiry, −2 for a missing key.
    pub async fn value_ttl_ms(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn.pttl(key).await?;
        Ok(ttl)
    }

    // ---- sorted collections ----

    /// Insert a member keyed by score and return the post-insert size.
    /// The add and the size read run as one atomic pipeline.
    pub async fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let (_added, size): (i64, u64) = redis::pipe()
            .atomic()
            .zadd(key, member, score)
            .zcard(key)
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }

    /// Pop the min (or max) scored member.
    pub async fn sorted_pop(&self, key: &str, max: bool) -> Result<Option<(Vec<u8>, f64)>> {
        let mut conn = self.conn().await?;
        let mut popped: Vec<(Vec<u8>, f64)> = if max {
            conn.zpopmax(key, 1).await?
        } else {
            conn.zpopmin(key, 1).await?
        };
        Ok(popped.pop())
    }

    /// Blocking pop; a zero timeout blocks indefinitely.
    pub async fn sorted_pop_blocking(
        &self,
        key: &str,
        max: bool,
        timeout: Duration,
    ) -> Result<Option<(Vec<u8>, f64)>> {
        let mut conn = self.conn().await?;
        let reply: Option<(String, Vec<u8>, f64)> = if max {
            conn.bzpopmax(key, timeout.as_secs_f64()).await?
        } else {
            conn.bzpopmin(key, timeout.as_secs_f64()).await?
        };
        Ok(reply.map(|(_key, member, score)| (member, score)))
    }

    /// Pop up to `n` members from the min (or max) end atomically.
    pub async fn sorted_pop_n(
        &self,
        key: &str,
        max: bool,
        n: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let popped: Vec<(Vec<u8>, f64)> = if max {
            conn.zpopmax(key, n as isize).await?
        } else {
            conn.zpopmin(key, n as isize).await?
        };
        Ok(popped)
    }

    /// Read up to `n` members in score order without consuming them.
    pub async fn sorted_peek_n(
        &self,
        key: &str,
        max: bool,
        n: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let stop = (n - 1) as isize;
        let mut conn = self.conn().await?;
        let members: Vec<(Vec<u8>, f64)> = if max {
            conn.zrevrange_withscores(key, 0, stop).await?
        } else {
            conn.zrange_withscores(key, 0, stop).await?
        };
        Ok(members)
    }

    pub async fn sorted_size(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let size: u64 = conn.zcard(key).await?;
        Ok(size)
    }

    pub async fn sorted_delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    // ---- scripting & misc ----

    /// Load a server-side script, returning its SHA for later invocation.
    pub async fn script_load(&self, source: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    pub async fn script_invoke(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<redis::Value> {
        let mut conn = self.conn().await?;
        let value: redis::Value = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Nucleus wall-clock time as (seconds, microseconds).
    pub async fn time(&self) -> Result<(u64, u64)> {
        let mut conn = self.conn().await?;
        let time: (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(time)
    }

    /// The nucleus's current time as a millisecond stream cursor.
    pub async fn timestamp_ms(&self) -> Result<String> {
        let (secs, micros) = self.time().await?;
        Ok(ms_timestamp(secs, micros))
    }

    /// Key discovery for element and stream introspection.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}

fn ms_timestamp(secs: u64, micros: u64) -> String {
    (secs * 1000 + micros / 1000).to_string()
}

fn raw_entry(entry: redis::streams::StreamId) -> Result<RawEntry> {
    let id: EntryId = entry.id.parse()?;
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (key, value) in entry.map {
        let bytes: Vec<u8> = redis::from_redis_value(&value)?;
        fields.insert(key, bytes);
    }
    Ok(RawEntry { id, fields })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ms_timestamp_concatenates_millis() {
        assert_eq!(ms_timestamp(1526919030, 474123), "1526919030474");
        assert_eq!(ms_timestamp(1, 999), "1000");
    }

    #[test]
    fn raw_entry_converts_ids_and_bytes() {
        let mut map = HashMap::new();
        map.insert(
            "data".to_string(),
            redis::Value::BulkString(b"payload".to_vec()),
        );
        let entry = raw_entry(redis::streams::StreamId {
            id: "42-7".to_string(),
            map,
        })
        .unwrap();

        assert_eq!(entry.id, EntryId { ms: 42, seq: 7 });
        assert_eq!(entry.fields["data"], b"payload");
    }
}
