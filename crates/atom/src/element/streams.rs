//! Stream publish and the three consume shapes: N-most-recent, since-id,
//! and the multiplexed read loop.

use super::Element;
use crate::config::{stream_key, MAX_BLOCK_MS, STREAM_LEN};
use crate::messages::{Entry, EntryId};
use crate::nucleus::RawEntry;
use crate::serialization::{self, Datum, Serialization};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Approximate cap on the stream's length.
    pub maxlen: usize,
    /// Codec applied to each field value before it is written.
    pub serialization: Serialization,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            maxlen: STREAM_LEN,
            serialization: Serialization::None,
        }
    }
}

/// Where a since-read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// From the beginning of the stream.
    Begin,
    /// Only entries arriving after the call; implies blocking.
    Latest,
    /// Strictly after the given id.
    Id(EntryId),
}

impl ReadFrom {
    fn cursor(&self) -> String {
        match self {
            ReadFrom::Begin => "0".to_string(),
            ReadFrom::Latest => "$".to_string(),
            ReadFrom::Id(id) => id.to_string(),
        }
    }
}

/// Pairs a stream to tail with the handler invoked per entry.
pub struct StreamHandler {
    element: String,
    stream: String,
    handler: Box<dyn FnMut(Entry) + Send>,
}

impl StreamHandler {
    pub fn new(
        element: impl Into<String>,
        stream: impl Into<String>,
        handler: impl FnMut(Entry) + Send + 'static,
    ) -> Self {
        StreamHandler {
            element: element.into(),
            stream: stream.into(),
            handler: Box::new(handler),
        }
    }
}

impl Element {
    /// Publish one entry on an owned stream, creating the stream on first
    /// write. A `timestamp` field is stamped unless the caller supplied
    /// one. Returns the nucleus-assigned id.
    pub async fn entry_write(
        &self,
        stream: &str,
        fields: &BTreeMap<String, Datum>,
        options: &WriteOptions,
    ) -> Result<EntryId> {
        {
            self.inner.streams.lock().unwrap().insert(stream.to_string());
        }

        let mut wire = Vec::with_capacity(fields.len() + 1);
        if !fields.contains_key("timestamp") {
            wire.push(("timestamp".to_string(), unix_timestamp().into_bytes()));
        }
        for (key, value) in fields {
            wire.push((key.clone(), value.to_wire(options.serialization)?));
        }

        self.inner
            .nucleus
            .stream_add(
                &stream_key(&self.inner.name, stream),
                &wire,
                options.maxlen,
            )
            .await
    }

    /// The `n` most recent entries of a stream, newest first.
    pub async fn entry_read_n(
        &self,
        element: &str,
        stream: &str,
        n: usize,
        deserialization: Serialization,
    ) -> Result<Vec<Entry>> {
        let raw = self
            .inner
            .nucleus
            .stream_revrange_n(&stream_key(element, stream), n)
            .await?;
        Ok(raw
            .into_iter()
            .map(|entry| decode_entry(entry, deserialization))
            .collect())
    }

    /// Entries strictly after the given cursor. An empty return means the
    /// block expired or the stream holds nothing newer.
    pub async fn entry_read_since(
        &self,
        element: &str,
        stream: &str,
        since: ReadFrom,
        count: Option<usize>,
        block: Option<Duration>,
        deserialization: Serialization,
    ) -> Result<Vec<Entry>> {
        // "$" only yields entries arriving after the call, so it has to block.
        let block = match (&since, block) {
            (ReadFrom::Latest, None) => Some(Duration::from_millis(MAX_BLOCK_MS)),
            (_, block) => block,
        };

        let key = stream_key(element, stream);
        let cursors = [(key.clone(), since.cursor())];
        let chunks = self
            .inner
            .nucleus
            .stream_read(&cursors, count, block.map(|block| block.as_millis() as u64))
            .await?;

        let mut entries = Vec::new();
        for chunk in chunks {
            if chunk.key == key {
                entries.extend(
                    chunk
                        .entries
                        .into_iter()
                        .map(|entry| decode_entry(entry, deserialization)),
                );
            }
        }
        Ok(entries)
    }

    /// Tail several streams at once, dispatching each entry to its handler
    /// in nucleus order. Every cursor starts at the nucleus's current time,
    /// so only entries arriving after the call are seen. Returns once a
    /// block expires with nothing new, or after `n_loops` reads
    /// (`None` means until broken).
    pub async fn entry_read_loop(
        &self,
        handlers: Vec<StreamHandler>,
        n_loops: Option<usize>,
        block: Duration,
        deserialization: Serialization,
    ) -> Result<()> {
        let start = self.inner.nucleus.timestamp_ms().await?;

        let mut cursors: Vec<(String, String)> = Vec::with_capacity(handlers.len());
        let mut dispatch: HashMap<String, Box<dyn FnMut(Entry) + Send>> = HashMap::new();
        for handler in handlers {
            let key = stream_key(&handler.element, &handler.stream);
            cursors.push((key.clone(), start.clone()));
            dispatch.insert(key, handler.handler);
        }

        let mut remaining = n_loops;
        loop {
            if remaining == Some(0) {
                return Ok(());
            }
            if let Some(remaining) = remaining.as_mut() {
                *remaining -= 1;
            }

            let chunks = self
                .inner
                .nucleus
                .stream_read(&cursors, None, Some(block.as_millis() as u64))
                .await?;
            if chunks.is_empty() {
                return Ok(());
            }

            for chunk in chunks {
                let Some(handler) = dispatch.get_mut(&chunk.key) else {
                    continue;
                };
                let Some(cursor) = cursors.iter_mut().find(|(key, _)| key == &chunk.key) else {
                    continue;
                };
                for raw in chunk.entries {
                    cursor.1 = raw.id.to_string();
                    handler(decode_entry(raw, deserialization));
                }
            }
        }
    }
}

fn decode_entry(raw: RawEntry, method: Serialization) -> Entry {
    let mut fields = BTreeMap::new();
    for (key, value) in raw.fields {
        fields.insert(key, serialization::decode_field(value, method));
    }
    Entry {
        id: raw.id,
        fields,
    }
}

fn unix_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursors_for_each_read_mode() {
        assert_eq!(ReadFrom::Begin.cursor(), "0");
        assert_eq!(ReadFrom::Latest.cursor(), "$");
        assert_eq!(ReadFrom::Id(EntryId { ms: 5, seq: 1 }).cursor(), "5-1");
    }

    #[test]
    fn entries_decode_per_codec_with_raw_fallback() {
        let mut fields = HashMap::new();
        fields.insert(
            "count".to_string(),
            Serialization::Msgpack.encode(&json!(3)).unwrap(),
        );
        fields.insert("blob".to_string(), vec![0xc1, 0x00]);
        let raw = RawEntry {
            id: EntryId { ms: 1, seq: 0 },
            fields,
        };

        let entry = decode_entry(raw.clone(), Serialization::Msgpack);
        assert_eq!(entry.field("count"), Some(&Datum::Value(json!(3))));
        // Undecodable values stay raw.
        assert_eq!(
            entry.field("blob"),
            Some(&Datum::Bytes(vec![0xc1, 0x00].into()))
        );

        // Without deserialization everything stays raw.
        let entry = decode_entry(raw, Serialization::None);
        assert!(matches!(entry.field("count"), Some(Datum::Bytes(_))));
    }

    #[test]
    fn timestamps_are_seconds_dot_micros() {
        let ts = unix_timestamp();
        let (secs, micros) = ts.split_once('.').unwrap();
        assert!(secs.parse::<u64>().unwrap() > 1_500_000_000);
        assert_eq!(micros.len(), 6);
    }
}
