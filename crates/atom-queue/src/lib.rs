//! Multi-process queues over the nucleus's sorted collections.
//!
//! All state lives in the nucleus, so any number of processes can put and
//! get concurrently; the only coordination is the broker's atomic sorted-
//! collection operations. [`PrioQueue`] orders items by a caller-supplied
//! float priority; [`FifoQueue`] is the same queue with a monotonic clock
//! as the priority.

use atom::Element;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

mod metrics;
use metrics::QueueMetrics;

/// Key prefix shared by every queue's backing sorted collection.
const QUEUE_KEY_PREFIX: &str = "atom-prio-queue-";

pub const PRIO_QUEUE_DEFAULT_MAX_LEN: u64 = 1000;
pub const FIFO_QUEUE_DEFAULT_MAX_LEN: u64 = 1000;

const PRIO_KIND: &str = "prio";
const FIFO_KIND: &str = "fifo";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Atom(#[from] atom::Error),
    #[error("queue item encoding failed")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("queue item decoding failed")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type Result<Ok, Err = Error> = std::result::Result<Ok, Err>;

/// Multi-process priority queue with self-pruning.
///
/// Items are keyed by float priority in a nucleus sorted collection. With
/// `max_highest_prio` false (the default sense) the minimum priority is the
/// most important; pruning on an over-full put drops from the opposite end.
/// Pruning happens on put so that slow putters, not getters, pay for
/// cleanup.
pub struct PrioQueue {
    name: String,
    key: String,
    max_highest_prio: bool,
    max_len: u64,
    metrics: QueueMetrics,
}

impl PrioQueue {
    /// Create the queue, deleting any prior backing collection under the
    /// same name. The element is only used to reach the nucleus; any live
    /// element will do.
    pub async fn new(
        name: &str,
        element: &Element,
        max_highest_prio: bool,
        max_len: u64,
    ) -> Result<Self> {
        Self::with_kind(PRIO_KIND, name, element, max_highest_prio, max_len).await
    }

    async fn with_kind(
        kind: &str,
        name: &str,
        element: &Element,
        max_highest_prio: bool,
        max_len: u64,
    ) -> Result<Self> {
        let key = format!("{QUEUE_KEY_PREFIX}{name}");
        element.nucleus().sorted_delete(&key).await?;
        Ok(PrioQueue {
            name: name.to_string(),
            key,
            max_highest_prio,
            max_len,
            metrics: QueueMetrics::new(kind, name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert an item at the given priority. When `prune` is set and the
    /// queue overflowed, the least-important items are popped until the
    /// size is back at `max_len`; they are returned alongside the new
    /// size.
    pub async fn put<T>(
        &self,
        element: &Element,
        item: &T,
        prio: f64,
        prune: bool,
    ) -> Result<(u64, Vec<T>)>
    where
        T: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        let member = rmp_serde::to_vec(item)?;
        let mut size = element.nucleus().sorted_add(&self.key, &member, prio).await?;
        self.metrics.put(started, prio);
        self.metrics.size(size);

        let mut pruned = Vec::new();
        if prune && size > self.max_len {
            (pruned, size) = self.prune(element, size).await?;
        }
        self.metrics.pruned(pruned.len() as u64);
        Ok((size, pruned))
    }

    /// Pop everything above `max_len` from the least-important end. Under
    /// the FIFO specialization that end holds the newest items.
    async fn prune<T: DeserializeOwned>(
        &self,
        element: &Element,
        size: u64,
    ) -> Result<(Vec<T>, u64)> {
        // Pruning drops the *least* important side, the inverse of the
        // configured preference.
        let prune_max = !self.max_highest_prio;
        let excess = size.saturating_sub(self.max_len) as usize;
        let popped = element
            .nucleus()
            .sorted_pop_n(&self.key, prune_max, excess)
            .await?;

        let mut pruned = Vec::with_capacity(popped.len());
        for (member, prio) in popped {
            pruned.push(rmp_serde::from_slice(&member)?);
            self.metrics.pruned_prio(prio);
        }
        let size = element.nucleus().sorted_size(&self.key).await?;
        Ok((pruned, size))
    }

    /// Pop the most important item. Non-blocking gets on an empty queue
    /// return `None`; blocking gets wait up to `timeout` (zero waits
    /// forever).
    pub async fn get<T: DeserializeOwned>(
        &self,
        element: &Element,
        block: bool,
        timeout: Duration,
    ) -> Result<Option<T>> {
        let started = Instant::now();
        let popped = if block {
            element
                .nucleus()
                .sorted_pop_blocking(&self.key, self.max_highest_prio, timeout)
                .await?
        } else {
            element
                .nucleus()
                .sorted_pop(&self.key, self.max_highest_prio)
                .await?
        };
        self.metrics.get(started);

        match popped {
            Some((member, prio)) => {
                self.metrics.got_data(1);
                self.metrics.got_prio(prio);
                Ok(Some(rmp_serde::from_slice(&member)?))
            }
            None => {
                self.metrics.got_empty();
                Ok(None)
            }
        }
    }

    /// Pop up to `n` items atomically, most important first. Never blocks;
    /// `max_n` pops up to the queue's configured capacity instead of `n`.
    pub async fn get_n<T: DeserializeOwned>(
        &self,
        element: &Element,
        n: usize,
        max_n: bool,
    ) -> Result<Vec<T>> {
        let started = Instant::now();
        let count = if max_n { self.max_len as usize } else { n };
        let popped = element
            .nucleus()
            .sorted_pop_n(&self.key, self.max_highest_prio, count)
            .await?;
        self.metrics.get_n(started);

        if popped.is_empty() {
            self.metrics.got_empty();
            return Ok(Vec::new());
        }
        self.metrics.got_data(popped.len() as u64);

        let mut items = Vec::with_capacity(popped.len());
        for (member, prio) in popped {
            self.metrics.got_prio(prio);
            items.push(rmp_serde::from_slice(&member)?);
        }
        Ok(items)
    }

    /// Read up to `n` items in priority order without consuming them.
    pub async fn peek_n<T: DeserializeOwned>(
        &self,
        element: &Element,
        n: usize,
    ) -> Result<Vec<T>> {
        let members = element
            .nucleus()
            .sorted_peek_n(&self.key, self.max_highest_prio, n)
            .await?;
        members
            .into_iter()
            .map(|(member, _prio)| Ok(rmp_serde::from_slice(&member)?))
            .collect()
    }

    pub async fn size(&self, element: &Element) -> Result<u64> {
        Ok(element.nucleus().sorted_size(&self.key).await?)
    }

    /// Delete the backing collection. Call when done with the queue.
    pub async fn finish(&self, element: &Element) -> Result<()> {
        Ok(element.nucleus().sorted_delete(&self.key).await?)
    }
}

/// FIFO queue built on [`PrioQueue`] with a monotonic clock as priority:
/// the oldest item is the most important, and overflow pruning drops the
/// newest instead of the oldest.
///
/// Feeding processes may pass an explicit timestamp to `put` to keep FIFO
/// order under scheduling jitter.
pub struct FifoQueue {
    inner: PrioQueue,
}

impl FifoQueue {
    pub async fn new(name: &str, element: &Element, max_len: u64) -> Result<Self> {
        let inner = PrioQueue::with_kind(FIFO_KIND, name, element, false, max_len).await?;
        Ok(FifoQueue { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Insert an item, stamped with the monotonic clock unless the caller
    /// carries its own timestamp. On overflow the newest items are the
    /// least important and get dropped.
    pub async fn put<T>(
        &self,
        element: &Element,
        item: &T,
        timestamp: Option<f64>,
        prune: bool,
    ) -> Result<(u64, Vec<T>)>
    where
        T: Serialize + DeserializeOwned,
    {
        let prio = timestamp.unwrap_or_else(monotonic_secs);
        self.inner.put(element, item, prio, prune).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        element: &Element,
        block: bool,
        timeout: Duration,
    ) -> Result<Option<T>> {
        self.inner.get(element, block, timeout).await
    }

    pub async fn get_n<T: DeserializeOwned>(
        &self,
        element: &Element,
        n: usize,
        max_n: bool,
    ) -> Result<Vec<T>> {
        self.inner.get_n(element, n, max_n).await
    }

    pub async fn peek_n<T: DeserializeOwned>(
        &self,
        element: &Element,
        n: usize,
    ) -> Result<Vec<T>> {
        self.inner.peek_n(element, n).await
    }

    pub async fn size(&self, element: &Element) -> Result<u64> {
        self.inner.size(element).await
    }

    pub async fn finish(&self, element: &Element) -> Result<()> {
        self.inner.finish(element).await
    }
}

/// Seconds on a clock that never goes backwards, process-local like the
/// scheduling jitter it exists to absorb.
pub fn monotonic_secs() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_timestamps_increase() {
        let first = monotonic_secs();
        let second = monotonic_secs();
        assert!(second >= first);
        assert!(monotonic_secs() < 60.0, "clock should start near zero");
    }

    #[test]
    fn queue_keys_share_the_wire_prefix() {
        assert_eq!(format!("{QUEUE_KEY_PREFIX}frames"), "atom-prio-queue-frames");
    }

    #[test]
    fn items_survive_the_object_graph_codec() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Job {
            id: u32,
            payload: Vec<u8>,
        }
        let job = Job {
            id: 7,
            payload: vec![1, 2, 3],
        };
        let bytes = rmp_serde::to_vec(&job).unwrap();
        assert_eq!(rmp_serde::from_slice::<Job>(&bytes).unwrap(), job);
    }
}
