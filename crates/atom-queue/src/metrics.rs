//! Queue instrumentation through the `metrics` facade. Keys are
//! hierarchical `queue:<kind>:<name>:<descriptor>` strings so that every
//! process sharing a queue reports into the same series; aggregation and
//! retention are the installed recorder's concern.

use std::time::Instant;

const SIZE: &str = "size";
const PUT: &str = "put";
const GET: &str = "get";
const GET_N: &str = "get_n";
const PRUNED: &str = "pruned";
const GET_DATA: &str = "get_data";
const GET_EMPTY: &str = "get_empty";
const PUT_PRIO: &str = "put_prio";
const GET_PRIO: &str = "get_prio";
const PRUNE_PRIO: &str = "prune_prio";
const PUT_TIMING: &str = "put:timing";
const GET_TIMING: &str = "get:timing";
const GET_N_TIMING: &str = "get_n:timing";

pub(crate) struct QueueMetrics {
    base: String,
}

impl QueueMetrics {
    pub fn new(kind: &str, name: &str) -> Self {
        let base = format!("queue:{kind}:{name}");
        metrics::describe_gauge!(format!("{base}:{SIZE}"), "queue size after a put");
        metrics::describe_counter!(format!("{base}:{PRUNED}"), "items dropped by pruning");
        metrics::describe_counter!(format!("{base}:{GET_DATA}"), "gets that returned data");
        metrics::describe_counter!(format!("{base}:{GET_EMPTY}"), "gets that returned nothing");
        QueueMetrics { base }
    }

    fn key(&self, descriptor: &str) -> String {
        format!("{}:{descriptor}", self.base)
    }

    pub fn size(&self, size: u64) {
        metrics::gauge!(self.key(SIZE)).set(size as f64);
    }

    pub fn put(&self, started: Instant, prio: f64) {
        metrics::counter!(self.key(PUT)).increment(1);
        metrics::histogram!(self.key(PUT_TIMING)).record(started.elapsed().as_secs_f64());
        metrics::histogram!(self.key(PUT_PRIO)).record(prio);
    }

    pub fn get(&self, started: Instant) {
        metrics::counter!(self.key(GET)).increment(1);
        metrics::histogram!(self.key(GET_TIMING)).record(started.elapsed().as_secs_f64());
    }

    pub fn get_n(&self, started: Instant) {
        metrics::counter!(self.key(GET_N)).increment(1);
        metrics::histogram!(self.key(GET_N_TIMING)).record(started.elapsed().as_secs_f64());
    }

    pub fn got_data(&self, count: u64) {
        metrics::counter!(self.key(GET_DATA)).increment(count);
    }

    pub fn got_empty(&self) {
        metrics::counter!(self.key(GET_EMPTY)).increment(1);
    }

    pub fn got_prio(&self, prio: f64) {
        metrics::histogram!(self.key(GET_PRIO)).record(prio);
    }

    pub fn pruned(&self, count: u64) {
        if count > 0 {
            metrics::counter!(self.key(PRUNED)).increment(count);
        }
    }

    pub fn pruned_prio(&self, prio: f64) {
        metrics::histogram!(self.key(PRUNE_PRIO)).record(prio);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_hierarchical() {
        let metrics = QueueMetrics::new("prio", "frames");
        assert_eq!(metrics.key("put"), "queue:prio:frames:put");
        assert_eq!(metrics.key("get_empty"), "queue:prio:frames:get_empty");
    }
}
