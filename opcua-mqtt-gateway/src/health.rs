use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time copy of the gateway counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub reads: u64,
    pub read_errors: u64,
    pub publishes: u64,
    pub publish_errors: u64,
    pub subscriptions: u64,
    pub subscribe_errors: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    read_errors: AtomicU64,
    publishes: AtomicU64,
    publish_errors: AtomicU64,
    subscriptions: AtomicU64,
    subscribe_errors: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
    decode_errors: AtomicU64,
}

/// Operation counters shared by the scheduler, the router and the lifecycle.
#[derive(Clone)]
pub struct GatewayStats {
    start_time: Instant,
    counters: Arc<Counters>,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn record_read(&self) {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.counters.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription(&self) {
        self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe_error(&self) {
        self.counters.subscribe_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            reads: c.reads.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            publishes: c.publishes.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
            subscriptions: c.subscriptions.load(Ordering::Relaxed),
            subscribe_errors: c.subscribe_errors.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}
