//! Engine-wide counters.
//!
//! Counters are updated from per-thread hot paths so every field is atomic;
//! there is no cross-thread lock on the read or write side.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub get_ops: AtomicU64,
    pub set_ops: AtomicU64,
    pub del_ops: AtomicU64,
    pub test_ops: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub set_evictions: AtomicU64,
    pub backend_get_ops: AtomicU64,
    pub backend_populate_failures: AtomicU64,
    pub expire_routine_times: AtomicU64,
    pub expire_kv_count: AtomicU64,
    pub expire_kv_bytes: AtomicU64,
    pub slow_ops: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_get(&self) {
        self.get_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_set(&self) {
        self.set_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_del(&self) {
        self.del_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_test(&self) {
        self.test_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_result(&self, hit: bool) {
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_set_eviction(&self) {
        self.set_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_get(&self) {
        self.backend_get_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_populate_failure(&self) {
        self.backend_populate_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record one expiry sweep tick over `dropped` keys totalling
    /// `bytes_freed` bytes of value storage.
    pub fn record_expiry_sweep(&self, dropped: u64, bytes_freed: u64) {
        self.expire_routine_times.fetch_add(1, Ordering::Relaxed);
        self.expire_kv_count.fetch_add(dropped, Ordering::Relaxed);
        self.expire_kv_bytes.fetch_add(bytes_freed, Ordering::Relaxed);
    }

    pub fn inc_slow_op(&self) {
        self.slow_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hits(&self) -> u64 {
        self.get_hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.get_misses.load(Ordering::Relaxed)
    }

    pub fn expire_kv_count(&self) -> u64 {
        self.expire_kv_count.load(Ordering::Relaxed)
    }

    pub fn expire_kv_bytes(&self) -> u64 {
        self.expire_kv_bytes.load(Ordering::Relaxed)
    }
}
