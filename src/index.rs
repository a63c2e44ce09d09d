//! KV index (C4): hash map from key bytes to key-slot index, backed by the
//! slab allocator for slot assignment and the buddy allocator for value
//! storage inside the arena's value region.
//!
//! Sgl targets are modelled as local byte slices: the iova/memory_handle
//! translation a real RDMA transport would need is outside this core
//! engine (see §1 Non-goals), so callers hand in slices already resolved
//! to local memory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::Arena;
use crate::buddy::Buddy;
use crate::error::Status;
use crate::metrics::Metrics;
use crate::policy::EvictionPolicy;
use crate::slab::Slab;

fn now_ns() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
}

struct KeySlot {
    key: Box<[u8]>,
    block_offset: u32,
    block_count: u32,
    value_length: u64,
    expire_ns: u64,
}

pub struct KvIndex {
    arena: Arena,
    buddy: Buddy,
    slab: Slab,
    value_block_size: u32,
    slots: Vec<Option<KeySlot>>,
    by_key: HashMap<Box<[u8]>, u32>,
    policy: Box<dyn EvictionPolicy>,
    metrics: Arc<Metrics>,
    expiry_cursor: u32,
}

impl KvIndex {
    pub fn new(arena: Arena, policy: Box<dyn EvictionPolicy>, metrics: Arc<Metrics>) -> Self {
        let header = *arena.header();
        let max_keys = header.max_keys;
        let value_blocks = header.value_blocks as u32;
        let value_block_size = header.value_block_size;

        let buddy = Buddy::new(value_blocks).expect("value_blocks must be a power of two");
        let slab = Slab::new("keyslots", max_keys).expect("max_keys must be nonzero");

        KvIndex {
            arena,
            buddy,
            slab,
            value_block_size,
            slots: (0..max_keys).map(|_| None).collect(),
            by_key: HashMap::new(),
            policy,
            metrics,
            expiry_cursor: 0,
        }
    }

    fn blocks_for(&self, value_length: u64) -> u32 {
        value_length.div_ceil(self.value_block_size as u64) as u32
    }

    fn write_value(&mut self, block_offset: u32, value: &[u8]) {
        let start = block_offset as usize * self.value_block_size as usize;
        let end = start + value.len();
        self.arena.value_region()[start..end].copy_from_slice(value);
    }

    fn read_value(&mut self, block_offset: u32, len: usize) -> Vec<u8> {
        let start = block_offset as usize * self.value_block_size as usize;
        self.arena.value_region()[start..start + len].to_vec()
    }

    fn remove_slot_by_index(&mut self, slot_idx: u32) {
        if let Some(slot) = self.slots[slot_idx as usize].take() {
            self.buddy.free(slot.block_offset);
            self.slab.free(slot_idx);
            self.by_key.remove(&slot.key);
            self.policy.del_key(&slot.key);
        }
    }

    fn is_expired(slot: &KeySlot, now: u64) -> bool {
        slot.expire_ns != 0 && slot.expire_ns <= now
    }

    /// GET(key, sgl) → (status, length): copies up to the value's length
    /// into the provided targets in order.
    pub fn get(&mut self, key: &[u8], sgl: &mut [&mut [u8]]) -> (Status, u64) {
        self.metrics.inc_get();

        let Some(&slot_idx) = self.by_key.get(key) else {
            self.metrics.record_get_result(false);
            return (Status::NotFound, 0);
        };

        let now = now_ns();
        if Self::is_expired(self.slots[slot_idx as usize].as_ref().unwrap(), now) {
            self.remove_slot_by_index(slot_idx);
            self.metrics.record_get_result(false);
            return (Status::NotFound, 0);
        }

        let (block_offset, value_length) = {
            let slot = self.slots[slot_idx as usize].as_ref().unwrap();
            (slot.block_offset, slot.value_length)
        };

        let total_sgl_len: u64 = sgl.iter().map(|s| s.len() as u64).sum();
        self.policy.access(key);
        self.metrics.record_get_result(true);

        // An undersized sgl reports VALUE_TOO_BIG without writing anything
        // into the caller's buffers (spec §8 E4).
        if total_sgl_len < value_length {
            return (Status::ValueTooBig, value_length);
        }

        let value = self.read_value(block_offset, value_length as usize);
        let mut written = 0usize;
        for target in sgl.iter_mut() {
            if written >= value.len() {
                break;
            }
            let take = target.len().min(value.len() - written);
            target[..take].copy_from_slice(&value[written..written + take]);
            written += take;
        }

        (Status::Ok, value_length)
    }

    /// SET(key, value, timeout_ns) → status.
    pub fn set(&mut self, key: &[u8], value: &[u8], timeout_ns: u64) -> Status {
        self.metrics.inc_set();
        let blocks_needed = self.blocks_for(value.len() as u64).max(1);
        if blocks_needed > self.buddy.nmemb() {
            return Status::ValueTooBig;
        }

        let reused_idx = self.by_key.get(key).copied();
        if let Some(old_idx) = reused_idx {
            let old = self.slots[old_idx as usize].as_ref().unwrap();
            self.buddy.free(old.block_offset);
        }

        let run = loop {
            match self.buddy.alloc(blocks_needed) {
                Some(run) => break run,
                None => match self.policy.evict() {
                    Some(victim) => {
                        if let Some(&victim_idx) = self.by_key.get(&victim) {
                            if Some(victim_idx) != reused_idx {
                                self.remove_slot_by_index(victim_idx);
                                self.metrics.inc_set_eviction();
                            }
                        }
                    }
                    None => return Status::NoSpace,
                },
            }
        };

        let slot_idx = match reused_idx {
            Some(idx) => idx,
            None => match self.slab.alloc() {
                Some(idx) => idx,
                None => {
                    self.buddy.free(run.block_offset);
                    return Status::NoSpace;
                }
            },
        };

        self.write_value(run.block_offset, value);

        let expire_ns = if timeout_ns == 0 { 0 } else { now_ns() + timeout_ns };
        self.slots[slot_idx as usize] = Some(KeySlot {
            key: key.into(),
            block_offset: run.block_offset,
            block_count: run.block_count,
            value_length: value.len() as u64,
            expire_ns,
        });
        self.by_key.insert(key.into(), slot_idx);
        self.policy.access(key);

        Status::Ok
    }

    /// DEL(key) → status.
    pub fn del(&mut self, key: &[u8]) -> Status {
        self.metrics.inc_del();
        match self.by_key.get(key).copied() {
            Some(idx) => {
                self.remove_slot_by_index(idx);
                Status::Ok
            }
            None => Status::NotFound,
        }
    }

    /// TEST(key) → status, no value transfer.
    pub fn test(&mut self, key: &[u8]) -> Status {
        self.metrics.inc_test();
        match self.by_key.get(key).copied() {
            Some(idx) => {
                let now = now_ns();
                if Self::is_expired(self.slots[idx as usize].as_ref().unwrap(), now) {
                    self.remove_slot_by_index(idx);
                    Status::NotFound
                } else {
                    Status::Ok
                }
            }
            None => Status::NotFound,
        }
    }

    /// One background expiry tick: scans up to `batch` slots starting from
    /// the persistent cursor, dropping anything past its expiry.
    pub fn expire_sweep(&mut self, batch: usize) {
        let now = now_ns();
        let total = self.slots.len() as u32;
        if total == 0 {
            return;
        }

        let mut dropped = 0u64;
        let mut bytes_freed = 0u64;
        let mut scanned = 0usize;
        let mut cursor = self.expiry_cursor;

        while scanned < batch && scanned < total as usize {
            if let Some(slot) = self.slots[cursor as usize].as_ref() {
                if Self::is_expired(slot, now) {
                    bytes_freed += slot.value_length;
                    self.remove_slot_by_index(cursor);
                    dropped += 1;
                }
            }
            cursor = (cursor + 1) % total;
            scanned += 1;
        }
        self.expiry_cursor = cursor;
        self.metrics.record_expiry_sweep(dropped, bytes_freed);
    }

    /// Shared handle to this index's counters, so callers above it (the
    /// request pipeline's slow-op tracking) can record against the same
    /// `Metrics` instance without threading a second one through.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
