//! Buddy allocator (C2): manages value-block runs as a binary buddy tree
//! over a power-of-two count of fixed-size blocks.
//!
//! The tree is encoded exactly as the original: `meta[i]` holds the largest
//! free run, in blocks, available under node `i`; leaves sit at indices
//! `[nmemb-1, 2*nmemb-2]`. Allocation descends preferring the child whose
//! `meta` covers the request; free walks back up from the leaf, re-deriving
//! the order of the freed node from the stale `meta` values left over its
//! descendants, then coalesces siblings whose combined size fills the
//! parent.

use std::sync::Mutex;

#[inline]
fn l_leaf(index: u32) -> u32 {
    index * 2 + 1
}

#[inline]
fn r_leaf(index: u32) -> u32 {
    index * 2 + 2
}

#[inline]
fn parent(index: u32) -> u32 {
    (index + 1) / 2 - 1
}

struct BuddyState {
    nmemb: u32,
    inuse: u32,
    meta: Vec<u32>,
}

/// One contiguous run of blocks handed out by `alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyRun {
    pub block_offset: u32,
    pub block_count: u32,
}

pub struct Buddy {
    state: Mutex<BuddyState>,
}

impl Buddy {
    /// `nmemb` is the number of fixed-size blocks managed; it must be a
    /// power of two.
    pub fn new(nmemb: u32) -> Option<Self> {
        if nmemb == 0 || !nmemb.is_power_of_two() {
            return None;
        }

        let mut meta = vec![0u32; (nmemb * 2 - 1) as usize];
        let mut nodes = nmemb * 2;
        for (i, slot) in meta.iter_mut().enumerate() {
            if (i as u32 + 1).is_power_of_two() {
                nodes /= 2;
            }
            *slot = nodes;
        }

        Some(Buddy {
            state: Mutex::new(BuddyState {
                nmemb,
                inuse: 0,
                meta,
            }),
        })
    }

    pub fn nmemb(&self) -> u32 {
        self.state.lock().unwrap().nmemb
    }

    pub fn inuse(&self) -> u32 {
        self.state.lock().unwrap().inuse
    }

    /// Allocate a run of at least `size` blocks, rounded up to a power of
    /// two. Returns `None` if no run of that size is free.
    pub fn alloc(&self, size: u32) -> Option<BuddyRun> {
        let mut st = self.state.lock().unwrap();
        let alignup = size.next_power_of_two().max(1);

        if st.meta[0] < alignup {
            return None;
        }

        let mut index = 0u32;
        let mut nodes = st.nmemb;
        while nodes != alignup {
            if st.meta[l_leaf(index) as usize] >= alignup {
                index = l_leaf(index);
            } else {
                index = r_leaf(index);
            }
            nodes /= 2;
        }

        if st.meta[index as usize] == 0 {
            return None;
        }

        st.meta[index as usize] = 0;
        let offset = (index + 1) * nodes - st.nmemb;

        while index != 0 {
            index = parent(index);
            st.meta[index as usize] = st.meta[l_leaf(index) as usize].max(st.meta[r_leaf(index) as usize]);
        }

        st.inuse += alignup;
        Some(BuddyRun {
            block_offset: offset,
            block_count: alignup,
        })
    }

    /// Free a run previously returned by `alloc`, identified by its block
    /// offset.
    pub fn free(&self, block_offset: u32) {
        let mut st = self.state.lock().unwrap();
        assert!(block_offset < st.nmemb, "block offset out of range");

        let mut index = block_offset + st.nmemb - 1;
        let mut nodes = 1u32;
        while st.meta[index as usize] != 0 {
            nodes *= 2;
            if index == 0 {
                break;
            }
            index = parent(index);
        }

        st.meta[index as usize] = nodes;
        st.inuse -= nodes;

        while index != 0 {
            index = parent(index);
            nodes *= 2;
            let left = st.meta[l_leaf(index) as usize];
            let right = st.meta[r_leaf(index) as usize];
            st.meta[index as usize] = if left + right == nodes { nodes } else { left.max(right) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(Buddy::new(0).is_none());
        assert!(Buddy::new(3).is_none());
    }

    #[test]
    fn alloc_exhausts_then_frees() {
        let buddy = Buddy::new(8).unwrap();
        let a = buddy.alloc(1).unwrap();
        let b = buddy.alloc(2).unwrap();
        assert_eq!(buddy.inuse(), 1 + 2);
        assert_ne!(a.block_offset, b.block_offset);

        // Exhaust remainder (8 - 1 - 2 = 5, rounds to runs of 4 then 1).
        let c = buddy.alloc(4).unwrap();
        assert_eq!(c.block_count, 4);
        assert!(buddy.alloc(4).is_none());

        buddy.free(a.block_offset);
        buddy.free(b.block_offset);
        buddy.free(c.block_offset);
        assert_eq!(buddy.inuse(), 0);

        let whole = buddy.alloc(8).unwrap();
        assert_eq!(whole.block_count, 8);
        assert_eq!(whole.block_offset, 0);
    }

    #[test]
    fn coalesces_siblings_on_free() {
        let buddy = Buddy::new(4).unwrap();
        let a = buddy.alloc(1).unwrap();
        let b = buddy.alloc(1).unwrap();
        let c = buddy.alloc(2).unwrap();
        assert!(buddy.alloc(1).is_none());

        buddy.free(a.block_offset);
        buddy.free(b.block_offset);
        buddy.free(c.block_offset);

        // Fully coalesced back to one free run covering all 4 blocks.
        let whole = buddy.alloc(4).unwrap();
        assert_eq!(whole.block_count, 4);
    }

    #[test]
    fn rounds_request_up_to_power_of_two() {
        let buddy = Buddy::new(8).unwrap();
        let run = buddy.alloc(3).unwrap();
        assert_eq!(run.block_count, 4);
    }
}
