//! Slab allocator (C3): a fixed-size object pool backing key slots, using a
//! bitmap free list (1 = free) and a rotating allocation hint so repeated
//! allocation sweeps don't restart from index 0 every time.

use std::sync::Mutex;

const BITS_PER_WORD: u32 = u64::BITS;

struct SlabState {
    objects: u32,
    inuse: u32,
    lindex: u32,
    bitmap: Vec<u64>,
}

pub struct Slab {
    name: String,
    state: Mutex<SlabState>,
}

impl Slab {
    pub fn new(name: impl Into<String>, objects: u32) -> Option<Self> {
        if objects == 0 {
            return None;
        }
        let words = objects.div_ceil(BITS_PER_WORD) as usize;
        let mut bitmap = vec![0u64; words];
        for index in 0..objects {
            set_bit(&mut bitmap[(index / BITS_PER_WORD) as usize], index % BITS_PER_WORD);
        }

        Some(Slab {
            name: name.into(),
            state: Mutex::new(SlabState {
                objects,
                inuse: 0,
                lindex: 0,
                bitmap,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> u32 {
        self.state.lock().unwrap().objects
    }

    pub fn inuse(&self) -> u32 {
        self.state.lock().unwrap().inuse
    }

    /// Allocate the next free object index, scanning from the rotating
    /// hint forward and wrapping around once.
    pub fn alloc(&self) -> Option<u32> {
        let mut st = self.state.lock().unwrap();
        let words = st.bitmap.len() as u32;

        let mut found = None;
        for word in st.lindex..words {
            if st.bitmap[word as usize] != 0 {
                found = Some(word);
                break;
            }
        }
        if found.is_none() {
            for word in 0..st.lindex {
                if st.bitmap[word as usize] != 0 {
                    found = Some(word);
                    break;
                }
            }
        }

        let word = found?;
        let bit = st.bitmap[word as usize].trailing_zeros();
        clear_bit(&mut st.bitmap[word as usize], bit);
        let index = word * BITS_PER_WORD + bit;
        debug_assert!(index < st.objects);
        st.inuse += 1;
        st.lindex = word;
        Some(index)
    }

    /// Force-take a specific index, used to recover a persisted layout on
    /// arena reload.
    pub fn reserve(&self, index: u32) {
        let mut st = self.state.lock().unwrap();
        assert!(index < st.objects, "slab reserve index out of range");
        clear_bit(&mut st.bitmap[(index / BITS_PER_WORD) as usize], index % BITS_PER_WORD);
        st.inuse += 1;
    }

    pub fn free(&self, index: u32) {
        let mut st = self.state.lock().unwrap();
        assert!(index < st.objects, "slab free index out of range");
        set_bit(&mut st.bitmap[(index / BITS_PER_WORD) as usize], index % BITS_PER_WORD);
        st.inuse -= 1;
    }
}

fn set_bit(word: &mut u64, bit: u32) {
    *word |= 1u64 << bit;
}

fn clear_bit(word: &mut u64, bit: u32) {
    *word &= !(1u64 << bit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_objects() {
        assert!(Slab::new("t", 0).is_none());
    }

    #[test]
    fn alloc_exhausts_and_frees() {
        let slab = Slab::new("keys", 4).unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(slab.alloc().unwrap());
        }
        assert!(slab.alloc().is_none());
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        slab.free(seen[1]);
        let reused = slab.alloc().unwrap();
        assert_eq!(reused, seen[1]);
    }

    #[test]
    fn reserve_takes_a_specific_slot() {
        let slab = Slab::new("keys", 8).unwrap();
        slab.reserve(5);
        assert_eq!(slab.inuse(), 1);
        for _ in 0..7 {
            assert_ne!(slab.alloc().unwrap(), 5);
        }
        assert!(slab.alloc().is_none());
    }

    #[test]
    fn hint_rotates_across_words() {
        let slab = Slab::new("keys", 256).unwrap();
        for _ in 0..130 {
            slab.alloc().unwrap();
        }
        assert_eq!(slab.inuse(), 130);
    }
}
