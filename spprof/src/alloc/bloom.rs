//! Counting bloom filter over allocation addresses: the first check of the
//! free path. A zero cell for any of the k hashes proves the address was
//! never sampled, so the vast majority of frees skip the heap map probe
//! entirely.
//!
//! Cells are 4-bit saturating counters packed eight to a word. Saturated
//! cells are never decremented, which keeps the no-false-negatives
//! invariant even after heavy churn.

use std::sync::atomic::{AtomicU32, Ordering};

/// Number of counter cells. Must be a power of two.
pub(crate) const BLOOM_CELLS: usize = 1 << 20;

const HASH_COUNT: usize = 3;
const CELLS_PER_WORD: usize = 8;
const CELL_MAX: u32 = 0xf;

pub(crate) struct CountingBloom {
    words: Box<[AtomicU32]>,
    mask: u64,
}

fn mix(addr: u64, round: u64) -> u64 {
    let mut z = addr ^ round.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl CountingBloom {
    pub fn new(cells: usize) -> CountingBloom {
        assert!(cells.is_power_of_two() && cells >= CELLS_PER_WORD);
        let words = (0..cells / CELLS_PER_WORD)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        CountingBloom {
            words,
            mask: cells as u64 - 1,
        }
    }

    fn cells(&self, addr: u64) -> [usize; HASH_COUNT] {
        let mut out = [0usize; HASH_COUNT];
        for (round, slot) in out.iter_mut().enumerate() {
            *slot = (mix(addr, round as u64 + 1) & self.mask) as usize;
        }
        out
    }

    fn bump(&self, cell: usize, up: bool) {
        let word = &self.words[cell / CELLS_PER_WORD];
        let shift = (cell % CELLS_PER_WORD) * 4;
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let value = (current >> shift) & CELL_MAX;
            // Saturated cells are pinned: incrementing would wrap and
            // decrementing could manufacture a false negative.
            if value == CELL_MAX || (!up && value == 0) {
                return;
            }
            let next = if up {
                current + (1 << shift)
            } else {
                current - (1 << shift)
            };
            match word.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Mark `addr` as sampled.
    pub fn add(&self, addr: u64) {
        for cell in self.cells(addr) {
            self.bump(cell, true);
        }
    }

    /// Unmark one sampling of `addr` after its record was retired.
    pub fn remove(&self, addr: u64) {
        for cell in self.cells(addr) {
            self.bump(cell, false);
        }
    }

    /// False positives possible, false negatives never.
    pub fn may_contain(&self, addr: u64) -> bool {
        self.cells(addr).into_iter().all(|cell| {
            let word = self.words[cell / CELLS_PER_WORD].load(Ordering::Relaxed);
            let shift = (cell % CELLS_PER_WORD) * 4;
            (word >> shift) & CELL_MAX != 0
        })
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_addresses_are_always_found() {
        let bloom = CountingBloom::new(1 << 12);
        let addrs: Vec<u64> = (0..1000).map(|i| 0x5000_0000 + i * 16).collect();
        for &a in &addrs {
            bloom.add(a);
        }
        for &a in &addrs {
            assert!(bloom.may_contain(a), "false negative for {a:#x}");
        }
    }

    #[test]
    fn unseen_address_is_usually_rejected() {
        let bloom = CountingBloom::new(1 << 16);
        for i in 0..100u64 {
            bloom.add(0x1000 + i * 8);
        }
        let misses = (0..10_000u64)
            .filter(|i| !bloom.may_contain(0x9000_0000 + i * 8))
            .count();
        // With 300 set cells out of 65536 the reject rate should be
        // overwhelming.
        assert!(misses > 9_900, "only {misses} rejections");
    }

    #[test]
    fn remove_clears_a_single_addition() {
        let bloom = CountingBloom::new(1 << 12);
        bloom.add(0xabc0);
        assert!(bloom.may_contain(0xabc0));
        bloom.remove(0xabc0);
        assert!(!bloom.may_contain(0xabc0));
    }

    #[test]
    fn shared_cells_survive_one_removal() {
        let bloom = CountingBloom::new(1 << 12);
        bloom.add(0xdead0);
        bloom.add(0xdead0);
        bloom.remove(0xdead0);
        assert!(bloom.may_contain(0xdead0));
    }

    #[test]
    fn saturated_cells_never_go_negative() {
        let bloom = CountingBloom::new(1 << 12);
        for _ in 0..40 {
            bloom.add(0xf00);
        }
        for _ in 0..40 {
            bloom.remove(0xf00);
        }
        // Increments saturated at 15, so the pinned cells must survive all
        // removals.
        assert!(bloom.may_contain(0xf00));
    }

    #[test]
    fn clear_resets_everything() {
        let bloom = CountingBloom::new(1 << 12);
        bloom.add(0x1234);
        bloom.clear();
        assert!(!bloom.may_contain(0x1234));
    }
}
