//! Content-addressed interning of allocation stacks.
//!
//! Every sampled allocation carries a stack; most allocations come from a
//! handful of call sites, so stacks are deduplicated into a fixed-size
//! lock-free table and records store a 64-bit id. Ids are slot indices:
//! stable for the whole profiler lifetime, and exact — two ids never alias
//! distinct content.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::host::CodeDescriptor;

pub(crate) const DEFAULT_STACK_TABLE_SLOTS: usize = 1 << 16;

const INTERN_PROBE_LIMIT: usize = 64;
const PUBLISH_SPIN_LIMIT: usize = 10_000;

/// One frame of an interned stack. Interpreter frames carry the descriptor
/// pointer and instruction index; native frames carry the instruction
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InternedFrame {
    pub code: *const CodeDescriptor,
    pub lasti: u32,
    pub native_ip: u64,
    pub is_native: bool,
}

// The pointers are inert capture data; dereferencing goes through the host
// under its own safety contract.
unsafe impl Send for InternedFrame {}
unsafe impl Sync for InternedFrame {}

impl InternedFrame {
    pub fn interpreted(code: *const CodeDescriptor, lasti: u32) -> InternedFrame {
        InternedFrame {
            code,
            lasti,
            native_ip: 0,
            is_native: false,
        }
    }

    pub fn native(ip: u64) -> InternedFrame {
        InternedFrame {
            code: std::ptr::null(),
            lasti: 0,
            native_ip: ip,
            is_native: true,
        }
    }
}

pub(crate) struct StackEntry {
    pub frames: Box<[InternedFrame]>,
    pub hits: AtomicU64,
}

struct Slot {
    hash: AtomicU64,
    entry: AtomicPtr<StackEntry>,
}

pub(crate) struct StackInterner {
    slots: Box<[Slot]>,
    mask: u64,
    unique: AtomicU64,
}

unsafe impl Send for StackInterner {}
unsafe impl Sync for StackInterner {}

fn content_hash(frames: &[InternedFrame]) -> u64 {
    // FxHash-style multiply-xor over the frame words; the high bit is
    // forced so a stored hash is never the empty sentinel 0.
    const K: u64 = 0x51_7c_c1_b7_27_22_0a_95;
    let mut h: u64 = frames.len() as u64;
    for f in frames {
        h = (h.rotate_left(5) ^ (f.code as u64)).wrapping_mul(K);
        h = (h.rotate_left(5) ^ f.lasti as u64).wrapping_mul(K);
        h = (h.rotate_left(5) ^ f.native_ip).wrapping_mul(K);
        h = (h.rotate_left(5) ^ f.is_native as u64).wrapping_mul(K);
    }
    h | (1 << 63)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InternResult {
    pub id: u64,
    /// First time this content was seen; the caller owns follow-up work
    /// like retaining code descriptors.
    pub created: bool,
}

impl StackInterner {
    /// `slots` must be a power of two.
    pub fn new(slots: usize) -> StackInterner {
        assert!(slots.is_power_of_two());
        let slots = (0..slots)
            .map(|_| Slot {
                hash: AtomicU64::new(0),
                entry: AtomicPtr::new(std::ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StackInterner {
            mask: slots.len() as u64 - 1,
            slots,
            unique: AtomicU64::new(0),
        }
    }

    pub fn unique_count(&self) -> u64 {
        self.unique.load(Ordering::Relaxed)
    }

    /// Deduplicate `frames`, returning the stable id. `None` when the table
    /// is saturated (the caller counts and abandons the sample).
    pub fn intern(&self, frames: &[InternedFrame]) -> Option<InternResult> {
        let hash = content_hash(frames);
        let base = hash & self.mask;

        for probe in 0..INTERN_PROBE_LIMIT {
            let slot = &self.slots[((base + probe as u64) & self.mask) as usize];
            let id = (base + probe as u64) & self.mask;

            match slot
                .hash
                .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // Claimed: build and publish the entry. The allocation
                    // happens inside the allocator hook, which is why the
                    // hook's re-entrancy guard exists.
                    let entry = Box::new(StackEntry {
                        frames: frames.to_vec().into_boxed_slice(),
                        hits: AtomicU64::new(1),
                    });
                    slot.entry.store(Box::into_raw(entry), Ordering::Release);
                    self.unique.fetch_add(1, Ordering::Relaxed);
                    return Some(InternResult { id, created: true });
                }
                Err(existing) if existing == hash => {
                    // Same hash: wait out a concurrent publisher, then
                    // compare content to rule out a 64-bit collision.
                    let mut entry = slot.entry.load(Ordering::Acquire);
                    let mut spins = 0;
                    while entry.is_null() {
                        spins += 1;
                        if spins > PUBLISH_SPIN_LIMIT {
                            return None;
                        }
                        std::hint::spin_loop();
                        entry = slot.entry.load(Ordering::Acquire);
                    }
                    let entry = unsafe { &*entry };
                    if *entry.frames == *frames {
                        entry.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(InternResult { id, created: false });
                    }
                }
                Err(_) => {}
            }
        }
        None
    }

    /// Look up an id handed out by [`intern`](StackInterner::intern).
    pub fn get(&self, id: u64) -> Option<&StackEntry> {
        let slot = self.slots.get(id as usize)?;
        let entry = slot.entry.load(Ordering::Acquire);
        if entry.is_null() {
            None
        } else {
            Some(unsafe { &*entry })
        }
    }
}

impl Drop for StackInterner {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let entry = slot.entry.load(Ordering::Acquire);
            if !entry.is_null() {
                drop(unsafe { Box::from_raw(entry) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(codes: &[usize]) -> Vec<InternedFrame> {
        codes
            .iter()
            .map(|&c| InternedFrame::interpreted(c as *const CodeDescriptor, 1))
            .collect()
    }

    #[test]
    fn identical_content_gets_one_id() {
        let interner = StackInterner::new(1 << 8);
        let stack = frames(&[0x1000, 0x2000]);
        let first = interner.intern(&stack).unwrap();
        let second = interner.intern(&stack).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(interner.unique_count(), 1);
        assert_eq!(
            interner.get(first.id).unwrap().hits.load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn distinct_content_gets_distinct_ids() {
        let interner = StackInterner::new(1 << 8);
        let a = interner.intern(&frames(&[0x1000])).unwrap();
        let b = interner.intern(&frames(&[0x2000])).unwrap();
        let c = interner.intern(&frames(&[0x1000, 0x2000])).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(interner.unique_count(), 3);
    }

    #[test]
    fn lookup_returns_stored_frames() {
        let interner = StackInterner::new(1 << 8);
        let stack = frames(&[0xa0, 0xb0, 0xc0]);
        let result = interner.intern(&stack).unwrap();
        let entry = interner.get(result.id).unwrap();
        assert_eq!(&*entry.frames, stack.as_slice());
    }

    #[test]
    fn empty_stack_is_internable() {
        let interner = StackInterner::new(1 << 8);
        let result = interner.intern(&[]).unwrap();
        assert!(interner.get(result.id).unwrap().frames.is_empty());
    }

    #[test]
    fn native_and_interpreted_frames_differ() {
        let interner = StackInterner::new(1 << 8);
        let interp = vec![InternedFrame::interpreted(
            0x1000 as *const CodeDescriptor,
            0,
        )];
        let native = vec![InternedFrame::native(0x1000)];
        let a = interner.intern(&interp).unwrap();
        let b = interner.intern(&native).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn saturated_table_returns_none() {
        let interner = StackInterner::new(2);
        assert!(interner.intern(&frames(&[1 * 8])).is_some());
        assert!(interner.intern(&frames(&[2 * 8])).is_some());
        assert!(interner.intern(&frames(&[3 * 8])).is_none());
        assert_eq!(interner.unique_count(), 2);
    }

    #[test]
    fn concurrent_interning_converges_to_one_id() {
        use std::sync::Arc;
        let interner = Arc::new(StackInterner::new(1 << 10));
        let stack = frames(&[0x1000, 0x2000, 0x3000]);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let interner = Arc::clone(&interner);
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                interner.intern(&stack).unwrap().id
            }));
        }
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(interner.unique_count(), 1);
    }
}
