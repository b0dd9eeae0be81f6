//! Fixed-capacity lock-free ring buffer between capture contexts and the
//! drain path.
//!
//! Producers may be signal handlers, so the publish path is bounded: claim
//! an index, claim the slot with one CAS, write, commit with a release
//! store. The single consumer walks `tail` and only consumes committed
//! slots. Overflow is drop-newest: the producer fails its reservation and
//! the drop is counted.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Marker for slot payloads whose all-zero byte pattern is a valid value.
/// The backing store is allocated zeroed and never eagerly initialized, so
/// untouched slots must already be valid.
///
/// # Safety
///
/// Implementors guarantee that a `T` consisting entirely of zero bytes is
/// initialized and safe to read.
pub unsafe trait ZeroableSlot: Copy {}

unsafe impl ZeroableSlot for u64 {}

pub const DEFAULT_RING_CAPACITY: usize = 1 << 16;

const EMPTY: u32 = 0;
const PUBLISHING: u32 = 1;
const COMMITTED: u32 = 2;

#[repr(C)]
struct Slot<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

#[repr(align(64))]
struct CacheLine<T>(T);

pub struct RingBuffer<T: ZeroableSlot> {
    slots: *mut Slot<T>,
    capacity: usize,
    mask: u64,
    /// Next write index. Producers race on it with `fetch_add`.
    head: CacheLine<AtomicU64>,
    /// Next read index. Only the consumer advances it.
    tail: CacheLine<AtomicU64>,
    dropped: AtomicU64,
}

unsafe impl<T: ZeroableSlot + Send> Send for RingBuffer<T> {}
unsafe impl<T: ZeroableSlot + Send> Sync for RingBuffer<T> {}

impl<T: ZeroableSlot> RingBuffer<T> {
    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let layout = Layout::array::<Slot<T>>(capacity).expect("ring layout overflow");
        // Zeroed allocation: state words start EMPTY and payloads are valid
        // per ZeroableSlot. Pages are only faulted in as slots get written.
        let slots = unsafe { alloc_zeroed(layout) } as *mut Slot<T>;
        assert!(!slots.is_null(), "ring allocation failed");
        RingBuffer {
            slots,
            capacity,
            mask: capacity as u64 - 1,
            head: CacheLine(AtomicU64::new(0)),
            tail: CacheLine(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Published-but-not-yet-consumed count. Approximate under concurrency.
    pub fn approx_len(&self) -> u64 {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    fn slot(&self, index: u64) -> &Slot<T> {
        unsafe { &*self.slots.add((index & self.mask) as usize) }
    }

    /// Publish one sample. `fill` writes the payload in place; it runs in
    /// the caller's context, so for signal-handler producers it must be
    /// async-signal-safe. Returns false (and counts the drop) when the
    /// buffer is full.
    pub fn try_publish<F: FnOnce(&mut T)>(&self, fill: F) -> bool {
        let claimed = self.head.0.fetch_add(1, Ordering::AcqRel);
        let tail = self.tail.0.load(Ordering::Acquire);
        if claimed.wrapping_sub(tail) >= self.capacity as u64 {
            self.head.0.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let slot = self.slot(claimed);
        // The state CAS is the real claim: a stalled reservation elsewhere
        // can hand two producers the same index, and losing the CAS means
        // this slot is taken.
        if slot
            .state
            .compare_exchange(EMPTY, PUBLISHING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.head.0.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        fill(unsafe { &mut *slot.value.get() });
        slot.state.store(COMMITTED, Ordering::Release);
        true
    }

    /// Consume one sample into `out`. Single consumer only. Returns false
    /// when the next slot is empty or still being published.
    pub fn pop_into(&self, out: &mut T) -> bool {
        let tail = self.tail.0.load(Ordering::Acquire);
        let slot = self.slot(tail);
        if slot.state.load(Ordering::Acquire) != COMMITTED {
            return false;
        }
        *out = unsafe { *slot.value.get() };
        slot.state.store(EMPTY, Ordering::Release);
        self.tail.0.store(tail + 1, Ordering::Release);
        true
    }
}

impl<T: ZeroableSlot> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let layout = Layout::array::<Slot<T>>(self.capacity).expect("ring layout overflow");
        unsafe { dealloc(self.slots as *mut u8, layout) };
    }
}
