//! Poisson-sampling heap profiler.
//!
//! The host's allocator hooks call [`AllocationProfiler::record_alloc`] and
//! [`AllocationProfiler::record_free`]. A Poisson process over allocated
//! bytes picks a statistically representative subset of allocations; each
//! recorded allocation carries its interned call stack and a weight of
//! `max(size, sampling_rate_bytes)`, so summed weights estimate true heap
//! totals. Frees are matched through a counting bloom filter and the
//! lock-free heap-address map, giving live/freed distinction and lifetimes.

mod bloom;
mod heap_map;
mod intern;
mod poisson;

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_derive::Serialize;
use spprof_profile::flamejson::{Document, DocumentBuilder, WeightUnit};
use spprof_profile::{collapsed, Frame};

use crate::error::{ProfilerError, Result};
use crate::host::HostRuntime;
use crate::sample::{RawSample, MAX_STACK_DEPTH};
use crate::session::Lifecycle;
use crate::time;
use crate::walker::{self, SHALLOW_NATIVE_DEPTH};

use bloom::{CountingBloom, BLOOM_CELLS};
use heap_map::{AllocationRecord, FreeOutcome, HeapAddressMap, InsertOutcome};
use intern::{InternedFrame, StackEntry, StackInterner};
use poisson::{next_sample_distance, XorShift128Plus};

pub(crate) use heap_map::DEFAULT_HEAP_MAP_SLOTS;
pub(crate) use intern::DEFAULT_STACK_TABLE_SLOTS;

/// Memory profiling configuration.
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Mean bytes between samples. Minimum 1024; default 512 KiB.
    pub sampling_rate_bytes: u64,
    /// Interpreter frames kept per allocation stack.
    pub max_stack_depth: usize,
    /// Also record a native-frame suffix under each allocation.
    pub capture_native: bool,
    /// Heap map capacity in slots; power of two.
    pub heap_map_slots: usize,
    /// Stack interner capacity in slots; power of two.
    pub stack_table_slots: usize,
}

pub const DEFAULT_SAMPLING_RATE_BYTES: u64 = 512 * 1024;

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            sampling_rate_bytes: DEFAULT_SAMPLING_RATE_BYTES,
            max_stack_depth: 64,
            capture_native: false,
            heap_map_slots: DEFAULT_HEAP_MAP_SLOTS,
            stack_table_slots: DEFAULT_STACK_TABLE_SLOTS,
        }
    }
}

impl MemConfig {
    fn validate(&self) -> Result<()> {
        if self.sampling_rate_bytes < 1024 {
            return Err(ProfilerError::InvalidConfig(
                "sampling_rate_bytes must be >= 1024",
            ));
        }
        if self.max_stack_depth < 1 || self.max_stack_depth > MAX_STACK_DEPTH {
            return Err(ProfilerError::InvalidConfig(
                "max_stack_depth must be between 1 and 256",
            ));
        }
        if !self.heap_map_slots.is_power_of_two() || !self.stack_table_slots.is_power_of_two() {
            return Err(ProfilerError::InvalidConfig(
                "table capacities must be powers of two",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemCounters {
    total_samples: AtomicU64,
    freed_samples: AtomicU64,
    live_count: AtomicU64,
    live_weight: AtomicU64,
    reentrant_skips: AtomicU64,
    drops_heap_full: AtomicU64,
    drops_stack_table_full: AtomicU64,
    zombie_races: AtomicU64,
    double_frees: AtomicU64,
    death_during_birth: AtomicU64,
    shallow_native: AtomicU64,
    native_stacks: AtomicU64,
    native_depth_sum: AtomicU64,
    native_depth_min: AtomicU64,
}

impl MemCounters {
    fn reset(&self) {
        self.total_samples.store(0, Ordering::Relaxed);
        self.freed_samples.store(0, Ordering::Relaxed);
        self.live_count.store(0, Ordering::Relaxed);
        self.live_weight.store(0, Ordering::Relaxed);
        self.reentrant_skips.store(0, Ordering::Relaxed);
        self.drops_heap_full.store(0, Ordering::Relaxed);
        self.drops_stack_table_full.store(0, Ordering::Relaxed);
        self.zombie_races.store(0, Ordering::Relaxed);
        self.double_frees.store(0, Ordering::Relaxed);
        self.death_during_birth.store(0, Ordering::Relaxed);
        self.shallow_native.store(0, Ordering::Relaxed);
        self.native_stacks.store(0, Ordering::Relaxed);
        self.native_depth_sum.store(0, Ordering::Relaxed);
        self.native_depth_min.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Statistics of the memory profiler. Counters are monotonic within a
/// session.
#[derive(Debug, Clone, Serialize)]
pub struct MemStats {
    pub total_samples: u64,
    pub live_samples: u64,
    pub freed_samples: u64,
    pub unique_stacks: u64,
    pub estimated_heap_bytes: u64,
    pub heap_map_load_percent: f64,
    pub collisions: u64,
    pub sampling_rate_bytes: u64,
    pub shallow_stack_warnings: u64,
    pub death_during_birth: u64,
    pub zombie_races_detected: u64,
    pub double_frees: u64,
    pub reentrant_skips: u64,
    pub drops_heap_full: u64,
    pub drops_stack_table_full: u64,
}

/// Quality signal for native stack capture: how often frame-pointer walks
/// terminated implausibly early.
#[derive(Debug, Clone, Serialize)]
pub struct FramePointerHealth {
    pub shallow_stack_warnings: u64,
    pub total_native_stacks: u64,
    pub avg_native_depth: f64,
    pub min_native_depth: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl FramePointerHealth {
    pub fn truncation_rate(&self) -> f64 {
        if self.total_native_stacks == 0 {
            return 0.0;
        }
        self.shallow_stack_warnings as f64 / self.total_native_stacks as f64
    }

    pub fn confidence(&self) -> Confidence {
        let rate = self.truncation_rate();
        if rate < 0.05 {
            Confidence::High
        } else if rate < 0.20 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn recommendation(&self) -> Option<String> {
        match self.confidence() {
            Confidence::High => None,
            _ => Some(
                "many native stacks ended early; rebuild C extensions with \
                 frame-pointer support (-fno-omit-frame-pointer) for deeper stacks"
                    .to_string(),
            ),
        }
    }
}

/// One sampled allocation in a snapshot.
#[derive(Debug, Clone)]
pub struct AllocationSample {
    pub address: u64,
    pub size: u64,
    /// Bytes this sample statistically represents.
    pub weight: u64,
    pub estimated_bytes: u64,
    pub timestamp_ns: u64,
    /// `Some(free - birth)` once the allocation was freed.
    pub lifetime_ns: Option<u64>,
    /// Leaf-first resolved stack.
    pub stack: Vec<Frame>,
}

impl AllocationSample {
    pub fn is_live(&self) -> bool {
        self.lifetime_ns.is_none()
    }
}

/// One row of [`HeapSnapshot::top_allocators`].
#[derive(Debug, Clone, Serialize)]
pub struct TopAllocator {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub sample_count: u64,
    pub estimated_bytes: u64,
}

/// A consistent-by-construction view of the live sampled heap.
#[derive(Debug, Clone)]
pub struct HeapSnapshot {
    pub samples: Vec<AllocationSample>,
    pub total_samples: u64,
    pub live_samples: u64,
    pub estimated_heap_bytes: u64,
    pub timestamp_ns: u64,
    pub frame_pointer_health: FramePointerHealth,
}

impl HeapSnapshot {
    /// Group live samples by their leaf frame and rank by estimated bytes.
    pub fn top_allocators(&self, n: usize) -> Vec<TopAllocator> {
        let mut by_site: FxHashMap<(String, String, u32), (u64, u64)> = FxHashMap::default();
        for sample in &self.samples {
            let Some(leaf) = sample.stack.first() else {
                continue;
            };
            let key = (
                leaf.function_name.clone(),
                leaf.filename.clone(),
                leaf.line,
            );
            let entry = by_site.entry(key).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += sample.weight;
        }

        let mut rows: Vec<TopAllocator> = by_site
            .into_iter()
            .map(|((function, file, line), (count, bytes))| TopAllocator {
                function,
                file,
                line,
                sample_count: count,
                estimated_bytes: bytes,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.estimated_bytes
                .cmp(&a.estimated_bytes)
                .then_with(|| a.function.cmp(&b.function))
        });
        rows.truncate(n);
        rows
    }

    /// Flame-graph JSON with byte weights: one `"heap"` profile whose
    /// samples are the live allocation stacks.
    pub fn to_flame_json(&self) -> Document {
        let mut builder = DocumentBuilder::new("spprof memory profile");
        let handle = builder.add_profile("heap", WeightUnit::Bytes, 0, self.estimated_heap_bytes);
        for sample in &self.samples {
            builder.add_sample(handle, &sample.stack, sample.weight);
        }
        builder.finish()
    }

    /// Collapsed stacks weighted by estimated bytes.
    pub fn to_collapsed(&self) -> String {
        collapsed::render(
            self.samples
                .iter()
                .map(|s| (s.stack.as_slice(), s.weight)),
        )
    }
}

struct ThreadSampleState {
    rng: XorShift128Plus,
    bytes_until_next: u64,
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
    static SAMPLE_STATE: RefCell<Option<ThreadSampleState>> = const { RefCell::new(None) };
}

/// Re-entrancy guard: the profiler's own tables allocate, and those
/// allocations come back through the host's hook.
struct HookGuard;

impl HookGuard {
    fn enter() -> Option<HookGuard> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(HookGuard)
            }
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

pub(crate) struct MemInner {
    host: Arc<dyn HostRuntime>,
    lifecycle: Mutex<Lifecycle>,
    alloc_armed: AtomicBool,
    free_armed: AtomicBool,
    rate_bytes: AtomicU64,
    config: MemConfig,
    map: HeapAddressMap,
    interner: StackInterner,
    bloom: CountingBloom,
    seq: AtomicU64,
    seed_counter: AtomicU64,
    base_seed: u64,
    counters: MemCounters,
}

/// The Poisson-sampling heap profiler. Clone-cheap handle; the host's
/// allocator hooks keep one and call [`record_alloc`] / [`record_free`].
///
/// [`record_alloc`]: AllocationProfiler::record_alloc
/// [`record_free`]: AllocationProfiler::record_free
#[derive(Clone)]
pub struct AllocationProfiler {
    inner: Arc<MemInner>,
}

impl AllocationProfiler {
    pub fn new(host: Arc<dyn HostRuntime>) -> AllocationProfiler {
        AllocationProfiler::with_config(host, MemConfig::default())
    }

    /// Tables are sized once, here; `start` only arms the hooks.
    pub fn with_config(host: Arc<dyn HostRuntime>, config: MemConfig) -> AllocationProfiler {
        let map = HeapAddressMap::new(config.heap_map_slots);
        let interner = StackInterner::new(config.stack_table_slots);
        let bloom = CountingBloom::new(BLOOM_CELLS);
        let counters = MemCounters::default();
        counters.native_depth_min.store(u64::MAX, Ordering::Relaxed);
        let profiler = AllocationProfiler {
            inner: Arc::new(MemInner {
                host,
                lifecycle: Mutex::new(Lifecycle::Idle),
                alloc_armed: AtomicBool::new(false),
                free_armed: AtomicBool::new(false),
                rate_bytes: AtomicU64::new(config.sampling_rate_bytes),
                config,
                map,
                interner,
                bloom,
                seq: AtomicU64::new(0),
                seed_counter: AtomicU64::new(0),
                base_seed: rand::thread_rng().gen(),
                counters,
            }),
        };
        crate::fork::register_mem(&profiler.inner);
        profiler
    }

    /// Arm the hooks with the given sampling rate. Fails on double-start
    /// and permanently after [`shutdown`](AllocationProfiler::shutdown).
    pub fn start(&self, sampling_rate_bytes: u64) -> Result<()> {
        let config = MemConfig {
            sampling_rate_bytes,
            ..self.inner.config.clone()
        };
        config.validate()?;

        let mut lifecycle = self.inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::ShutDown => return Err(ProfilerError::ShutDown),
            _ => return Err(ProfilerError::AlreadyRunning),
        }

        // Fresh session: previous records and stats go, interned stacks
        // stay (ids are stable for the profiler's lifetime).
        self.inner.map.clear();
        self.inner.bloom.clear();
        self.inner.counters.reset();
        self.inner
            .rate_bytes
            .store(sampling_rate_bytes, Ordering::Release);

        self.inner.free_armed.store(true, Ordering::Release);
        self.inner.alloc_armed.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Disarm the allocation hook. The free hook stays armed so objects
    /// allocated during the session and freed after it do not show up as
    /// leaks. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle != Lifecycle::Running {
            return;
        }
        self.inner.alloc_armed.store(false, Ordering::Release);
        *lifecycle = Lifecycle::Idle;
    }

    /// One-way: disarm both hooks and refuse any future `start`. The
    /// tables are deliberately kept alive — an allocator callback may still
    /// be mid-flight on another thread, and freeing under it is worse than
    /// the memory. Idempotent.
    pub fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        self.inner.alloc_armed.store(false, Ordering::Release);
        self.inner.free_armed.store(false, Ordering::Release);
        *lifecycle = Lifecycle::ShutDown;
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Make the calling thread's interpreter state visible to the
    /// allocation hook, so sampled allocations carry stacks. Threads
    /// already registered with the CPU profiler do not need this.
    ///
    /// # Safety
    ///
    /// `state` must stay valid for the rest of the thread's lifetime.
    pub unsafe fn register_thread(&self, state: *const crate::host::ThreadState) -> bool {
        if state.is_null() {
            return false;
        }
        if !crate::sampler::current_reg().is_null() {
            return true;
        }
        let reg = Box::into_raw(crate::sampler::ThreadReg::new(state, (*state).os_tid));
        crate::sampler::set_current_reg(reg);
        true
    }

    /// Allocator hook: the host calls this after every successful
    /// allocation, with its global execution lock held.
    pub fn record_alloc(&self, addr: u64, size: u64) {
        let inner = &*self.inner;
        if addr == 0 || !inner.alloc_armed.load(Ordering::Acquire) || crate::fork::lockout() {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            inner.counters.reentrant_skips.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let rate = inner.rate_bytes.load(Ordering::Relaxed);
        let sampled = SAMPLE_STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            let state = state.get_or_insert_with(|| {
                let nth = inner.seed_counter.fetch_add(1, Ordering::Relaxed);
                let mut rng = XorShift128Plus::new(inner.base_seed ^ nth);
                let bytes_until_next = next_sample_distance(&mut rng, rate);
                ThreadSampleState {
                    rng,
                    bytes_until_next,
                }
            });
            if size < state.bytes_until_next {
                state.bytes_until_next -= size;
                false
            } else {
                state.bytes_until_next = next_sample_distance(&mut state.rng, rate);
                true
            }
        });
        if !sampled {
            return;
        }

        inner.record_sample(addr, size, rate);
    }

    /// Allocator hook: the host calls this on every free.
    pub fn record_free(&self, addr: u64) {
        let inner = &*self.inner;
        if addr == 0 || !inner.free_armed.load(Ordering::Acquire) || crate::fork::lockout() {
            return;
        }
        let Some(_guard) = HookGuard::enter() else {
            inner.counters.reentrant_skips.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // The fence sequence must predate the map probe: any record born
        // after this point belongs to a newer life of the address.
        let fence_seq = inner.seq.load(Ordering::Acquire);
        if !inner.bloom.may_contain(addr) {
            return;
        }

        match inner.map.free(addr, time::monotonic_nanos(), fence_seq) {
            FreeOutcome::Freed(record) => {
                inner.counters.freed_samples.fetch_add(1, Ordering::Relaxed);
                inner.counters.live_count.fetch_sub(1, Ordering::Relaxed);
                inner
                    .counters
                    .live_weight
                    .fetch_sub(record.weight, Ordering::Relaxed);
                inner.bloom.remove(addr);
            }
            FreeOutcome::DoubleFree => {
                inner.counters.double_frees.fetch_add(1, Ordering::Relaxed);
            }
            FreeOutcome::DeathDuringBirth => {
                inner
                    .counters
                    .death_during_birth
                    .fetch_add(1, Ordering::Relaxed);
            }
            FreeOutcome::ZombieRace => {
                inner.counters.zombie_races.fetch_add(1, Ordering::Relaxed);
            }
            FreeOutcome::NotFound => {}
        }
    }

    /// Current statistics. Cheap: everything is maintained incrementally.
    pub fn stats(&self) -> MemStats {
        let inner = &*self.inner;
        let c = &inner.counters;
        MemStats {
            total_samples: c.total_samples.load(Ordering::Relaxed),
            live_samples: c.live_count.load(Ordering::Relaxed),
            freed_samples: c.freed_samples.load(Ordering::Relaxed),
            unique_stacks: inner.interner.unique_count(),
            estimated_heap_bytes: c.live_weight.load(Ordering::Relaxed),
            heap_map_load_percent: inner.map.load_percent(),
            collisions: inner.map.collisions(),
            sampling_rate_bytes: inner.rate_bytes.load(Ordering::Relaxed),
            shallow_stack_warnings: c.shallow_native.load(Ordering::Relaxed),
            death_during_birth: c.death_during_birth.load(Ordering::Relaxed),
            zombie_races_detected: c.zombie_races.load(Ordering::Relaxed),
            double_frees: c.double_frees.load(Ordering::Relaxed),
            reentrant_skips: c.reentrant_skips.load(Ordering::Relaxed),
            drops_heap_full: c.drops_heap_full.load(Ordering::Relaxed),
            drops_stack_table_full: c.drops_stack_table_full.load(Ordering::Relaxed),
        }
    }

    /// Materialize the live records with resolved stacks. Iteration is
    /// relaxed: allocations racing the snapshot may or may not appear.
    pub fn snapshot(&self) -> HeapSnapshot {
        let inner = &*self.inner;
        let mut raw: Vec<(u64, AllocationRecord)> = Vec::new();
        inner.map.for_each(|addr, record, live| {
            if live {
                raw.push((addr, record));
            }
        });

        let mut stack_cache: FxHashMap<u64, Vec<Frame>> = FxHashMap::default();
        let mut describe_cache: FxHashMap<(usize, u32), Frame> = FxHashMap::default();
        let mut native_cache: FxHashMap<u64, Frame> = FxHashMap::default();
        let mut samples = Vec::with_capacity(raw.len());
        let mut estimated: u64 = 0;

        for (addr, record) in raw {
            let stack = stack_cache
                .entry(record.stack_id)
                .or_insert_with(|| match inner.interner.get(record.stack_id) {
                    Some(entry) => {
                        resolve_stack(inner, entry, &mut describe_cache, &mut native_cache)
                    }
                    None => Vec::new(),
                })
                .clone();

            estimated += record.weight;
            samples.push(AllocationSample {
                address: addr,
                size: record.size,
                weight: record.weight,
                estimated_bytes: record.weight,
                timestamp_ns: record.birth_ns,
                lifetime_ns: None,
                stack,
            });
        }

        let c = &inner.counters;
        let native_stacks = c.native_stacks.load(Ordering::Relaxed);
        let min_depth = c.native_depth_min.load(Ordering::Relaxed);
        HeapSnapshot {
            live_samples: samples.len() as u64,
            total_samples: c.total_samples.load(Ordering::Relaxed),
            estimated_heap_bytes: estimated,
            timestamp_ns: time::monotonic_nanos(),
            frame_pointer_health: FramePointerHealth {
                shallow_stack_warnings: c.shallow_native.load(Ordering::Relaxed),
                total_native_stacks: native_stacks,
                avg_native_depth: if native_stacks == 0 {
                    0.0
                } else {
                    c.native_depth_sum.load(Ordering::Relaxed) as f64 / native_stacks as f64
                },
                min_native_depth: if min_depth == u64::MAX { 0 } else { min_depth },
            },
            samples,
        }
    }
}

impl MemInner {
    /// Reset per-process state in a forked child: both hooks disarmed, the
    /// lifecycle back to Idle so the child can start its own session.
    /// Inherited records are discarded at that next start.
    pub(crate) fn fork_child_reset(&self) {
        self.alloc_armed.store(false, Ordering::Release);
        self.free_armed.store(false, Ordering::Release);
        if let Some(mut lifecycle) = self.lifecycle.try_lock() {
            if *lifecycle != Lifecycle::ShutDown {
                *lifecycle = Lifecycle::Idle;
            }
        }
    }

    fn record_sample(&self, addr: u64, size: u64, rate: u64) {
        let frames = self.capture_stack();
        let stack_id = match self.interner.intern(&frames) {
            Some(result) => {
                if result.created {
                    // First sighting of this stack: pin its descriptors so
                    // snapshot resolution stays safe. Allocator hooks run
                    // with the host lock held, so retaining is legal here.
                    for frame in frames.iter().filter(|f| !f.is_native) {
                        if !frame.code.is_null() {
                            unsafe { self.host.retain_code(frame.code) };
                        }
                    }
                }
                result.id
            }
            None => {
                self.counters
                    .drops_stack_table_full
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let weight = size.max(rate);
        let record = AllocationRecord {
            size,
            weight,
            birth_ns: time::monotonic_nanos(),
            free_ns: 0,
            stack_id,
            gc_epoch: self.host.gc_epoch(),
            seq: self.seq.fetch_add(1, Ordering::AcqRel) + 1,
        };

        match self.map.insert(addr, &record) {
            InsertOutcome::Inserted => {
                self.counters.total_samples.fetch_add(1, Ordering::Relaxed);
                self.counters.live_count.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .live_weight
                    .fetch_add(weight, Ordering::Relaxed);
                self.bloom.add(addr);
            }
            InsertOutcome::Reused { was_live, prev } => {
                self.counters.total_samples.fetch_add(1, Ordering::Relaxed);
                if was_live {
                    // The previous record's free was never observed; its
                    // weight leaves the estimate as this one enters. The
                    // bloom cells for this address are already set.
                    self.counters
                        .live_weight
                        .fetch_add(weight, Ordering::Relaxed);
                    self.counters
                        .live_weight
                        .fetch_sub(prev.weight, Ordering::Relaxed);
                } else {
                    self.counters.live_count.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .live_weight
                        .fetch_add(weight, Ordering::Relaxed);
                    self.bloom.add(addr);
                }
            }
            InsertOutcome::Full => {
                self.counters.drops_heap_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn capture_stack(&self) -> Vec<InternedFrame> {
        let mut frames = Vec::with_capacity(self.config.max_stack_depth);
        let reg = crate::sampler::current_reg();
        if reg.is_null() {
            return frames;
        }

        // A fresh scratch rather than the registration's: a SIGPROF
        // handler on this thread would clobber the shared one mid-walk.
        let mut scratch: Box<RawSample> = Box::new(unsafe { std::mem::zeroed() });
        let state = unsafe { (*reg).state };
        if unsafe { walker::walk_interpreter(state, self.config.max_stack_depth, &mut scratch) }
            .is_err()
        {
            return frames;
        }
        for captured in scratch.interpreter_frames() {
            frames.push(InternedFrame::interpreted(captured.code, captured.lasti));
        }

        if self.config.capture_native && walker::native_unwinding_available() {
            let fp = walker::current_frame_pointer();
            if fp != 0 {
                let depth = unsafe { walker::walk_native(fp, &mut scratch) };
                for &ip in scratch.native_frames() {
                    frames.push(InternedFrame::native(ip));
                }
                self.counters.native_stacks.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .native_depth_sum
                    .fetch_add(depth as u64, Ordering::Relaxed);
                self.counters
                    .native_depth_min
                    .fetch_min(depth as u64, Ordering::Relaxed);
                if (depth as u16) < SHALLOW_NATIVE_DEPTH {
                    self.counters.shallow_native.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        frames
    }
}

fn resolve_stack(
    inner: &MemInner,
    entry: &StackEntry,
    describe_cache: &mut FxHashMap<(usize, u32), Frame>,
    native_cache: &mut FxHashMap<u64, Frame>,
) -> Vec<Frame> {
    entry
        .frames
        .iter()
        .map(|frame| {
            if frame.is_native {
                native_cache
                    .entry(frame.native_ip)
                    .or_insert_with(|| {
                        let resolved = walker::resolve_native_ip(frame.native_ip);
                        Frame::native(&resolved.symbol, &resolved.filename)
                    })
                    .clone()
            } else if frame.code.is_null() {
                Frame::interpreted("<unknown>", "<unknown>", frame.lasti)
            } else {
                describe_cache
                    .entry((frame.code as usize, frame.lasti))
                    .or_insert_with(|| {
                        // Interned descriptors hold strong references, so
                        // the dereference is safe without the global lock.
                        match unsafe { inner.host.describe_code(frame.code, frame.lasti) } {
                            Some(info) => Frame::interpreted(
                                &info.function_name,
                                &info.filename,
                                info.line,
                            ),
                            None => {
                                warn!(
                                    "host did not recognize retained descriptor {:p}",
                                    frame.code
                                );
                                Frame::interpreted("<unknown>", "<unknown>", frame.lasti)
                            }
                        }
                    })
                    .clone()
            }
        })
        .collect()
}
