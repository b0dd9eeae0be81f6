//! Stack walker: turns a thread's interpreter state into a leaf-first array
//! of captured frame references, plus an optional native-frame suffix.
//!
//! The walker runs in whatever context its sampler backend dictates — a
//! signal handler in the worst case — so it allocates nothing, takes no
//! locks, and never dereferences a code descriptor. It copies pointers and
//! indices; the drain path does the dereferencing through the code-object
//! registry.

use std::sync::atomic::Ordering;

use crate::host::{FrameRecord, ThreadState};
use crate::sample::{CapturedFrame, RawSample, MAX_NATIVE_DEPTH, MAX_STACK_DEPTH};

/// Native stacks that end before this depth usually mean a missing
/// frame-pointer prologue somewhere in a C extension.
pub const SHALLOW_NATIVE_DEPTH: u16 = 3;

/// Largest plausible distance between two adjacent native frames.
const MAX_NATIVE_FRAME_SPAN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkError {
    /// No thread state was supplied (signal with no registered thread).
    NoThreadState,
    /// The frame chain failed validation: misaligned or implausible
    /// pointers, or a chain that never terminates.
    InvalidState,
}

fn plausible_frame_ptr(ptr: *const FrameRecord) -> bool {
    let addr = ptr as usize;
    // Reject the null page and non-canonical / unaligned addresses.
    addr >= 4096
        && addr & (std::mem::align_of::<FrameRecord>() - 1) == 0
        && (addr as u64) < (1u64 << 48)
}

fn plausible_code_ptr(ptr: *const crate::host::CodeDescriptor) -> bool {
    let addr = ptr as usize;
    addr >= 4096 && addr & 7 == 0 && (addr as u64) < (1u64 << 48)
}

/// Walk the interpreter frame chain of `state` into `out.frames`,
/// leaf-first. A null current frame is a valid observation of an idle
/// thread and produces an empty sample (`out.depth == 0`).
///
/// # Safety
///
/// `state`, when non-null, must point to a live `ThreadState` whose frame
/// chain consists of live `FrameRecord`s; the host guarantees this while
/// the thread is registered and either suspended, lock-held, or running
/// with release-ordered frame updates.
pub(crate) unsafe fn walk_interpreter(
    state: *const ThreadState,
    max_depth: usize,
    out: &mut RawSample,
) -> Result<(), WalkError> {
    out.clear();
    if state.is_null() {
        return Err(WalkError::NoThreadState);
    }
    let state = &*state;
    out.os_tid = state.os_tid;

    if state.shutting_down.load(Ordering::Acquire) != 0 {
        return Ok(());
    }

    let max_depth = max_depth.clamp(1, MAX_STACK_DEPTH);
    let mut frame = state.current_frame.load(Ordering::Acquire) as *const FrameRecord;
    if frame.is_null() {
        return Ok(());
    }

    let mut depth = 0usize;
    let mut visited = 0usize;

    while !frame.is_null() {
        if !plausible_frame_ptr(frame) {
            out.clear();
            return Err(WalkError::InvalidState);
        }
        // A cycle in the chain never terminates; bound the traversal
        // instead of tracking identities, which would cost allocation.
        visited += 1;
        if visited > max_depth * 2 {
            out.clear();
            return Err(WalkError::InvalidState);
        }

        let record = &*frame;
        let code = record.code.load(Ordering::Acquire) as *const crate::host::CodeDescriptor;
        let lasti = record.lasti.load(Ordering::Acquire);

        if depth < max_depth {
            if !code.is_null() && !plausible_code_ptr(code) {
                out.clear();
                return Err(WalkError::InvalidState);
            }
            out.frames[depth] = CapturedFrame { code, lasti };
            depth += 1;
        } else {
            out.truncated = true;
        }

        frame = record.back.load(Ordering::Acquire) as *const FrameRecord;
    }

    out.depth = depth as u16;
    Ok(())
}

/// Append a native-frame suffix to `out` by walking saved frame pointers
/// starting at `fp`. Bounded, validated, allocation-free. Returns the
/// number of instruction pointers collected.
///
/// # Safety
///
/// `fp` must be the frame pointer of a live stack in this process (the
/// caller's own stack, or that of a thread that cannot run concurrently).
pub(crate) unsafe fn walk_native(fp: usize, out: &mut RawSample) -> usize {
    let mut fp = fp;
    let start = fp;
    let mut count = 0usize;

    while count < MAX_NATIVE_DEPTH {
        if fp == 0 || fp & 7 != 0 {
            break;
        }
        // Frame layout: [saved_fp, return_addr].
        let saved_fp = std::ptr::read_volatile(fp as *const usize);
        let return_addr = std::ptr::read_volatile((fp + 8) as *const usize);
        if return_addr < 4096 {
            break;
        }
        out.native_ips[count] = return_addr as u64;
        count += 1;

        // Stacks grow down, so each caller frame sits above the last; a
        // non-increasing or far-away saved pointer means the chain is gone.
        if saved_fp <= fp || saved_fp - fp > MAX_NATIVE_FRAME_SPAN || saved_fp - start > (8 << 20) {
            break;
        }
        fp = saved_fp;
    }

    out.native_depth = count as u16;
    count
}

/// Frame pointer of the calling function, or 0 on architectures where we
/// cannot read it.
#[inline(always)]
pub(crate) fn current_frame_pointer() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        let fp: usize;
        unsafe { std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack)) };
        fp
    }
    #[cfg(target_arch = "aarch64")]
    {
        let fp: usize;
        unsafe { std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack)) };
        fp
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        0
    }
}

/// Whether native-frame capture works on this build.
pub fn native_unwinding_available() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// A resolved native frame, as returned by [`capture_native_stack`] and by
/// drain-time symbolication of native instruction pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub ip: u64,
    /// Symbol name, `"?"` when unresolved.
    pub symbol: String,
    /// Object file the address belongs to, empty when unknown.
    pub filename: String,
    /// Offset from the symbol start.
    pub offset: u64,
    pub resolved: bool,
}

/// Resolve one native instruction pointer via `dladdr`.
pub(crate) fn resolve_native_ip(ip: u64) -> NativeFrame {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) };
    if rc == 0 {
        return NativeFrame {
            ip,
            symbol: "?".to_string(),
            filename: String::new(),
            offset: 0,
            resolved: false,
        };
    }

    let symbol = if info.dli_sname.is_null() {
        None
    } else {
        Some(
            unsafe { std::ffi::CStr::from_ptr(info.dli_sname) }
                .to_string_lossy()
                .into_owned(),
        )
    };
    let filename = if info.dli_fname.is_null() {
        String::new()
    } else {
        unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned()
    };
    let offset = if info.dli_saddr.is_null() {
        0
    } else {
        ip.saturating_sub(info.dli_saddr as u64)
    };

    NativeFrame {
        ip,
        resolved: symbol.is_some(),
        symbol: symbol.unwrap_or_else(|| "?".to_string()),
        filename,
        offset,
    }
}

/// Capture and resolve the current native call stack. A debugging aid, not
/// part of the sampling hot path.
pub fn capture_native_stack() -> Vec<NativeFrame> {
    let mut scratch: Box<RawSample> = Box::new(unsafe { std::mem::zeroed() });
    let fp = current_frame_pointer();
    if fp == 0 {
        return Vec::new();
    }
    let count = unsafe { walk_native(fp, &mut scratch) };
    scratch.native_ips[..count]
        .iter()
        .map(|&ip| resolve_native_ip(ip))
        .collect()
}
