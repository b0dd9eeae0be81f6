//! Monotonic nanosecond clock, usable from capture context.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_os = "macos")] {
        use std::sync::OnceLock;

        use mach2::mach_time;

        static NANOS_PER_TICK: OnceLock<mach_time::mach_timebase_info> = OnceLock::new();

        /// Nanoseconds on the monotonic clock. `mach_absolute_time` is a
        /// plain register read plus a scale, safe in any context.
        pub fn monotonic_nanos() -> u64 {
            let nanos_per_tick = NANOS_PER_TICK.get_or_init(|| unsafe {
                let mut info = mach_time::mach_timebase_info::default();
                let errno = mach_time::mach_timebase_info(&mut info as *mut _);
                if errno != 0 || info.denom == 0 {
                    info.numer = 1;
                    info.denom = 1;
                };
                info
            });

            let time = unsafe { mach_time::mach_absolute_time() };

            time * nanos_per_tick.numer as u64 / nanos_per_tick.denom as u64
        }

        /// Must be called once from a normal context before any capture
        /// context reads the clock, so the timebase is already cached.
        pub fn warm_up() {
            let _ = monotonic_nanos();
        }
    } else {
        /// Nanoseconds on `CLOCK_MONOTONIC`. `clock_gettime` is on the
        /// POSIX async-signal-safe list.
        pub fn monotonic_nanos() -> u64 {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            if rc != 0 {
                return 0;
            }
            ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
        }

        pub fn warm_up() {}
    }
}
