//! End-to-end CPU profiling against the mock host runtime, driven by the
//! supervisor backend so the tests behave identically on every platform.

mod common;

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use common::{install_stack, leak_thread_state, session_guard, MockRuntime};
use spprof::{BackendChoice, CpuConfig, Profiler, ProfilerError};

fn supervisor_config(interval_ms: u64) -> CpuConfig {
    CpuConfig {
        interval_ms,
        backend: BackendChoice::Supervisor,
        ..CpuConfig::default()
    }
}

#[test]
fn empty_session_produces_empty_profile() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let profiler = Profiler::new(host);

    profiler.start(supervisor_config(10)).unwrap();
    sleep(Duration::from_millis(5));
    let profile = profiler.stop_and_collect().unwrap();

    assert_eq!(profile.sample_count(), 0);
    assert_eq!(profile.dropped_count, 0);
    let doc = profile.to_flame_json();
    assert!(doc.profiles.is_empty());
    assert_eq!(profile.to_collapsed(), "");
}

#[test]
fn hot_loop_attributes_samples_to_the_leaf() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let outer = host.add_code("outer", "app.x", 10);
    let inner = host.add_code("inner", "app.x", 50);

    let state = leak_thread_state(1);
    let _frames = install_stack(state, &[(outer, 0), (inner, 3)]);
    host.add_thread(1, state);
    host.set_thread_name(1, "main");

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(300));
    let profile = profiler.stop_and_collect().unwrap();

    // 300ms at 1ms nominal: well over a hundred even with scheduler slop.
    assert!(
        profile.sample_count() >= 50,
        "only {} samples collected",
        profile.sample_count()
    );
    assert_eq!(profile.dropped_count, 0);

    let sample = &profile.samples[0];
    assert_eq!(sample.thread_id, 1);
    assert_eq!(sample.thread_name.as_deref(), Some("main"));
    assert_eq!(sample.frames[0].function_name, "inner");
    assert_eq!(sample.frames[0].line, 53, "line 50 plus instruction index 3");
    assert_eq!(sample.frames[1].function_name, "outer");

    assert_eq!(profile.runtime_version, "mock-1.0");
    assert!(!profile.platform.is_empty());
}

#[test]
fn tight_loop_aggregates_with_high_compression() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("hot", "app.x", 1);
    let state = leak_thread_state(2);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(2, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(100));
    let profile = profiler.stop_and_collect().unwrap();
    assert!(profile.sample_count() >= 20);

    let agg = profile.aggregate();
    assert!(agg.unique_stack_count() <= profile.sample_count());
    assert_eq!(agg.unique_stack_count(), 1, "one stack, sampled repeatedly");
    assert!(agg.compression_ratio() >= 10.0);
    let total: u64 = agg.stacks.iter().map(|s| s.count).sum();
    assert_eq!(total, profile.sample_count() as u64);
}

#[test]
fn double_start_is_refused() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let profiler = Profiler::new(host);
    profiler.start(supervisor_config(10)).unwrap();
    assert!(matches!(
        profiler.start(supervisor_config(10)),
        Err(ProfilerError::AlreadyRunning)
    ));
    profiler.stop().unwrap();
    profiler.finalize();
}

#[test]
fn one_session_per_process() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let first = Profiler::new(Arc::clone(&host) as _);
    let second = Profiler::new(host);
    first.start(supervisor_config(10)).unwrap();
    assert!(matches!(
        second.start(supervisor_config(10)),
        Err(ProfilerError::AlreadyRunning)
    ));
    first.stop().unwrap();
    first.finalize();
}

#[test]
fn stop_is_idempotent() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let profiler = Profiler::new(host);
    profiler.start(supervisor_config(10)).unwrap();
    profiler.stop().unwrap();
    profiler.stop().unwrap();
    assert!(!profiler.is_active());
    profiler.finalize();
}

#[test]
fn invalid_configuration_is_rejected_before_activation() {
    let host = MockRuntime::new();
    let profiler = Profiler::new(host);
    assert!(matches!(
        profiler.start(supervisor_config(0)),
        Err(ProfilerError::InvalidConfig(_))
    ));
    assert!(!profiler.is_active());
}

#[test]
fn max_depth_one_keeps_only_leaves() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let outer = host.add_code("outer", "app.x", 1);
    let inner = host.add_code("inner", "app.x", 2);
    let state = leak_thread_state(3);
    let _frames = install_stack(state, &[(outer, 0), (inner, 0)]);
    host.add_thread(3, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    let config = CpuConfig {
        max_stack_depth: 1,
        ..supervisor_config(1)
    };
    profiler.start(config).unwrap();
    sleep(Duration::from_millis(50));
    let profile = profiler.stop_and_collect().unwrap();

    assert!(profile.sample_count() > 0);
    for sample in &profile.samples {
        assert_eq!(sample.frames.len(), 1);
        assert_eq!(sample.frames[0].function_name, "inner");
    }
}

#[test]
fn ring_overflow_drops_newest_and_counts() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("spin", "app.x", 1);
    let state = leak_thread_state(4);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(4, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    let config = CpuConfig {
        ring_capacity: 8,
        ..supervisor_config(1)
    };
    profiler.start(config).unwrap();
    sleep(Duration::from_millis(200));
    profiler.stop().unwrap();

    let stats = profiler.stats();
    assert!(stats.drops_ring_full > 0, "tiny ring must overflow");
    // Nothing drained mid-session, so exactly one ring of samples landed.
    assert_eq!(stats.collected_samples, 8);

    let batch = profiler.drain(1024);
    assert!(batch.samples.len() <= 8);
    assert!(!batch.has_more);
    assert_eq!(batch.dropped_count, stats.dropped_samples);
    profiler.finalize();
}

#[test]
fn chunked_drain_returns_everything_exactly_once() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("work", "app.x", 1);
    let state = leak_thread_state(5);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(5, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(120));
    profiler.stop().unwrap();

    let expected = profiler.stats().collected_samples;
    let mut collected = 0u64;
    let mut rounds = 0;
    loop {
        let batch = profiler.drain(16);
        collected += batch.samples.len() as u64;
        rounds += 1;
        if !batch.has_more {
            break;
        }
    }
    assert_eq!(collected, expected);
    assert!(rounds > 1, "a 16-sample batch size must need several rounds");
    // A further drain has nothing left.
    assert!(profiler.drain(16).samples.is_empty());
    profiler.finalize();
}

#[test]
fn stats_report_duration_and_overhead() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("busy", "app.x", 1);
    let state = leak_thread_state(6);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(6, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(80));
    let mid_stats = profiler.stats();
    assert!(mid_stats.duration_ns >= 50_000_000);
    profiler.stop().unwrap();

    let stats = profiler.stats();
    assert!(stats.collected_samples > 0);
    assert!(stats.overhead_estimate_pct >= 0.0);
    assert!(stats.duration_ns >= mid_stats.duration_ns);

    // Counters survive finalize.
    profiler.finalize();
    assert_eq!(profiler.stats().collected_samples, stats.collected_samples);
}

#[test]
fn strong_references_are_released_after_finalize() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("pinned", "app.x", 1);
    let state = leak_thread_state(7);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(7, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(50));
    profiler.stop().unwrap();
    assert_eq!(host.refcount(code), 1, "captured descriptor is retained");

    let batch = profiler.drain(usize::MAX);
    assert!(!batch.samples.is_empty());
    profiler.finalize();
    assert_eq!(host.refcount(code), 0, "finalize releases in bulk");
}

#[test]
fn idle_threads_produce_no_samples_and_no_errors() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let state = leak_thread_state(8);
    host.add_thread(8, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(30));
    let profile = profiler.stop_and_collect().unwrap();
    assert_eq!(profile.sample_count(), 0);
}

#[test]
fn multiple_threads_get_separate_profiles() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code_a = host.add_code("worker_a", "app.x", 1);
    let code_b = host.add_code("worker_b", "app.x", 1);
    let state_a = leak_thread_state(21);
    let state_b = leak_thread_state(22);
    let _fa = install_stack(state_a, &[(code_a, 0)]);
    let _fb = install_stack(state_b, &[(code_b, 0)]);
    host.add_thread(21, state_a);
    host.add_thread(22, state_b);
    host.set_thread_name(21, "worker-a");
    host.set_thread_name(22, "worker-b");

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(1)).unwrap();
    sleep(Duration::from_millis(100));
    let profile = profiler.stop_and_collect().unwrap();

    let doc = profile.to_flame_json();
    assert_eq!(doc.profiles.len(), 2);
    let names: Vec<&str> = doc.profiles.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"worker-a"));
    assert!(names.contains(&"worker-b"));
    for thread in &doc.profiles {
        assert_eq!(thread.samples.len(), thread.weights.len());
    }

    // The supervisor walks every thread each tick, so neither thread can
    // starve: both must hold a comparable share of the samples.
    let per_thread: Vec<usize> = doc.profiles.iter().map(|p| p.samples.len()).collect();
    let min = *per_thread.iter().min().unwrap();
    let max = *per_thread.iter().max().unwrap();
    assert!(min > 0);
    assert!(max <= min * 2 + 10, "thread starved: {per_thread:?}");
}

#[test]
fn callback_backend_samples_once_per_tick() {
    let _guard = session_guard();
    let host = MockRuntime::new();
    let code = host.add_code("cb", "app.x", 9);
    let state = leak_thread_state(31);
    let _frames = install_stack(state, &[(code, 2)]);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    unsafe { profiler.register_thread(state) };

    let config = CpuConfig {
        backend: BackendChoice::HostCallback,
        ..supervisor_config(10)
    };
    profiler.start(config).unwrap();
    for _ in 0..25 {
        profiler.on_timer_tick();
    }
    let profile = profiler.stop_and_collect().unwrap();

    assert_eq!(profile.sample_count(), 25);
    assert_eq!(profile.samples[0].frames[0].function_name, "cb");
    // Ticks after stop are ignored.
    profiler.on_timer_tick();
}

#[cfg(unix)]
#[test]
fn forked_child_can_start_its_own_session() {
    let _guard = session_guard();
    spprof::fork::install_fork_hooks();

    let host = MockRuntime::new();
    let code = host.add_code("parent_work", "app.x", 1);
    let state = leak_thread_state(41);
    let _frames = install_stack(state, &[(code, 0)]);
    host.add_thread(41, state);

    let profiler = Profiler::new(Arc::clone(&host) as _);
    profiler.start(supervisor_config(2)).unwrap();
    sleep(Duration::from_millis(30));

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        // Child: the inherited session must be gone and a fresh one must
        // start cleanly.
        let child_host = MockRuntime::new();
        let child = Profiler::new(child_host);
        let ok = child.start(supervisor_config(5)).is_ok() && child.stop().is_ok();
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }

    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);

    // Parent session kept running through the fork.
    sleep(Duration::from_millis(30));
    let profile = profiler.stop_and_collect().unwrap();
    assert!(profile.sample_count() > 0);
}
