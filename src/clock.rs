//! Time sources for call-frame timestamps.
//!
//! All frame timestamps are nanoseconds (`u64`). Wall time is measured from a
//! process-wide monotonic base captured on first use, so values are only
//! meaningful relative to each other within one process. Thread CPU time uses
//! `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`; thread user time uses
//! `getrusage(RUSAGE_THREAD)` on Linux and falls back to the CPU clock on
//! other targets.
//!
//! Clock reads sit on the push/pop hot path: each is a single syscall or
//! vDSO call and is read exactly once per transition.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static MONOTONIC_BASE: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall-clock nanoseconds since the process-wide base instant.
pub fn wall_now_ns() -> u64 {
    let base = MONOTONIC_BASE.get_or_init(Instant::now);
    base.elapsed().as_nanos() as u64
}

/// CPU time consumed by the calling thread, in nanoseconds.
///
/// Sleeps, I/O waits, and scheduling delays do not advance this clock.
pub fn thread_cpu_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    debug_assert_eq!(ret, 0, "clock_gettime(CLOCK_THREAD_CPUTIME_ID) failed");
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// User-mode CPU time consumed by the calling thread, in nanoseconds.
#[cfg(target_os = "linux")]
pub fn thread_user_now_ns() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    debug_assert_eq!(ret, 0, "getrusage(RUSAGE_THREAD) failed");
    usage.ru_utime.tv_sec as u64 * 1_000_000_000 + usage.ru_utime.tv_usec as u64 * 1_000
}

/// User-mode CPU time fallback: `RUSAGE_THREAD` is Linux-only, so other
/// targets report total thread CPU time instead.
#[cfg(not(target_os = "linux"))]
pub fn thread_user_now_ns() -> u64 {
    thread_cpu_now_ns()
}

/// Milliseconds since the unix epoch, for "when did the maximum occur" stamps.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert a nanosecond delta to whole milliseconds.
pub fn nanos_to_millis(ns: u64) -> i64 {
    (ns / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_monotonic() {
        let a = wall_now_ns();
        let b = wall_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn cpu_time_advances_during_compute() {
        let before = thread_cpu_now_ns();
        let mut buf = [0u8; 4096];
        for i in 0u64..50_000 {
            for b in &mut buf {
                *b = b.wrapping_add(i as u8).wrapping_mul(31);
            }
        }
        std::hint::black_box(&buf);
        let after = thread_cpu_now_ns();
        assert!(
            after > before,
            "CPU clock should advance during compute: before={before}, after={after}"
        );
    }

    #[test]
    fn cpu_time_does_not_advance_during_sleep() {
        let before = thread_cpu_now_ns();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let after = thread_cpu_now_ns();
        let delta_ms = (after - before) as f64 / 1_000_000.0;
        assert!(
            delta_ms < 5.0,
            "CPU clock should not advance during sleep, but delta was {delta_ms:.2}ms"
        );
    }

    #[test]
    fn nanos_to_millis_truncates() {
        assert_eq!(nanos_to_millis(0), 0);
        assert_eq!(nanos_to_millis(999_999), 0);
        assert_eq!(nanos_to_millis(1_000_000), 1);
        assert_eq!(nanos_to_millis(1_999_999), 1);
        assert_eq!(nanos_to_millis(4_096_000_000), 4096);
    }

    #[test]
    fn unix_now_ms_is_plausible() {
        // After 2020-01-01 in millis.
        assert!(unix_now_ms() > 1_577_836_800_000);
    }
}
