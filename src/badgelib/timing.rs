// SPDX-License-Identifier: MIT

//! Wall-clock timestamp and cycle-counter helpers, grounded on the
//! teacher's `badgelib::time::{Timespec, AtomicTimespec}` but backed by
//! `std::time` and a real TSC read instead of a kernel syscall.

use crate::badgelib::spinlock::Spinlock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Posix nanoseconds timestamp.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
pub struct Timespec {
    /// Seconds (excluding leap) since 00:00, Jan 1 1970 UTC.
    pub sec: u64,
    /// Nanoseconds after [`Self::sec`].
    pub nsec: u32,
}

impl Timespec {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: since_epoch.as_secs(),
            nsec: since_epoch.subsec_nanos(),
        }
    }

    /// Wall-clock time elapsed since this timestamp was taken.
    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        let now_ns = now.sec as i128 * 1_000_000_000 + now.nsec as i128;
        let self_ns = self.sec as i128 * 1_000_000_000 + self.nsec as i128;
        Duration::from_nanos(now_ns.saturating_sub(self_ns).max(0) as u64)
    }
}

/// Lock-guarded [`Timespec`], for the occasional "time of last flush" field
/// shared across the flusher thread and request path.
pub struct AtomicTimespec(Spinlock<Timespec>);

impl AtomicTimespec {
    pub fn new(time: Timespec) -> Self {
        Self(Spinlock::new(time))
    }

    pub fn load(&self) -> Timespec {
        *self.0.lock_shared()
    }

    pub fn store(&self, value: Timespec) {
        *self.0.lock() = value;
    }
}

/// Calibrated cycle counter. On x86_64 this reads the real TSC via `rdtsc`
/// and converts against a once-measured cycles-per-nanosecond ratio,
/// matching the way the original PMBD measures `cpu_khz` at attach time. On
/// other hosts it falls back to a synthetic 1 GHz domain derived from
/// `Instant`, so the busy-wait arithmetic in the emulator stays portable.
pub struct CycleClock {
    cycles_per_ns: f64,
    origin_instant: Instant,
    origin_cycles: u64,
}

impl CycleClock {
    /// Calibrate against a short real-time sleep, as the original does at
    /// device attach.
    pub fn calibrate() -> Self {
        let origin_instant = Instant::now();
        let origin_cycles = read_cycles();
        if cfg!(target_arch = "x86_64") {
            std::thread::sleep(Duration::from_millis(2));
            let elapsed = origin_instant.elapsed();
            let delta_cycles = read_cycles().saturating_sub(origin_cycles);
            let cycles_per_ns = delta_cycles as f64 / elapsed.as_nanos().max(1) as f64;
            CycleClock {
                cycles_per_ns: if cycles_per_ns.is_finite() && cycles_per_ns > 0.0 {
                    cycles_per_ns
                } else {
                    1.0
                },
                origin_instant,
                origin_cycles,
            }
        } else {
            CycleClock {
                cycles_per_ns: 1.0,
                origin_instant,
                origin_cycles,
            }
        }
    }

    /// Current cycle count, on the calibrated domain.
    pub fn now_cycles(&self) -> u64 {
        read_cycles()
    }

    /// Convert a cycle delta to nanoseconds using the calibrated ratio.
    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        (cycles as f64 / self.cycles_per_ns) as u64
    }

    /// Convert nanoseconds to a cycle delta using the calibrated ratio.
    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        (ns as f64 * self.cycles_per_ns) as u64
    }

    /// Elapsed cycles since calibration, used by callers that want a
    /// monotonic cycle timeline without re-deriving `origin_cycles`.
    pub fn elapsed_cycles(&self) -> u64 {
        self.now_cycles().saturating_sub(self.origin_cycles)
    }

    /// Elapsed wall time since calibration; used to sanity-check
    /// cycle-derived sleeps against real time in tests.
    pub fn elapsed(&self) -> Duration {
        self.origin_instant.elapsed()
    }
}

#[cfg(target_arch = "x86_64")]
fn read_cycles() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
fn read_cycles() -> u64 {
    // Synthetic 1ns-per-"cycle" domain so the rest of the crate's
    // arithmetic is portable off x86_64.
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_now_is_nonzero() {
        assert!(Timespec::now().sec > 0);
    }

    #[test]
    fn timespec_elapsed_grows_with_real_time() {
        let ts = Timespec::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(ts.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn atomic_timespec_roundtrip() {
        let ts = AtomicTimespec::new(Timespec::default());
        let value = Timespec { sec: 5, nsec: 10 };
        ts.store(value);
        assert_eq!(ts.load(), value);
    }

    #[test]
    fn cycle_clock_advances() {
        let clock = CycleClock::calibrate();
        let a = clock.now_cycles();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now_cycles();
        assert!(b >= a);
    }
}
