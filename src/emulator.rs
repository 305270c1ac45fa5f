// SPDX-License-Identifier: MIT

//! Latency/bandwidth emulator (`spec.md` §4.G): per-request access-time
//! busy-wait plus per-direction batch bandwidth shaping, driven by a
//! calibrated cycle counter rather than real device latency.

use crate::badgelib::timing::CycleClock;
use crate::config::{Config, SimMode};
use std::sync::Mutex;
use std::time::Duration;

/// Batch bandwidth-shaping constants (`spec.md` §4.G).
const MAX_INTERVAL: Duration = Duration::from_millis(1);
const MAX_DURATION: Duration = Duration::from_millis(10);
const MAX_SECTORS: u64 = 4096;
const MIN_SECTORS: u64 = 256;

#[derive(Clone, Copy)]
pub enum Direction {
    Read,
    Write,
}

struct BatchState {
    window_start: std::time::Instant,
    sectors_in_window: u64,
}

/// Per-direction bandwidth-shaping state, guarded by the batch lock (the
/// innermost lock in the hierarchy, `spec.md` §5).
pub struct Emulator {
    clock: CycleClock,
    cfg_rdlat_ns: u64,
    cfg_wrlat_ns: u64,
    cfg_rdbw: u64,
    cfg_wrbw: u64,
    rdsx: u32,
    wrsx: u32,
    rdpause: Duration,
    wrpause: Duration,
    simmode: SimMode,
    read_batch: Mutex<BatchState>,
    write_batch: Mutex<BatchState>,
}

impl Emulator {
    pub fn new(cfg: &Config) -> Self {
        let now = std::time::Instant::now();
        let clock = CycleClock::calibrate();
        Emulator {
            rdpause: cycles_to_duration(&clock, cfg.rdpause_cycles),
            wrpause: cycles_to_duration(&clock, cfg.wrpause_cycles),
            clock,
            cfg_rdlat_ns: cfg.rdlat_ns,
            cfg_wrlat_ns: cfg.wrlat_ns,
            cfg_rdbw: cfg.rdbw_bytes_per_sec,
            cfg_wrbw: cfg.wrbw_bytes_per_sec,
            rdsx: cfg.rdsx.max(1),
            wrsx: cfg.wrsx.max(1),
            simmode: cfg.simmode,
            read_batch: Mutex::new(BatchState {
                window_start: now,
                sectors_in_window: 0,
            }),
            write_batch: Mutex::new(BatchState {
                window_start: now,
                sectors_in_window: 0,
            }),
        }
    }

    pub fn simmode(&self) -> SimMode {
        self.simmode
    }

    /// Start of an access-time measurement window (`spec.md` §4.G): record
    /// the current cycle so [`Emulator::end_access`] can busy-wait only the
    /// deficit between configured latency and real elapsed work.
    pub fn begin_access(&self) -> u64 {
        self.clock.now_cycles()
    }

    /// Close an access-time window opened by [`begin_access`]: if real
    /// elapsed time was shorter than the configured, slowdown-scaled
    /// latency, busy-wait the deficit; then apply the fixed per-4KiB pause.
    pub fn end_access(&self, dir: Direction, started_at: u64) {
        let (base_ns, sx, pause) = match dir {
            Direction::Read => (self.cfg_rdlat_ns, self.rdsx, self.rdpause),
            Direction::Write => (self.cfg_wrlat_ns, self.wrsx, self.wrpause),
        };
        let target_ns = base_ns.saturating_mul(sx as u64);
        let elapsed_ns = self.clock.cycles_to_ns(self.clock.now_cycles().saturating_sub(started_at));
        if elapsed_ns < target_ns {
            self.busy_wait_ns(target_ns - elapsed_ns);
        }
        if pause > Duration::ZERO {
            self.sleep_or_spin(pause);
        }
    }

    /// Shape bandwidth for a batch of `sectors` sectors in `dir`, sleeping
    /// or busy-waiting as needed to respect the configured bytes/sec limit.
    /// Sleeping is forbidden while the batch lock is held; all waits here
    /// are bounded busy-waits re-reading the cycle counter, per `spec.md`
    /// §4.G.
    pub fn bandwidth_delay(&self, dir: Direction, sectors: u64) {
        let (bw, lock) = match dir {
            Direction::Read => (self.cfg_rdbw, &self.read_batch),
            Direction::Write => (self.cfg_wrbw, &self.write_batch),
        };
        if bw == 0 || sectors == 0 {
            return;
        }
        let sectors = sectors.clamp(MIN_SECTORS, MAX_SECTORS);
        let bytes = sectors * crate::config::SECTOR_SIZE;
        let target = Duration::from_secs_f64(bytes as f64 / bw as f64);
        let target = target.min(MAX_DURATION);

        let mut batch = lock.lock().unwrap();
        let elapsed = batch.window_start.elapsed();
        batch.sectors_in_window += sectors;
        if elapsed < target {
            let remaining = target - elapsed;
            self.busy_wait(remaining.min(MAX_INTERVAL.max(remaining)));
        }
        if batch.window_start.elapsed() >= MAX_INTERVAL {
            batch.window_start = std::time::Instant::now();
            batch.sectors_in_window = 0;
        }
    }

    fn sleep_or_spin(&self, duration: Duration) {
        if duration >= MAX_DURATION {
            std::thread::sleep(duration);
        } else {
            self.busy_wait(duration);
        }
    }

    fn busy_wait_ns(&self, ns: u64) {
        if ns == 0 {
            return;
        }
        self.sleep_or_spin(Duration::from_nanos(ns));
    }

    fn busy_wait(&self, duration: Duration) {
        let deadline_cycles = self
            .clock
            .now_cycles()
            .saturating_add(self.clock.ns_to_cycles(duration.as_nanos() as u64));
        while self.clock.now_cycles() < deadline_cycles {
            std::hint::spin_loop();
        }
    }
}

fn cycles_to_duration(clock: &CycleClock, cycles: u64) -> Duration {
    Duration::from_nanos(clock.cycles_to_ns(cycles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latency_returns_immediately() {
        let cfg = Config::default();
        let emulator = Emulator::new(&cfg);
        let start = std::time::Instant::now();
        let token = emulator.begin_access();
        emulator.end_access(Direction::Read, token);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn nonzero_latency_actually_waits() {
        let mut cfg = Config::default();
        cfg.rdlat_ns = 1_000_000;
        let emulator = Emulator::new(&cfg);
        let start = std::time::Instant::now();
        let token = emulator.begin_access();
        emulator.end_access(Direction::Read, token);
        assert!(start.elapsed() >= Duration::from_micros(900));
    }

    #[test]
    fn zero_bandwidth_limit_is_noop() {
        let cfg = Config::default();
        let emulator = Emulator::new(&cfg);
        emulator.bandwidth_delay(Direction::Write, 1000);
    }
}
