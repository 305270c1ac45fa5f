// SPDX-License-Identifier: MIT

//! The device core (`spec.md` §4.H request dispatcher, §4.I barrier
//! coordinator): ties the region, copy primitives, permission gate,
//! per-block index, checksum store, write buffer and emulator together
//! behind the sector-addressed request surface of `spec.md` §6.

use crate::badgelib::timing::{AtomicTimespec, Timespec};
use crate::buffer::{BufferSet, PersistTarget};
use crate::checksum::ChecksumTable;
use crate::config::{Config, SECTOR_SIZE};
use crate::copy;
use crate::emulator::{Direction, Emulator};
use crate::error::{EResult, Error};
use crate::pbi::PbiTable;
use crate::permgate;
use crate::region::Region;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Request flags, the set `{FLUSH, FUA, SYNC}` of `spec.md` §6. `sync` is
/// accepted but carries no semantics in the core, matching the spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub flush: bool,
    pub fua: bool,
    pub sync: bool,
}

/// Request/throughput counters, the diagnostic surface of `spec.md` §6.
#[derive(Default)]
pub struct Stats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub sectors: AtomicU64,
    pub barriers: AtomicU64,
    pub fua_requests: AtomicU64,
}

/// The persistent-memory block device.
///
/// Lock hierarchy (`spec.md` §5), outermost first: the barrier gate, then
/// the write buffer's internal locks, then each block's PBI lock, then the
/// emulator's per-direction batch lock. No code path acquires locks out of
/// this order.
///
/// The barrier gate is a `RwLock<()>` rather than a hand-counted
/// in-flight-writes counter plus spin loop: ordinary requests hold it
/// shared for their duration, `barrier()` takes it exclusively, so the
/// exclusive acquisition only succeeds once every in-flight request has
/// finished — the same guarantee `spec.md` §4.I describes, built from a
/// primitive the standard library already gives us race-free.
pub struct Device {
    cfg: Config,
    region: Region,
    pbi_table: Arc<PbiTable>,
    checksum: Option<Arc<ChecksumTable>>,
    buffers: Option<Arc<BufferSet>>,
    emulator: Emulator,
    barrier_gate: RwLock<()>,
    stats: Stats,
    /// Timestamp of the most recent `read`/`write`, shared with the write
    /// buffer's flusher threads so they can detect device idle time
    /// (`spec.md` §4.E's background-flusher idle trigger).
    last_access: Arc<AtomicTimespec>,
}

/// The immediate (unbuffered) write-through path shared by the unbuffered
/// request path, the FUA double-write, and the background flusher.
struct PersistSink {
    region_base: *mut u8,
    region_len: usize,
    page_size: usize,
    block_size: usize,
    cfg: Config,
    checksum: Option<Arc<ChecksumTable>>,
}

// SAFETY: the raw pointer only ever addresses the owning Device's mmap'd
// region; every `PersistSink` is dropped (flusher threads joined) before
// that region is unmapped, per `Device::close`.
unsafe impl Send for PersistSink {}
unsafe impl Sync for PersistSink {}

impl PersistSink {
    /// Write `data` (exactly one block) into `pbn`'s slot in the region,
    /// under a RW window, with optional verify/checksum — the unbuffered
    /// path of `spec.md` §4.H step 6.
    fn persist_block(&self, pbn: u64, data: &[u8]) -> EResult<()> {
        self.persist_range(pbn, 0, data, false)
    }

    /// Write `data` into the `[offset, offset+data.len())` sub-range of
    /// block `pbn`, under a RW window sized to just that range, then
    /// recompute checksum (if enabled) over the *whole* block read back
    /// from the region, per `spec.md` §4.F. `fua` is the resolved FUA
    /// intent for this copy, threaded into `copy::store` for its
    /// `clflush`-or-FUA flush clause (`spec.md` §4.B).
    fn persist_range(&self, pbn: u64, offset: usize, data: &[u8], fua: bool) -> EResult<()> {
        let block_offset = pbn as usize * self.block_size;
        if block_offset + self.block_size > self.region_len || offset + data.len() > self.block_size
        {
            return Err(Error::OutOfRange);
        }
        let abs_offset = block_offset + offset;

        let window = permgate::open(
            self.cfg.wpmode,
            unsafe { self.region_base.add(abs_offset) },
            data.len(),
            self.page_size,
        )?;
        let dst = unsafe { std::slice::from_raw_parts_mut(self.region_base.add(abs_offset), data.len()) };
        unsafe { copy::store(&self.cfg, dst, data, fua) };
        drop(window);

        if self.cfg.wrverify {
            let mut verify = vec![0u8; data.len()];
            unsafe { copy::load(&self.cfg, &mut verify, dst) };
            if verify != data {
                return Err(Error::WriteVerificationFailed { pbn });
            }
        }
        if let Some(table) = &self.checksum {
            let block = unsafe {
                std::slice::from_raw_parts(self.region_base.add(block_offset), self.block_size)
            };
            table.update(pbn, block);
        }
        Ok(())
    }

    fn read_block(&self, pbn: u64, out: &mut [u8]) -> EResult<()> {
        let block_offset = pbn as usize * self.block_size;
        if block_offset + self.block_size > self.region_len {
            return Err(Error::OutOfRange);
        }
        let src =
            unsafe { std::slice::from_raw_parts(self.region_base.add(block_offset), self.block_size) };
        unsafe { copy::load(&self.cfg, out, src) };
        Ok(())
    }
}

impl PersistTarget for PersistSink {
    fn persist_block(&self, pbn: u64, data: &[u8]) -> EResult<()> {
        PersistSink::persist_block(self, pbn, data)
    }
}

impl Device {
    /// Activate a device over a fresh, zeroed persistent region sized for
    /// `cfg.capacity_blocks` blocks of `cfg.block_size` bytes each.
    pub fn activate(cfg: Config) -> EResult<Arc<Self>> {
        cfg.validate()?;
        if cfg.capacity_blocks == 0 {
            return Err(Error::BadConfig("capacity_blocks must be nonzero".into()));
        }
        info!(
            "activating pmbd device: {} blocks x {} bytes, cache={:?}, wpmode={:?}",
            cfg.capacity_blocks,
            cfg.block_size,
            cfg.effective_cache(),
            cfg.wpmode
        );

        let region_len = (cfg.capacity_blocks * cfg.block_size) as usize;
        let mut region = Region::map(region_len, cfg.effective_cache())?;
        if cfg.wrprot {
            // Both wpmodes reuse the same mprotect toggle (`spec.md` §9:
            // CR0 falls back to PTE uniformly when no real CR0.WP bit is
            // available), so the initial write-protect applies regardless
            // of `cfg.wpmode`.
            let rc = unsafe {
                libc::mprotect(
                    region.addr_of(0) as *mut std::ffi::c_void,
                    region.len(),
                    libc::PROT_READ,
                )
            };
            if rc != 0 {
                return Err(Error::InternalInvariant("initial mprotect(RO) failed"));
            }
        }
        region.set_cacheability(cfg.effective_cache());

        let pbi_table = Arc::new(PbiTable::new(cfg.capacity_blocks));
        let checksum = cfg
            .checksum
            .then(|| Arc::new(ChecksumTable::new(cfg.capacity_blocks)));
        let buffers = if cfg.buf_enabled {
            Some(Arc::new(BufferSet::new(&cfg)?))
        } else {
            None
        };
        let emulator = Emulator::new(&cfg);
        let last_access = Arc::new(AtomicTimespec::new(Timespec::now()));

        let device = Arc::new(Device {
            cfg,
            region,
            pbi_table,
            checksum,
            buffers,
            emulator,
            barrier_gate: RwLock::new(()),
            stats: Stats::default(),
            last_access,
        });

        if let Some(buffers) = &device.buffers {
            let sink = device.persist_sink();
            buffers.spawn_flushers(
                Arc::new(sink),
                Arc::clone(&device.pbi_table),
                Arc::clone(&device.last_access),
            );
        }

        Ok(device)
    }

    fn persist_sink(&self) -> PersistSink {
        PersistSink {
            region_base: self.region.addr_of(0),
            region_len: self.region.len(),
            page_size: self.region.page_size(),
            block_size: self.cfg.block_size as usize,
            cfg: self.cfg.clone(),
            checksum: self.checksum.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn capacity_sectors(&self) -> u64 {
        self.cfg.capacity_blocks * (self.cfg.block_size / SECTOR_SIZE)
    }

    /// Read `len` bytes starting at sector `sector` into `dst`
    /// (`dst.len() == len * SECTOR_SIZE`) — `spec.md` §6 `read`.
    pub fn read(&self, sector: u64, len: u64, dst: &mut [u8]) -> EResult<()> {
        if dst.len() as u64 != len * SECTOR_SIZE {
            return Err(Error::BadConfig("dst size does not match len".into()));
        }
        if sector + len > self.capacity_sectors() {
            return Err(Error::OutOfRange);
        }
        if len == 0 {
            return Ok(());
        }

        self.last_access.store(Timespec::now());
        let _shared = self.barrier_gate.read().unwrap();
        let token = self.emulator.begin_access();

        for (pbn, block_off, chunk_off, chunk_len) in self.block_iter(sector, len) {
            let _pbi = self.cfg.lock.then(|| self.pbi_table.get(pbn).map(|p| p.lock()));

            let block_size = self.cfg.block_size as usize;
            let mut block_buf = vec![0u8; block_size];
            let served_from_buffer = self
                .buffers
                .as_ref()
                .is_some_and(|buffers| buffers.read(pbn, &mut block_buf));

            if !served_from_buffer {
                let sink = self.persist_sink();
                sink.read_block(pbn, &mut block_buf)?;
                if let Some(table) = &self.checksum
                    && !table.verify(pbn, &block_buf)
                {
                    warn!("checksum mismatch at pbn {pbn}");
                    dst[chunk_off..chunk_off + chunk_len]
                        .copy_from_slice(&block_buf[block_off..block_off + chunk_len]);
                    return Err(Error::ChecksumMismatch { pbn });
                }
            }

            dst[chunk_off..chunk_off + chunk_len]
                .copy_from_slice(&block_buf[block_off..block_off + chunk_len]);
        }

        self.emulator.end_access(Direction::Read, token);
        self.emulator.bandwidth_delay(Direction::Read, len);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.sectors.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Write `len` sectors of `src` starting at sector `sector` — `spec.md`
    /// §6 `write`, with `flags` selecting FLUSH/FUA/SYNC behaviour.
    pub fn write(&self, sector: u64, len: u64, src: &[u8], flags: RequestFlags) -> EResult<()> {
        if src.len() as u64 != len * SECTOR_SIZE {
            return Err(Error::BadConfig("src size does not match len".into()));
        }
        if sector + len > self.capacity_sectors() {
            return Err(Error::OutOfRange);
        }

        if self.cfg.wb && flags.flush {
            self.barrier()?;
        }
        if len == 0 {
            return Ok(());
        }

        self.last_access.store(Timespec::now());
        let _shared = self.barrier_gate.read().unwrap();
        let token = self.emulator.begin_access();
        let do_fua = self.cfg.fua && flags.fua;

        for (pbn, block_off, chunk_off, chunk_len) in self.block_iter(sector, len) {
            let _pbi = self.cfg.lock.then(|| self.pbi_table.get(pbn).map(|p| p.lock()));
            let chunk = &src[chunk_off..chunk_off + chunk_len];

            if let Some(buffers) = &self.buffers {
                let block_size = self.cfg.block_size as usize;
                let partial = block_off != 0 || chunk_len != block_size;
                let mut block_buf = vec![0u8; block_size];
                if partial {
                    if !buffers.read(pbn, &mut block_buf) {
                        let sink = self.persist_sink();
                        sink.read_block(pbn, &mut block_buf)?;
                    }
                    block_buf[block_off..block_off + chunk_len].copy_from_slice(chunk);
                } else {
                    block_buf.copy_from_slice(chunk);
                }
                let sink = self.persist_sink();
                buffers.write(pbn, &block_buf, &self.pbi_table, &sink)?;

                if do_fua {
                    // Open question (spec.md §9): preserved verbatim — the
                    // buffered copy is written twice, once into the slot
                    // and once directly, so the slot is what subsequent
                    // reads observe.
                    sink.persist_range(pbn, block_off, chunk, true)?;
                }
            } else {
                let sink = self.persist_sink();
                sink.persist_range(pbn, block_off, chunk, do_fua)?;
            }
        }

        if do_fua {
            self.stats.fua_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.emulator.end_access(Direction::Write, token);
        self.emulator.bandwidth_delay(Direction::Write, len);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.sectors.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// `spec.md` §6 `flush()`: alias for [`Device::barrier`].
    pub fn flush(&self) -> EResult<()> {
        self.barrier()
    }

    /// Barrier (`spec.md` §4.I): exclude new requests, drain every dirty
    /// write-buffer slot to the persistent region, then issue the global
    /// durability step for the current cacheability policy.
    pub fn barrier(&self) -> EResult<()> {
        let _exclusive = self.barrier_gate.write().unwrap();
        debug!("barrier: draining write buffer");
        if let Some(buffers) = &self.buffers {
            let sink = self.persist_sink();
            let total = buffers.drain_all(&sink, &self.pbi_table)?;
            debug!("barrier: flushed {total} slots");
        }
        // WB without nts/clflush needs a global write-back; per-range
        // fences already cover nts/clflush/WC/UC-/UC, so only that one
        // case issues the extra step here.
        if self.cfg.effective_cache() == crate::config::CacheMode::Wb
            && !self.cfg.nts
            && !self.cfg.clflush
        {
            copy::fence();
        }
        self.stats.barriers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Yield `(pbn, block_offset, chunk_offset_in_request, chunk_len)` for
    /// each block touched by `[sector, sector+len)`, splitting the request
    /// at block boundaries.
    fn block_iter(&self, sector: u64, len: u64) -> Vec<(u64, usize, usize, usize)> {
        let sectors_per_block = self.cfg.block_size / SECTOR_SIZE;
        let mut out = Vec::new();
        let mut remaining = len;
        let mut cur_sector = sector;
        let mut chunk_off = 0usize;
        while remaining > 0 {
            let pbn = cur_sector / sectors_per_block;
            let sector_in_block = cur_sector % sectors_per_block;
            let block_off = (sector_in_block * SECTOR_SIZE) as usize;
            let sectors_left_in_block = sectors_per_block - sector_in_block;
            let take = remaining.min(sectors_left_in_block);
            let chunk_len = (take * SECTOR_SIZE) as usize;
            out.push((pbn, block_off, chunk_off, chunk_len));
            chunk_off += chunk_len;
            cur_sector += take;
            remaining -= take;
        }
        out
    }

    /// Stop background flushers and drop the device's resources. Idempotent
    /// with `Drop`.
    pub fn close(&self) {
        if let Some(buffers) = &self.buffers {
            buffers.shutdown();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.capacity_blocks = 16;
        cfg.block_size = 4096;
        cfg
    }

    fn flags() -> RequestFlags {
        RequestFlags::default()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let device = Device::activate(small_cfg()).unwrap();
        let data = vec![7u8; 4096];
        device.write(0, 8, &data, flags()).unwrap();
        let mut out = vec![0u8; 4096];
        device.read(0, 8, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let device = Device::activate(small_cfg()).unwrap();
        let data = vec![0u8; 4096];
        assert!(matches!(
            device.write(16 * 8, 8, &data, flags()),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn zero_length_write_succeeds() {
        let device = Device::activate(small_cfg()).unwrap();
        device.write(0, 0, &[], flags()).unwrap();
    }

    #[test]
    fn fua_write_is_immediately_durable_and_counted() {
        let mut cfg = small_cfg();
        cfg.buf_enabled = true;
        cfg.buf_size = crate::config::MIN_BUF_SIZE;
        cfg.buf_count = 1;
        cfg.buf_stride = 1;
        cfg.buf_batch = 4;
        cfg.fua = true;
        let device = Device::activate(cfg).unwrap();
        let data = vec![1u8; 4096];
        let mut f = flags();
        f.fua = true;
        device.write(0, 8, &data, f).unwrap();
        assert_eq!(device.stats().fua_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn barrier_drains_buffer() {
        let mut cfg = small_cfg();
        cfg.buf_enabled = true;
        cfg.buf_size = crate::config::MIN_BUF_SIZE;
        cfg.buf_count = 1;
        cfg.buf_stride = 1;
        cfg.buf_batch = 4;
        let device = Device::activate(cfg).unwrap();
        let data = vec![2u8; 4096];
        device.write(0, 8, &data, flags()).unwrap();
        device.barrier().unwrap();
        let mut out = vec![0u8; 4096];
        device.read(0, 8, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unaligned_write_leaves_neighbouring_bytes_untouched() {
        let device = Device::activate(small_cfg()).unwrap();
        let initial = vec![0x11u8; 4096];
        device.write(0, 8, &initial, flags()).unwrap();

        let partial = vec![0xAAu8; 512];
        device.write(1, 1, &partial, flags()).unwrap();

        let mut out = vec![0u8; 4096];
        device.read(0, 8, &mut out).unwrap();
        assert_eq!(&out[0..512], &initial[0..512]);
        assert_eq!(&out[512..1024], &partial[..]);
        assert_eq!(&out[1024..], &initial[1024..]);
    }

    #[test]
    fn checksum_detects_region_corruption() {
        let mut cfg = small_cfg();
        cfg.checksum = true;
        let device = Device::activate(cfg).unwrap();
        let data = vec![3u8; 4096];
        device.write(0, 8, &data, flags()).unwrap();
        unsafe {
            device.region.as_mut_slice()[0] ^= 0xff;
        }
        let mut out = vec![0u8; 4096];
        assert!(matches!(
            device.read(0, 8, &mut out),
            Err(Error::ChecksumMismatch { pbn: 0 })
        ));
    }
}
