// SPDX-License-Identifier: MIT

//! DRAM write buffer (`spec.md` §4.E): a ring of dirty/clean slots sitting
//! in front of the persistent region, drained by a background flusher
//! thread once the dirty fraction crosses a high-water mark.
//!
//! Grounded on the teacher's `mem::vmm` page-granular mapping for the
//! backing store and, for the background write-back shape, the buffer-pool
//! pattern found elsewhere in the reference corpus (a bounded pool with a
//! `dirty_threshold` that wakes a flush thread rather than flushing inline).

use crate::badgelib::spinlock::Spinlock;
use crate::badgelib::timing::AtomicTimespec;
use crate::config::{CacheMode, Config};
use crate::error::{EResult, Error};
use crate::pbi::PbiTable;
use crate::region::Region;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Dirty fraction at which the flusher wakes eagerly instead of waiting out
/// its sleep interval.
const HIGH_WATER_FRACTION: f64 = 0.7;
/// Dirty fraction the idle trigger targets, and the fraction the flusher
/// drains down to before going back to sleep (`spec.md` §4.E).
const LOW_WATER_FRACTION: f64 = 0.1;
/// Idle period after which the low-water trigger also fires.
const IDLE_THRESHOLD: Duration = Duration::from_millis(2);

/// Target a flusher thread writes dirty slots back to.
pub trait PersistTarget: Send + Sync {
    fn persist_block(&self, pbn: u64, data: &[u8]) -> EResult<()>;
}

#[derive(Clone, Copy)]
struct BbiState {
    pbn: Option<u64>,
    dirty: bool,
}

struct RingState {
    /// Next slot index to hand out to a new write.
    pos_dirty: usize,
    /// Next slot index the flusher should drain.
    pos_clean: usize,
    /// Count of currently-dirty slots.
    num_dirty: usize,
}

/// One shard of the write buffer: a fixed-size ring of block-sized slots
/// over its own [`Region`].
pub struct WriteBuffer {
    region: Region,
    block_size: usize,
    slot_count: usize,
    bbi: Vec<Spinlock<BbiState>>,
    ring: Spinlock<RingState>,
    flush_lock: Mutex<()>,
    stop: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    batch: usize,
}

impl WriteBuffer {
    pub fn new(cfg: &Config) -> EResult<Arc<Self>> {
        let block_size = cfg.block_size as usize;
        let slot_count = (cfg.buf_size as usize) / block_size;
        if slot_count == 0 {
            return Err(Error::BadConfig(
                "buf.size too small for one block-sized slot".into(),
            ));
        }
        let region = Region::map(slot_count * block_size, CacheMode::Wb)?;
        let mut bbi = Vec::with_capacity(slot_count);
        bbi.resize_with(slot_count, || {
            Spinlock::new(BbiState {
                pbn: None,
                dirty: false,
            })
        });
        Ok(Arc::new(WriteBuffer {
            region,
            block_size,
            slot_count,
            bbi,
            ring: Spinlock::new(RingState {
                pos_dirty: 0,
                pos_clean: 0,
                num_dirty: 0,
            }),
            flush_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            flusher: Mutex::new(None),
            batch: cfg.buf_batch.max(1) as usize,
        }))
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn dirty_fraction(&self) -> f64 {
        let dirty = self.ring.lock_shared().num_dirty;
        dirty as f64 / self.slot_count as f64
    }

    fn slot_bytes(&self, slot: usize) -> &[u8] {
        let off = slot * self.block_size;
        unsafe { &self.region.as_slice()[off..off + self.block_size] }
    }

    fn slot_bytes_mut(&self, slot: usize) -> &mut [u8] {
        let off = slot * self.block_size;
        unsafe { &mut self.region.as_mut_slice()[off..off + self.block_size] }
    }

    /// Find the slot currently holding `pbn`, if buffered. Linear scan over
    /// the BBI table; acceptable for the modest slot counts this emulator
    /// targets (`spec.md` §4.E does not mandate an index structure beyond
    /// the PBI's own `bbn_or_sentinel` link, which callers should prefer
    /// when available).
    pub fn find(&self, pbn: u64) -> Option<usize> {
        self.bbi
            .iter()
            .position(|slot| slot.lock_shared().pbn == Some(pbn))
    }

    /// Read `pbn`'s buffered contents into `out`, if present.
    pub fn read(&self, pbn: u64, out: &mut [u8]) -> bool {
        match self.find(pbn) {
            Some(slot) => {
                out.copy_from_slice(self.slot_bytes(slot));
                true
            }
            None => false,
        }
    }

    /// Write `data` for `pbn` into the buffer, allocating a new slot (or
    /// reusing one already holding `pbn`) and marking it dirty. Returns the
    /// slot index used.
    ///
    /// Allocation (`spec.md` §4.E): if every slot is dirty, this
    /// synchronously flushes one batch to `target` and retries rather than
    /// clobbering a still-dirty slot's bytes and PBI link.
    pub fn write(
        &self,
        pbn: u64,
        data: &[u8],
        pbi_table: &PbiTable,
        target: &dyn PersistTarget,
    ) -> EResult<usize> {
        if let Some(slot) = self.find(pbn) {
            self.slot_bytes_mut(slot).copy_from_slice(data);
            let mut bbi = self.bbi[slot].lock();
            if !bbi.dirty {
                bbi.dirty = true;
                self.ring.lock().num_dirty += 1;
            }
            return Ok(slot);
        }

        let slot = loop {
            let reserved = {
                let mut ring = self.ring.lock();
                if ring.num_dirty >= self.slot_count {
                    None
                } else {
                    let slot = ring.pos_dirty % self.slot_count;
                    ring.pos_dirty += 1;
                    Some(slot)
                }
            };
            match reserved {
                Some(slot) => break slot,
                None => {
                    self.flush_batch(target, pbi_table)?;
                }
            }
        };

        if let Some(old_pbn) = self.bbi[slot].lock_shared().pbn
            && let Some(pbi) = pbi_table.get(old_pbn)
        {
            pbi.clear_bbn();
        }

        self.slot_bytes_mut(slot).copy_from_slice(data);
        {
            let mut bbi = self.bbi[slot].lock();
            let was_dirty = bbi.dirty;
            bbi.pbn = Some(pbn);
            bbi.dirty = true;
            if !was_dirty {
                self.ring.lock().num_dirty += 1;
            }
        }
        if let Some(pbi) = pbi_table.get(pbn) {
            pbi.set_bbn(slot as u32);
        }
        Ok(slot)
    }

    /// Drain up to `self.batch` dirty slots to `target`, oldest first.
    /// Returns the number of slots flushed.
    pub fn flush_batch(&self, target: &dyn PersistTarget, pbi_table: &PbiTable) -> EResult<usize> {
        let _exclusive = self.flush_lock.lock().unwrap();
        let mut flushed = 0;
        for _ in 0..self.batch {
            let slot = {
                let ring = self.ring.lock_shared();
                if ring.num_dirty == 0 {
                    break;
                }
                ring.pos_clean % self.slot_count
            };
            let (pbn, was_dirty) = {
                let bbi = self.bbi[slot].lock_shared();
                (bbi.pbn, bbi.dirty)
            };
            if !was_dirty {
                self.ring.lock().pos_clean += 1;
                continue;
            }
            let Some(pbn) = pbn else {
                return Err(Error::InternalInvariant(
                    "dirty buffer slot has no assigned PBN",
                ));
            };

            target.persist_block(pbn, self.slot_bytes(slot))?;

            {
                let mut bbi = self.bbi[slot].lock();
                bbi.dirty = false;
            }
            if let Some(pbi) = pbi_table.get(pbn) {
                pbi.clear_bbn();
            }
            {
                let mut ring = self.ring.lock();
                ring.pos_clean += 1;
                ring.num_dirty = ring.num_dirty.saturating_sub(1);
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Spawn the background flusher thread, per `spec.md` §4.E / §9: each
    /// iteration snapshots `num_dirty` and `last_access`; if the dirty
    /// fraction is at or above the high-water mark, or the device has been
    /// idle past `IDLE_THRESHOLD` and the dirty fraction is at or above the
    /// low-water mark, it flushes batches until back under the low-water
    /// mark. Otherwise it parks for a bounded sleep, woken early by
    /// allocation on a full buffer. Shutdown is a cooperative stop flag
    /// checked between batches, joined by `Device::close`/`Drop`.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        target: Arc<dyn PersistTarget>,
        pbi_table: Arc<PbiTable>,
        last_access: Arc<AtomicTimespec>,
    ) {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !this.stop.load(Ordering::Acquire) {
                let dirty = this.dirty_fraction();
                let idle = last_access.load().elapsed() > IDLE_THRESHOLD;
                if dirty >= HIGH_WATER_FRACTION || (idle && dirty >= LOW_WATER_FRACTION) {
                    loop {
                        let flushed = this.flush_batch(target.as_ref(), &pbi_table).unwrap_or(0);
                        if flushed == 0 || this.dirty_fraction() < LOW_WATER_FRACTION {
                            break;
                        }
                    }
                    continue;
                }
                std::thread::park_timeout(Duration::from_millis(10));
            }
        });
        *self.flusher.lock().unwrap() = Some(handle);
    }

    /// Signal the flusher to stop and join it.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A set of `buf_count` independent write-buffer shards, routed by PBN.
pub struct BufferSet {
    shards: Vec<Arc<WriteBuffer>>,
    stride: u64,
}

impl BufferSet {
    pub fn new(cfg: &Config) -> EResult<Self> {
        let mut shards = Vec::with_capacity(cfg.buf_count as usize);
        for _ in 0..cfg.buf_count {
            shards.push(WriteBuffer::new(cfg)?);
        }
        Ok(BufferSet {
            shards,
            stride: cfg.buf_stride as u64,
        })
    }

    fn shard_for(&self, pbn: u64) -> &Arc<WriteBuffer> {
        let idx = ((pbn / self.stride.max(1)) as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn read(&self, pbn: u64, out: &mut [u8]) -> bool {
        self.shard_for(pbn).read(pbn, out)
    }

    pub fn write(
        &self,
        pbn: u64,
        data: &[u8],
        pbi_table: &PbiTable,
        target: &dyn PersistTarget,
    ) -> EResult<usize> {
        self.shard_for(pbn).write(pbn, data, pbi_table, target)
    }

    pub fn spawn_flushers(
        &self,
        target: Arc<dyn PersistTarget>,
        pbi_table: Arc<PbiTable>,
        last_access: Arc<AtomicTimespec>,
    ) {
        for shard in &self.shards {
            shard.spawn_flusher(
                Arc::clone(&target),
                Arc::clone(&pbi_table),
                Arc::clone(&last_access),
            );
        }
    }

    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }

    pub fn total_dirty(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.ring.lock_shared().num_dirty)
            .sum()
    }

    /// Drain every dirty slot across all shards, used by the barrier
    /// coordinator (`spec.md` §4.I). Returns the total number of slots
    /// flushed.
    pub fn drain_all(&self, target: &dyn PersistTarget, pbi_table: &PbiTable) -> EResult<usize> {
        let mut total = 0;
        for shard in &self.shards {
            loop {
                let n = shard.flush_batch(target, pbi_table)?;
                total += n;
                if n == 0 {
                    break;
                }
            }
        }
        Ok(total)
    }
}

static_assertions::assert_impl_all!(BufferSet: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct RecordingTarget {
        flushed: AtomicU32,
        written: Mutex<HashMap<u64, Vec<u8>>>,
    }

    impl RecordingTarget {
        fn new() -> Self {
            RecordingTarget {
                flushed: AtomicU32::new(0),
                written: Mutex::new(HashMap::new()),
            }
        }
    }

    impl PersistTarget for RecordingTarget {
        fn persist_block(&self, pbn: u64, data: &[u8]) -> EResult<()> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            self.written.lock().unwrap().insert(pbn, data.to_vec());
            Ok(())
        }
    }

    fn test_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.buf_enabled = true;
        cfg.buf_size = crate::config::MIN_BUF_SIZE;
        cfg.buf_count = 1;
        cfg.buf_stride = 1;
        cfg.buf_batch = 4;
        cfg
    }

    #[test]
    fn write_then_read_hits_buffer() {
        let cfg = test_cfg();
        let wb = WriteBuffer::new(&cfg).unwrap();
        let pbi_table = PbiTable::new(1024);
        let target = RecordingTarget::new();
        let data = vec![5u8; cfg.block_size as usize];
        wb.write(3, &data, &pbi_table, &target).unwrap();
        let mut out = vec![0u8; cfg.block_size as usize];
        assert!(wb.read(3, &mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn flush_batch_drains_and_clears_dirty() {
        let cfg = test_cfg();
        let wb = WriteBuffer::new(&cfg).unwrap();
        let pbi_table = PbiTable::new(1024);
        let target = RecordingTarget::new();
        let data = vec![9u8; cfg.block_size as usize];
        wb.write(1, &data, &pbi_table, &target).unwrap();
        wb.write(2, &data, &pbi_table, &target).unwrap();
        let flushed = wb.flush_batch(&target, &pbi_table).unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(target.flushed.load(Ordering::SeqCst), 2);
        assert_eq!(wb.ring.lock_shared().num_dirty, 0);
    }

    #[test]
    fn overwrite_same_pbn_does_not_double_count_dirty() {
        let cfg = test_cfg();
        let wb = WriteBuffer::new(&cfg).unwrap();
        let pbi_table = PbiTable::new(1024);
        let target = RecordingTarget::new();
        let data = vec![1u8; cfg.block_size as usize];
        wb.write(7, &data, &pbi_table, &target).unwrap();
        wb.write(7, &data, &pbi_table, &target).unwrap();
        assert_eq!(wb.ring.lock_shared().num_dirty, 1);
    }

    /// A buffer with only as many slots as blocks written: every write past
    /// capacity must trigger a synchronous flush-and-retry (`spec.md` §4.E
    /// Allocation step 2) rather than clobbering a still-dirty slot.
    #[test]
    fn write_past_capacity_flushes_synchronously_and_loses_nothing() {
        let mut cfg = test_cfg();
        cfg.block_size = 4096;
        cfg.buf_size = crate::config::MIN_BUF_SIZE;
        let wb = WriteBuffer::new(&cfg).unwrap();
        let slot_count = wb.slot_count();
        let pbi_table = PbiTable::new(slot_count as u64 * 4);
        let target = RecordingTarget::new();

        let total_writes = slot_count * 3 + 1;
        for pbn in 0..total_writes as u64 {
            let data = vec![(pbn % 251) as u8; cfg.block_size as usize];
            wb.write(pbn, &data, &pbi_table, &target).unwrap();
        }
        loop {
            if wb.flush_batch(&target, &pbi_table).unwrap() == 0 {
                break;
            }
        }
        // Whatever is still resident in the buffer must also be observable.
        for pbn in 0..total_writes as u64 {
            let mut out = vec![0u8; cfg.block_size as usize];
            let expected = vec![(pbn % 251) as u8; cfg.block_size as usize];
            if wb.read(pbn, &mut out) {
                assert_eq!(out, expected, "buffered pbn {pbn} has wrong bytes");
            } else {
                let flushed = target.written.lock().unwrap();
                assert_eq!(
                    flushed.get(&pbn),
                    Some(&expected),
                    "pbn {pbn} is neither buffered nor flushed — write lost"
                );
            }
        }
    }
}
