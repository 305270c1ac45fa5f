// SPDX-License-Identifier: MIT

//! Checksum store (`spec.md` §4.F): a CRC-32 per physical block, checked
//! on read and updated on write when `checksum` is enabled. Grounded on the
//! teacher's GPT partition-table driver, which uses the same `crc` crate
//! and polynomial for its header checksums.

use crate::badgelib::spinlock::Spinlock;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// One CRC-32 slot per physical block.
pub struct ChecksumTable {
    entries: Vec<Spinlock<u32>>,
}

impl ChecksumTable {
    pub fn new(capacity_blocks: u64) -> Self {
        let mut entries = Vec::with_capacity(capacity_blocks as usize);
        entries.resize_with(capacity_blocks as usize, || Spinlock::new(0));
        ChecksumTable { entries }
    }

    /// Compute the CRC-32 of `block`.
    pub fn compute(block: &[u8]) -> u32 {
        CRC32.checksum(block)
    }

    /// Store the checksum of `block` for `pbn`.
    pub fn update(&self, pbn: u64, block: &[u8]) {
        *self.entries[pbn as usize].lock() = Self::compute(block);
    }

    /// Verify `block` against the stored checksum for `pbn`.
    pub fn verify(&self, pbn: u64, block: &[u8]) -> bool {
        *self.entries[pbn as usize].lock_shared() == Self::compute(block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the table as a flat little-endian byte buffer, for callers
    /// that persist it out of band (`spec.md` §6: "the checksum table is
    /// not part of the region in this specification ... implementations
    /// that persist it must store it out of band and recover on attach").
    pub fn snapshot(&self) -> Vec<u8> {
        let values: Vec<u32> = self.entries.iter().map(|e| *e.lock_shared()).collect();
        bytemuck::cast_slice(&values).to_vec()
    }

    /// Rebuild a table from a snapshot produced by [`ChecksumTable::snapshot`].
    pub fn restore(bytes: &[u8]) -> crate::error::EResult<Self> {
        let values: &[u32] = bytemuck::try_cast_slice(bytes)
            .map_err(|_| crate::error::Error::BadConfig("malformed checksum snapshot".into()))?;
        let entries = values.iter().map(|&v| Spinlock::new(v)).collect();
        Ok(ChecksumTable { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_verify_succeeds() {
        let table = ChecksumTable::new(2);
        let block = vec![1u8; 4096];
        table.update(0, &block);
        assert!(table.verify(0, &block));
    }

    #[test]
    fn corruption_fails_verify() {
        let table = ChecksumTable::new(2);
        let block = vec![1u8; 4096];
        table.update(0, &block);
        let mut corrupted = block.clone();
        corrupted[0] ^= 0xff;
        assert!(!table.verify(0, &corrupted));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let table = ChecksumTable::new(4);
        let block = vec![2u8; 4096];
        table.update(1, &block);
        let bytes = table.snapshot();
        let restored = ChecksumTable::restore(&bytes).unwrap();
        assert!(restored.verify(1, &block));
    }
}
