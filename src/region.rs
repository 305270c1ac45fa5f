// SPDX-License-Identifier: MIT

//! The reserved memory region backing persistence (`spec.md` §3, §4.A).
//!
//! Grounded on the teacher's `mem::vmm` mapping layer: a region owns a
//! contiguous virtual range and a recorded cacheability policy, and leaves
//! the actual flush/fence discipline to the copy primitives (§4.B) that
//! read the recorded policy rather than hardware MTRR state.

use crate::config::CacheMode;
use crate::error::{EResult, Error};
use std::ffi::c_void;

/// A reserved, page-aligned span of memory standing in for persistent
/// storage. Owns its mapping; unmaps on drop.
pub struct Region {
    base: *mut u8,
    len: usize,
    page_size: usize,
    cache: CacheMode,
}

// SAFETY: the region is just a raw memory mapping; all synchronization of
// concurrent access to its contents is the caller's responsibility (the
// device core enforces it via the block-permission gate and PBI locks).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve and map `len` bytes (rounded up to a whole number of pages),
    /// initially writable, with the given cacheability policy recorded.
    pub fn map(len: usize, cache: CacheMode) -> EResult<Self> {
        if len == 0 {
            return Err(Error::BadConfig("region length must be nonzero".into()));
        }
        let page_size = page_size();
        let mapped_len = round_up(len, page_size);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        Ok(Region {
            base: ptr as *mut u8,
            len: mapped_len,
            page_size,
            cache,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Recorded cacheability policy; copy primitives consult this to decide
    /// whether non-temporal stores and explicit flushes are meaningful.
    pub fn cacheability(&self) -> CacheMode {
        self.cache
    }

    /// Record a new cacheability policy. Best-effort: this host has no
    /// portable userspace knob to actually change page cache attributes
    /// outside of device-memory mappings, so this only updates the policy
    /// that the copy primitives (§4.B) key off of.
    pub fn set_cacheability(&mut self, cache: CacheMode) {
        self.cache = cache;
    }

    /// Raw pointer to byte `offset` within the region. Caller must ensure
    /// `offset + len <= self.len()`.
    pub fn addr_of(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.base.add(offset) }
    }

    /// Whole-region slice view, valid only while holding the appropriate
    /// permission/lock per the caller's access discipline.
    ///
    /// # Safety
    /// Caller must ensure no concurrent mutable aliasing.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    /// # Safety
    /// Caller must ensure no concurrent aliasing and that the range is
    /// currently writable (block-permission gate open).
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_rounds_to_page_size() {
        let region = Region::map(1, CacheMode::Wb).unwrap();
        assert_eq!(region.len() % region.page_size(), 0);
        assert!(region.len() >= region.page_size());
    }

    #[test]
    fn rejects_zero_length() {
        assert!(Region::map(0, CacheMode::Wb).is_err());
    }

    #[test]
    fn addr_of_is_in_bounds() {
        let region = Region::map(4096, CacheMode::Wb).unwrap();
        unsafe {
            let slice = region.as_mut_slice();
            slice[0] = 0xAB;
            slice[region.len() - 1] = 0xCD;
        }
        assert_eq!(unsafe { *region.addr_of(0) }, 0xAB);
    }
}
