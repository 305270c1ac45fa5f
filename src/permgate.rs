// SPDX-License-Identifier: MIT

//! Block-permission gate (`spec.md` §4.C): opens and closes a RW window
//! over a byte range of the [`crate::region::Region`], either by flipping
//! page table entries (`PTE` mode, a real `mprotect`) or by taking the
//! process-wide CR0 fallback capability on top of that same `mprotect`
//! toggle (`CR0` mode, §9: "fall back to the PTE mode uniformly" when a real
//! CR0.WP bit is unavailable to a userspace process).

use crate::badgelib::cr0::Cr0Guard;
use crate::config::WpMode;
use crate::error::{EResult, Error};
use std::ffi::c_void;

/// An open RW window. Closes (re-protects the pages) on drop.
pub enum Window {
    Pte { addr: *mut u8, len: usize },
    Cr0 { addr: *mut u8, len: usize, _guard: Cr0Guard },
}

impl Drop for Window {
    fn drop(&mut self) {
        let (addr, len) = match self {
            Window::Pte { addr, len } => (*addr, *len),
            Window::Cr0 { addr, len, .. } => (*addr, *len),
        };
        unsafe {
            libc::mprotect(addr as *mut c_void, len, libc::PROT_READ);
        }
    }
}

/// Open a RW window covering `[addr, addr+len)` under the given mode.
/// `addr`/`len` need not be page-aligned; both modes round outward to whole
/// pages for the `mprotect` call. CR0 mode additionally takes the
/// process-wide capability so at most one CR0-mode window is open at a
/// time, standing in for "interrupts disabled" on a real CR0.WP toggle.
pub fn open(mode: WpMode, addr: *mut u8, len: usize, page_size: usize) -> EResult<Window> {
    let (page_addr, page_len) = align_to_pages(addr, len, page_size);
    match mode {
        WpMode::Pte => {
            mprotect_rw(page_addr, page_len)?;
            Ok(Window::Pte {
                addr: page_addr,
                len: page_len,
            })
        }
        WpMode::Cr0 => {
            let guard = Cr0Guard::open();
            mprotect_rw(page_addr, page_len)?;
            Ok(Window::Cr0 {
                addr: page_addr,
                len: page_len,
                _guard: guard,
            })
        }
    }
}

fn mprotect_rw(addr: *mut u8, len: usize) -> EResult<()> {
    let rc = unsafe { libc::mprotect(addr as *mut c_void, len, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(Error::InternalInvariant("mprotect(RW) failed"));
    }
    Ok(())
}

fn align_to_pages(addr: *mut u8, len: usize, page_size: usize) -> (*mut u8, usize) {
    let start = addr as usize;
    let end = start + len;
    let aligned_start = start - (start % page_size);
    let aligned_end = end.div_ceil(page_size) * page_size;
    (aligned_start as *mut u8, aligned_end - aligned_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::region::Region;

    #[test]
    fn pte_window_opens_and_closes() {
        let region = Region::map(4096, CacheMode::Wb).unwrap();
        let page_size = region.page_size();
        {
            let _window = open(WpMode::Pte, region.addr_of(0), 16, page_size).unwrap();
            unsafe {
                region.as_mut_slice()[0] = 42;
            }
        }
        assert_eq!(unsafe { region.as_slice()[0] }, 42);
    }

    #[test]
    fn cr0_window_opens_and_closes() {
        let region = Region::map(4096, CacheMode::Wb).unwrap();
        let page_size = region.page_size();
        {
            let _window = open(WpMode::Cr0, region.addr_of(0), 16, page_size).unwrap();
            unsafe {
                region.as_mut_slice()[0] = 7;
            }
        }
        assert_eq!(unsafe { region.as_slice()[0] }, 7);
    }
}
