// SPDX-License-Identifier: MIT

//! Copy primitives (`spec.md` §4.B): non-temporal store/load when enabled
//! and available, otherwise a regular copy plus explicit cache-line flush
//! and a mandatory store-fence. Policy is read from [`crate::config::Config`]
//! rather than from actual hardware cache-attribute state, matching the
//! recorded-policy model of [`crate::region::Region`].

use crate::config::Config;

/// Fixed cache-line size assumed throughout.
pub const CACHE_LINE: usize = 64;

/// Copy `src` into `dst` (`dst.len() == src.len()`, multiple of 8 bytes)
/// honouring `cfg.nts`/`cfg.clflush`/`cfg.wb`/`cfg.subupdate`, ending with the
/// mandatory store-fence whenever a non-temporal or flush path was taken.
/// `fua` is the request's resolved FUA intent (`spec.md` §4.B: "flush path:
/// if `clflush` or (FUA ∧ WB ∧ ¬`nts`)") — callers pass `false` for copies
/// that are not part of a FUA-flagged write.
///
/// # Safety
/// `dst` must be writable (block-permission gate open) for the duration.
pub unsafe fn store(cfg: &Config, dst: &mut [u8], src: &[u8], fua: bool) {
    debug_assert_eq!(dst.len(), src.len());
    if cfg.subupdate {
        unsafe { store_subupdate(cfg, dst, src, fua) };
        return;
    }
    unsafe { store_unconditional(cfg, dst, src, fua) };
}

/// Store `src` into `dst` without consulting `subupdate` — the plain
/// nts-or-copy-plus-flush path, also used per differing cache line by
/// [`store_subupdate`].
unsafe fn store_unconditional(cfg: &Config, dst: &mut [u8], src: &[u8], fua: bool) {
    if cfg.nts && nts_available() {
        unsafe { store_nontemporal(dst, src) };
        fence();
        return;
    }
    dst.copy_from_slice(src);
    let needs_flush =
        cfg.clflush || (fua && cfg.effective_cache() == crate::config::CacheMode::Wb && !cfg.nts);
    if needs_flush {
        unsafe { flush_range(dst) };
    }
    if needs_flush || cfg.wb {
        fence();
    }
}

/// Compare `src` against `dst` cache line by cache line and only store the
/// lines that differ (`spec.md` §3 `subupdate`: "writing data identical to
/// current bytes performs no store").
unsafe fn store_subupdate(cfg: &Config, dst: &mut [u8], src: &[u8], fua: bool) {
    let len = dst.len();
    let mut i = 0;
    while i < len {
        let end = (i + CACHE_LINE).min(len);
        if dst[i..end] != src[i..end] {
            unsafe { store_unconditional(cfg, &mut dst[i..end], &src[i..end], fua) };
        }
        i += CACHE_LINE;
    }
}

/// Load `dst.len()` bytes from `src` into `dst`, honouring `cfg.nts` for
/// non-temporal loads. Loads never need a flush; a load-fence is only
/// meaningful after non-temporal loads, for which `_mm_stream_load_si64`
/// already carries the required ordering internally on current x86_64.
///
/// # Safety
/// `src` must be readable for the duration.
pub unsafe fn load(cfg: &Config, dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    if cfg.nts && nts_available() {
        unsafe { load_nontemporal(dst, src) };
        return;
    }
    dst.copy_from_slice(src);
}

/// Flush every cache line covering `range` back to memory.
///
/// # Safety
/// `range` must be a valid, currently-mapped byte range.
pub unsafe fn flush_range(range: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        flush_range_x86_64(range);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = range;
    }
}

/// Store-fence: orders prior stores (including non-temporal ones) ahead of
/// whatever follows. Always required after a non-temporal store or an
/// explicit flush.
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
}

fn nts_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::is_x86_feature_detected!("sse2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn store_nontemporal(dst: &mut [u8], src: &[u8]) {
    use core::arch::x86_64::{_mm_stream_si128, _mm_stream_si64};

    let len = dst.len();
    let mut i = 0;
    if std::is_x86_feature_detected!("sse4.1") {
        while i + 16 <= len {
            let mut chunk = [0u8; 16];
            chunk.copy_from_slice(&src[i..i + 16]);
            let value = i128::from_ne_bytes(chunk);
            unsafe {
                _mm_stream_si128(
                    dst.as_mut_ptr().add(i) as *mut core::arch::x86_64::__m128i,
                    core::mem::transmute::<i128, core::arch::x86_64::__m128i>(value),
                );
            }
            i += 16;
        }
    }
    while i + 8 <= len {
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&src[i..i + 8]);
        let value = i64::from_ne_bytes(chunk);
        unsafe {
            _mm_stream_si64(dst.as_mut_ptr().add(i) as *mut i64, value);
        }
        i += 8;
    }
    if i < len {
        dst[i..].copy_from_slice(&src[i..]);
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn load_nontemporal(dst: &mut [u8], src: &[u8]) {
    use core::arch::x86_64::_mm_stream_load_si64;

    let len = src.len();
    let mut i = 0;
    while i + 8 <= len {
        let value = unsafe { _mm_stream_load_si64(src.as_ptr().add(i) as *mut i64) };
        dst[i..i + 8].copy_from_slice(&value.to_ne_bytes());
        i += 8;
    }
    if i < len {
        dst[i..].copy_from_slice(&src[i..]);
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_range_x86_64(range: &[u8]) {
    use core::arch::x86_64::{_mm_clflush, _mm_clflushopt};

    let base = range.as_ptr() as usize;
    let end = base + range.len();
    let has_clflushopt = std::is_x86_feature_detected!("clflushopt");
    let mut addr = base - (base % CACHE_LINE);
    while addr < end {
        unsafe {
            if has_clflushopt {
                _mm_clflushopt(addr as *mut u8);
            } else {
                _mm_clflush(addr as *mut u8);
            }
        }
        addr += CACHE_LINE;
    }
}
