// SPDX-License-Identifier: MIT

//! Device configuration: the structured builder and the `key=value,...`
//! options-string front end described in `spec.md` §3 and §6.

use crate::error::{EResult, Error};

/// Page cacheability mode (`spec.md` §3, §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Write-back.
    Wb,
    /// Write-combining.
    Wc,
    /// Uncacheable.
    Uc,
    /// Uncacheable, overridable by WC.
    UcMinus,
}

impl CacheMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "WB" | "wb" => Some(CacheMode::Wb),
            "WC" | "wc" => Some(CacheMode::Wc),
            "UC" | "uc" => Some(CacheMode::Uc),
            "UC-" | "uc-" | "UCMinus" => Some(CacheMode::UcMinus),
            _ => None,
        }
    }
}

/// How the block-permission gate opens a RW window (`spec.md` §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpMode {
    /// Walk the range and flip each page's write bit.
    Pte,
    /// Flip the processor-wide write-protect enable under interrupts-disabled.
    Cr0,
}

impl WpMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "PTE" | "pte" => Some(WpMode::Pte),
            "CR0" | "cr0" => Some(WpMode::Cr0),
            _ => None,
        }
    }
}

/// Where the emulator's request-level wrapper sits (`spec.md` §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Wrap the whole request.
    WholeRequest,
    /// Wrap each memcpy inside the write path.
    PerMemcpy,
}

/// Block size in bytes; fixed at construction, default 4 KiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
/// Sector size in bytes; request-level unit.
pub const SECTOR_SIZE: u64 = 512;
/// Minimum DRAM write-buffer size, per `spec.md` §7 `BadConfig` rule.
pub const MIN_BUF_SIZE: u64 = 4 * 1024 * 1024;

static_assertions::const_assert!(DEFAULT_BLOCK_SIZE % SECTOR_SIZE == 0);
static_assertions::const_assert!(MIN_BUF_SIZE % DEFAULT_BLOCK_SIZE == 0);

/// Immutable device configuration record (`spec.md` §3's configuration table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cache: CacheMode,
    pub nts: bool,
    pub ntl: bool,
    pub clflush: bool,
    pub wb: bool,
    pub fua: bool,
    pub wrprot: bool,
    pub wpmode: WpMode,
    pub wrverify: bool,
    pub checksum: bool,
    pub lock: bool,
    pub subupdate: bool,

    pub buf_enabled: bool,
    pub buf_size: u64,
    pub buf_count: u32,
    pub buf_stride: u32,
    pub buf_batch: u32,

    pub rdlat_ns: u64,
    pub wrlat_ns: u64,
    pub rdbw_bytes_per_sec: u64,
    pub wrbw_bytes_per_sec: u64,
    pub rdsx: u32,
    pub wrsx: u32,
    pub rdpause_cycles: u64,
    pub wrpause_cycles: u64,
    pub simmode: SimMode,

    pub block_size: u64,
    pub capacity_blocks: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache: CacheMode::Wb,
            nts: false,
            ntl: false,
            clflush: false,
            wb: false,
            fua: false,
            wrprot: false,
            wpmode: WpMode::Pte,
            wrverify: false,
            checksum: false,
            lock: true,
            subupdate: false,

            buf_enabled: false,
            buf_size: MIN_BUF_SIZE,
            buf_count: 1,
            buf_stride: 1,
            buf_batch: 32,

            rdlat_ns: 0,
            wrlat_ns: 0,
            rdbw_bytes_per_sec: 0,
            wrbw_bytes_per_sec: 0,
            rdsx: 1,
            wrsx: 1,
            rdpause_cycles: 0,
            wrpause_cycles: 0,
            simmode: SimMode::WholeRequest,

            block_size: DEFAULT_BLOCK_SIZE,
            capacity_blocks: 0,
        }
    }
}

impl Config {
    /// Validate cross-option invariants, the activation-time `BadConfig` checks of `spec.md` §7.
    pub fn validate(&self) -> EResult<()> {
        if self.buf_enabled && self.buf_size < MIN_BUF_SIZE {
            return Err(Error::BadConfig(format!(
                "buf.size must be >= {MIN_BUF_SIZE} bytes"
            )));
        }
        if self.buf_count == 0 {
            return Err(Error::BadConfig("buf.count must be >= 1".into()));
        }
        if self.buf_stride == 0 {
            return Err(Error::BadConfig("buf.stride must be >= 1".into()));
        }
        if self.buf_batch == 0 {
            return Err(Error::BadConfig("buf.batch must be >= 1".into()));
        }
        if !self.block_size.is_power_of_two() || self.block_size < SECTOR_SIZE {
            return Err(Error::BadConfig(
                "block size must be a power of two >= sector size".into(),
            ));
        }
        Ok(())
    }

    /// Effective cacheability, honouring `ntl`'s forced-WC rule (`spec.md` §3).
    pub fn effective_cache(&self) -> CacheMode {
        if self.ntl { CacheMode::Wc } else { self.cache }
    }

    /// Parse a `key=value,key2=value2` options string into a `Config`,
    /// starting from defaults. Unknown or malformed keys fail with `BadConfig`.
    pub fn from_options_str(s: &str) -> EResult<Self> {
        let mut cfg = Config::default();
        for raw_pair in s.split(',') {
            let raw_pair = raw_pair.trim();
            if raw_pair.is_empty() {
                continue;
            }
            let (key, value) = match raw_pair.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (raw_pair, None),
            };
            cfg.apply_option(key, value)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_option(&mut self, key: &str, value: Option<&str>) -> EResult<()> {
        fn parse_bool(key: &str, value: Option<&str>) -> EResult<bool> {
            match value {
                None | Some("on") | Some("1") | Some("true") => Ok(true),
                Some("off") | Some("0") | Some("false") => Ok(false),
                Some(other) => Err(Error::BadConfig(format!(
                    "{key}: expected on/off, got '{other}'"
                ))),
            }
        }
        fn parse_u64(key: &str, value: Option<&str>) -> EResult<u64> {
            value
                .ok_or_else(|| Error::BadConfig(format!("{key}: missing value")))?
                .parse()
                .map_err(|_| Error::BadConfig(format!("{key}: not an integer")))
        }
        fn parse_u32(key: &str, value: Option<&str>) -> EResult<u32> {
            Ok(parse_u64(key, value)? as u32)
        }
        fn parse_size(key: &str, value: Option<&str>) -> EResult<u64> {
            let value = value.ok_or_else(|| Error::BadConfig(format!("{key}: missing value")))?;
            let (digits, mult) = match value.chars().last() {
                Some('k') | Some('K') => (&value[..value.len() - 1], 1024),
                Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
                Some('g') | Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
                _ => (value, 1),
            };
            let base: u64 = digits
                .parse()
                .map_err(|_| Error::BadConfig(format!("{key}: not a size")))?;
            Ok(base * mult)
        }

        match key {
            "cache" => {
                self.cache = CacheMode::parse(
                    value.ok_or_else(|| Error::BadConfig("cache: missing value".into()))?,
                )
                .ok_or_else(|| Error::BadConfig(format!("cache: bad value '{value:?}'")))?
            }
            "nts" => self.nts = parse_bool(key, value)?,
            "ntl" => self.ntl = parse_bool(key, value)?,
            "clflush" => self.clflush = parse_bool(key, value)?,
            "wb" => self.wb = parse_bool(key, value)?,
            "fua" => self.fua = parse_bool(key, value)?,
            "wrprot" => self.wrprot = parse_bool(key, value)?,
            "wpmode" => {
                self.wpmode = WpMode::parse(
                    value.ok_or_else(|| Error::BadConfig("wpmode: missing value".into()))?,
                )
                .ok_or_else(|| Error::BadConfig(format!("wpmode: bad value '{value:?}'")))?
            }
            "wrverify" => self.wrverify = parse_bool(key, value)?,
            "checksum" => self.checksum = parse_bool(key, value)?,
            "lock" => self.lock = parse_bool(key, value)?,
            "subupdate" => self.subupdate = parse_bool(key, value)?,
            "buf" => self.buf_enabled = parse_bool(key, value)?,
            "buf.size" => self.buf_size = parse_size(key, value)?,
            "buf.count" => self.buf_count = parse_u32(key, value)?,
            "buf.stride" => self.buf_stride = parse_u32(key, value)?,
            "buf.batch" => self.buf_batch = parse_u32(key, value)?,
            "rdlat" => self.rdlat_ns = parse_u64(key, value)?,
            "wrlat" => self.wrlat_ns = parse_u64(key, value)?,
            "rdbw" => self.rdbw_bytes_per_sec = parse_u64(key, value)?,
            "wrbw" => self.wrbw_bytes_per_sec = parse_u64(key, value)?,
            "rdsx" => self.rdsx = parse_u32(key, value)?.max(1),
            "wrsx" => self.wrsx = parse_u32(key, value)?.max(1),
            "rdpause" => self.rdpause_cycles = parse_u64(key, value)?,
            "wrpause" => self.wrpause_cycles = parse_u64(key, value)?,
            "simmode" => {
                self.simmode = match parse_u32(key, value)? {
                    0 => SimMode::WholeRequest,
                    1 => SimMode::PerMemcpy,
                    other => {
                        return Err(Error::BadConfig(format!(
                            "simmode: expected 0 or 1, got {other}"
                        )));
                    }
                }
            }
            other => return Err(Error::BadConfig(format!("unknown option '{other}'"))),
        }
        Ok(())
    }
}
