// SPDX-License-Identifier: MIT

//! `pmbd`: a persistent-memory block device emulator.
//!
//! Emulates a byte-addressable persistent-memory-backed block device over
//! an ordinary DRAM region: write-protected persistence with an optional
//! non-temporal-store/cache-flush discipline, an optional DRAM write
//! buffer with a background flusher, and a latency/bandwidth emulator
//! driven by a calibrated cycle counter. See [`Device`] for the entry
//! point.

pub mod badgelib;
pub mod buffer;
pub mod checksum;
pub mod config;
pub mod copy;
pub mod device;
pub mod emulator;
pub mod error;
pub mod pbi;
pub mod permgate;
pub mod region;

pub use config::Config;
pub use device::Device;
pub use error::{EResult, Error};
