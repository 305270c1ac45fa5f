// SPDX-License-Identifier: MIT

//! CR0-mode fallback capability, grounded on the teacher's `badgelib::irq`
//! `IrqGuard` (acquire-on-construct, release-on-drop). A hosted process has
//! no CR0.WP bit to flip, so per `spec.md` §9/§4.C this models "interrupts
//! disabled, write-protect off" as a single process-wide capability: while
//! held, no other CR0-mode window may be open.

use std::sync::Mutex;

static CR0_CAPABILITY: Mutex<()> = Mutex::new(());

/// Guard representing an open CR0-mode RW window. Dropping it closes the
/// window. Mirrors `IrqGuard`'s disable-on-new/enable-on-drop shape.
pub struct Cr0Guard {
    _permit: std::sync::MutexGuard<'static, ()>,
}

impl Cr0Guard {
    /// Open a CR0-mode window. Blocks until any other CR0 window closes,
    /// standing in for the original's single-core interrupt-disable section.
    pub fn open() -> Self {
        let permit = CR0_CAPABILITY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Cr0Guard { _permit: permit }
    }
}
