// SPDX-License-Identifier: MIT

//! A guard-based spinlock, grounded on the teacher's `bindings::spinlock`
//! API (`lock()`/`lock_shared()` returning RAII guards) but backed by the
//! real `spin` crate instead of a hand-rolled test-and-set loop over a C
//! runtime call.

use std::ops::{Deref, DerefMut};

/// Exclusive/shared lock over `T`. The `SHARED` flag mirrors the teacher's
/// const-generic split between plain mutual exclusion and reader/writer
/// locking: `Spinlock<T, false>` is a plain mutex, `Spinlock<T, true>` allows
/// concurrent shared readers.
pub struct Spinlock<T, const SHARED: bool = false> {
    inner: spin::RwLock<T>,
}

impl<T, const SHARED: bool> Spinlock<T, SHARED> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            inner: spin::RwLock::new(value),
        }
    }

    /// Acquire exclusive access.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        SpinGuard {
            guard: self.inner.write(),
        }
    }

    /// Acquire shared (read) access. For `SHARED = false` locks this still
    /// type-checks but callers should prefer [`Spinlock::lock`]; the type
    /// parameter documents intent rather than gating the API.
    pub fn lock_shared(&self) -> SpinGuardShared<'_, T> {
        SpinGuardShared {
            guard: self.inner.read(),
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.inner.try_write().map(|guard| SpinGuard { guard })
    }
}

pub struct SpinGuard<'a, T> {
    guard: spin::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct SpinGuardShared<'a, T> {
    guard: spin::RwLockReadGuard<'a, T>,
}

impl<T> Deref for SpinGuardShared<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_and_shared_access() {
        let lock: Spinlock<u32> = Spinlock::new(0);
        *lock.lock() = 42;
        assert_eq!(*lock.lock_shared(), 42);
    }
}
