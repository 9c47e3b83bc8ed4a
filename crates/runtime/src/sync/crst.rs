use super::current_thread_token;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A named mutual-exclusion lock.
///
/// Debug builds remember which thread holds the lock so that callers can
/// assert ownership with [`Crst::owned_by_current_thread`].
#[derive(Debug)]
pub struct Crst<T> {
    name: &'static str,
    inner: Mutex<T>,
    owner: AtomicU64,
}

impl<T> Crst<T> {
    pub const fn new(name: &'static str, value: T) -> Crst<T> {
        Crst {
            name,
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> CrstGuard<'_, T> {
        debug_assert!(
            !self.owned_by_current_thread(),
            "recursive acquisition of {}",
            self.name
        );
        // A panic while holding the lock leaves the data as consistent as
        // the panicking code left it; keep going.
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if cfg!(debug_assertions) {
            self.owner.store(current_thread_token(), Ordering::Relaxed);
        }
        CrstGuard { crst: self, guard }
    }

    /// Whether the calling thread holds the lock. Always false in release
    /// builds.
    pub fn owned_by_current_thread(&self) -> bool {
        cfg!(debug_assertions) && self.owner.load(Ordering::Relaxed) == current_thread_token()
    }
}

pub struct CrstGuard<'a, T> {
    crst: &'a Crst<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for CrstGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CrstGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CrstGuard<'_, T> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            self.crst.owner.store(0, Ordering::Relaxed);
        }
    }
}
