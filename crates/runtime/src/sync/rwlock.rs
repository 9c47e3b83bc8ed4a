use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WRITER_HELD: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;
const READERS: u32 = WRITER_WAITING - 1;

/// A reader/writer lock that gives waiting writers preference.
///
/// A writer that cannot get the lock announces itself; from then on no new
/// reader gets in, and [`ReaderWriterLock::try_read`] fails, until a writer
/// has held and released the lock. Waiters spin with exponential backoff up
/// to the configured spin count and then yield. A GC-aware lock sleeps
/// instead of spinning while a suspension is in progress, so that it does not
/// compete with the suspending thread for CPU time.
pub struct ReaderWriterLock<T> {
    state: AtomicU32,
    spin_count: u32,
    trap_threads: Option<Arc<AtomicBool>>,
    value: UnsafeCell<T>,
}

// SAFETY: the lock hands out `&T` to many readers or `&mut T` to one writer.
unsafe impl<T: Send> Send for ReaderWriterLock<T> {}
unsafe impl<T: Send + Sync> Sync for ReaderWriterLock<T> {}

impl<T> ReaderWriterLock<T> {
    pub fn new(value: T, spin_count: u32) -> ReaderWriterLock<T> {
        ReaderWriterLock {
            state: AtomicU32::new(0),
            spin_count,
            trap_threads: None,
            value: UnsafeCell::new(value),
        }
    }

    /// A lock whose waiters back off while `trap_threads` is set.
    pub fn gc_aware(value: T, spin_count: u32, trap_threads: Arc<AtomicBool>) -> ReaderWriterLock<T> {
        ReaderWriterLock {
            trap_threads: Some(trap_threads),
            ..ReaderWriterLock::new(value, spin_count)
        }
    }

    /// Take a read lock without waiting.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & (WRITER_HELD | WRITER_WAITING) != 0 {
                return None;
            }
            debug_assert!(state & READERS != READERS, "reader count overflow");
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ReadGuard { lock: self }),
                Err(actual) => state = actual,
            }
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut round = 0;
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            self.back_off(&mut round);
        }
    }

    /// Take the write lock without waiting.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        let state = self.state.load(Ordering::Relaxed);
        if state & !WRITER_WAITING != 0 {
            return None;
        }
        self.state
            .compare_exchange(state, WRITER_HELD, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut round = 0;
        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }
            self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            self.back_off(&mut round);
        }
    }

    /// Whether a writer holds or is waiting for the lock.
    pub fn writer_pending(&self) -> bool {
        self.state.load(Ordering::Relaxed) & (WRITER_HELD | WRITER_WAITING) != 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn back_off(&self, round: &mut u32) {
        if let Some(trap) = &self.trap_threads
            && trap.load(Ordering::Relaxed)
        {
            std::thread::sleep(Duration::from_millis(1));
            return;
        }
        let spins = 1u32.checked_shl(*round).unwrap_or(u32::MAX);
        if spins <= self.spin_count {
            for _ in 0..spins {
                core::hint::spin_loop();
            }
            *round += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

impl<T: Default> Default for ReaderWriterLock<T> {
    fn default() -> ReaderWriterLock<T> {
        ReaderWriterLock::new(T::default(), 0)
    }
}

impl<T> core::fmt::Debug for ReaderWriterLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("ReaderWriterLock")
            .field("readers", &(state & READERS))
            .field("writer_held", &(state & WRITER_HELD != 0))
            .field("writer_waiting", &(state & WRITER_WAITING != 0))
            .finish_non_exhaustive()
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a ReaderWriterLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold a read lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a ReaderWriterLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the write lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the write lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER_HELD, Ordering::Release);
    }
}
