//! Synchronization primitives used by the thread store and the hijack
//! protocol.
//!
//! * [`Crst`] is a mutex that records its owner in debug builds.
//! * [`ReaderWriterLock`] prefers writers, spins with backoff and can be made
//!   aware of pending garbage collections.
//! * [`SpinLock`] never parks the waiting thread.
//! * [`Event`] is a manual-reset event.

mod crst;
mod event;
mod rwlock;
mod spin;

pub use crst::{Crst, CrstGuard};
pub use event::Event;
pub use rwlock::{ReadGuard, ReaderWriterLock, WriteGuard};
pub use spin::{SpinLock, SpinLockGuard};

use core::sync::atomic::{AtomicU64, Ordering};

/// A process-unique, never-zero token for the calling OS thread.
pub(crate) fn current_thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    std::thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_tokens_are_distinct() {
        let here = current_thread_token();
        assert_ne!(here, 0);
        assert_eq!(here, current_thread_token());
        let there = std::thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, there);
    }
}
