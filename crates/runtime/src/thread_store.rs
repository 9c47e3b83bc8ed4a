//! The set of threads known to the runtime, and stopping them all.

use crate::config::RuntimeConfig;
use crate::instance::RuntimeInstance;
use crate::pal::Pal;
use crate::sync::{Crst, Event};
use crate::thread::{Thread, ThreadStateFlags};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use mrt_unwinder::WalkableThread;
use std::sync::Arc;
use std::time::Duration;

pub struct ThreadStore {
    threads: Crst<Vec<Arc<Thread>>>,
    trap_threads: Arc<AtomicBool>,
    suspending_thread: AtomicU64,
    gc_complete: Event,
    backoff: Duration,
    max_backoff: Duration,
}

impl ThreadStore {
    pub fn new(config: &RuntimeConfig) -> ThreadStore {
        ThreadStore {
            threads: Crst::new("thread-store", Vec::new()),
            trap_threads: Arc::new(AtomicBool::new(false)),
            suspending_thread: AtomicU64::new(0),
            gc_complete: Event::new(true),
            backoff: config.initial_suspend_backoff(),
            max_backoff: config.max_suspend_backoff(),
        }
    }

    pub(crate) fn trap_flag(&self) -> Arc<AtomicBool> {
        self.trap_threads.clone()
    }

    /// Whether threads must stop at their next poll point.
    pub fn is_trap_threads_requested(&self) -> bool {
        self.trap_threads.load(Ordering::SeqCst)
    }

    pub fn attach(&self, thread: Arc<Thread>) {
        debug_assert!(!thread.state().contains(ThreadStateFlags::DETACHED));
        let mut threads = self.threads.lock();
        debug_assert!(!threads.iter().any(|t| Arc::ptr_eq(t, &thread)));
        thread.set_state(ThreadStateFlags::ATTACHED);
        log::debug!("attached thread {}", thread.id());
        threads.push(thread);
    }

    /// Remove a thread from the store. It may not come back.
    pub fn detach(&self, thread: &Thread) -> bool {
        let mut threads = self.threads.lock();
        let Some(index) = threads.iter().position(|t| core::ptr::eq(&**t, thread)) else {
            return false;
        };
        threads.swap_remove(index);
        thread.clear_state(ThreadStateFlags::ATTACHED);
        thread.set_state(ThreadStateFlags::DETACHED);
        log::debug!("detached thread {}", thread.id());
        true
    }

    /// The attached threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    /// Stop every attached thread but `current` at a walkable point.
    ///
    /// Threads already at a transition frame are left alone; every other
    /// thread is hijacked, round after round with growing pauses in between,
    /// until it reaches one. The threads stay stopped until the returned
    /// guard is dropped or [`ThreadStore::resume_all_threads`] is called.
    pub fn suspend_all_threads<'a>(
        &'a self,
        instance: &RuntimeInstance,
        pal: &dyn Pal,
        current: Option<&Thread>,
    ) -> SuspendGuard<'a> {
        let current_id = current.map_or(0, Thread::id);
        let previous = self.suspending_thread.swap(current_id, Ordering::SeqCst);
        debug_assert_eq!(previous, 0, "nested suspension");

        self.gc_complete.reset();
        self.trap_threads.store(true, Ordering::SeqCst);
        log::debug!("suspending all threads");

        let threads = self.threads();
        let mut backoff = self.backoff;
        let mut round = 0u32;
        loop {
            round += 1;
            let mut remaining = 0usize;
            for thread in threads.iter().filter(|t| t.id() != current_id) {
                if !thread.cache_transition_frame_for_suspend() {
                    remaining += 1;
                    thread.hijack(instance, pal);
                } else if WalkableThread::is_hijacked(&**thread) {
                    // Stopped, but a hijack from an earlier round is still on
                    // its stack and would trip the walk.
                    remaining += 1;
                    thread.hijack(instance, pal);
                }
            }
            if remaining == 0 {
                break;
            }
            log::trace!("suspension round {round}: {remaining} thread(s) still running");
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(self.max_backoff);
        }
        log::debug!("all threads suspended after {round} round(s)");
        SuspendGuard { store: self }
    }

    /// Let every thread go after a suspension.
    pub fn resume_all_threads(&self) {
        for thread in self.threads.lock().iter() {
            thread.reset_cached_transition_frame();
        }
        self.suspending_thread.store(0, Ordering::SeqCst);
        self.trap_threads.store(false, Ordering::SeqCst);
        self.gc_complete.set();
        log::debug!("resumed all threads");
    }

    /// Block until the suspension in progress, if any, is over.
    pub fn wait_for_gc_completion(&self) {
        self.gc_complete.wait();
    }

    /// The thread that started the suspension in progress.
    pub fn suspending_thread(&self) -> Option<u64> {
        match self.suspending_thread.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

impl core::fmt::Debug for ThreadStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadStore")
            .field("trap_threads", &self.is_trap_threads_requested())
            .finish_non_exhaustive()
    }
}

/// Resumes all threads when dropped.
#[must_use = "threads resume as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    store: &'a ThreadStore,
}

impl SuspendGuard<'_> {
    pub fn resume(self) {}
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.store.resume_all_threads();
    }
}
