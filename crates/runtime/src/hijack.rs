//! Return-address hijacking.
//!
//! A thread running managed code can't be walked, so the suspending thread
//! stops it briefly, finds the return address of the frame it is in and
//! overwrites it with a trampoline. When the frame returns the trampoline
//! builds a transition frame and parks the thread in
//! [`Thread::on_hijack_trip`], where it is walkable.

use crate::instance::{HijackTargets, RuntimeInstance};
use crate::pal::{Pal, PalError};
use crate::thread::{HijackState, Thread};
use crate::thread_store::ThreadStore;
use core::ptr::NonNull;
use mrt_unwinder::{
    CodeRegistry, PInvokeTransitionFrame, PalLimitedContext, StackFrameIterator,
    TransitionFrameFlags, WalkableThread, thunks,
};

/// A thread that is stopped by the platform layer. Only exists inside
/// [`Thread::with_suspended`].
pub struct SuspendedThread<'a> {
    thread: &'a Thread,
}

impl Thread {
    /// Stop the thread, run `f` on it and its register context, and let it
    /// go again.
    pub fn with_suspended<R>(
        &self,
        pal: &dyn Pal,
        f: impl FnOnce(&SuspendedThread<'_>, &mut PalLimitedContext) -> R,
    ) -> Result<R, PalError> {
        let handle = self.pal_handle().ok_or(PalError::InvalidHandle(0))?;
        let mut f = Some(f);
        let mut result = None;
        pal.hijack(handle, &mut |ctx| {
            if let Some(f) = f.take() {
                let suspended = SuspendedThread { thread: self };
                result = Some(f(&suspended, ctx));
            }
        })?;
        result.ok_or(PalError::ContextUnavailable)
    }

    /// Try to make the thread walkable from another thread.
    ///
    /// Returns true if the thread now has a hijack armed, or was found
    /// stopped at a transition frame and needs none. False means "try again
    /// later". Must be called from a thread other than the target.
    pub fn hijack(&self, instance: &RuntimeInstance, pal: &dyn Pal) -> bool {
        debug_assert!(!self.is_current(), "a thread cannot hijack itself");
        match self.with_suspended(pal, |suspended, ctx| suspended.hijack_callback(instance, ctx)) {
            Ok(done) => done,
            Err(err) => {
                log::debug!("thread {}: cannot hijack: {err}", self.id());
                false
            }
        }
    }

    /// Remove the thread's own hijack, if any.
    pub fn unhijack(&self) {
        debug_assert!(self.is_current(), "unhijack from a foreign thread");
        self.restore_hijacked_return_address();
    }

    /// Whether the thread's own stack carries a hijack.
    pub fn is_hijacked(&self) -> bool {
        debug_assert!(self.is_current(), "hijack state read from a foreign thread");
        WalkableThread::is_hijacked(self)
    }

    /// The hijack trampoline's landing routine.
    ///
    /// The hijacked frame has returned into the trampoline, which saved the
    /// return registers into `frame`. Records the original return address
    /// and the return value's kind in `frame`, waits out any suspension and
    /// returns the address to resume at.
    ///
    /// # Safety
    ///
    /// `frame` must be the trampoline's transition frame, with its return
    /// register saved.
    pub unsafe fn on_hijack_trip(
        &self,
        frame: NonNull<PInvokeTransitionFrame>,
        store: &ThreadStore,
    ) -> usize {
        debug_assert!(self.is_current());
        let Some(state) = self.take_hijack() else {
            mrt_unwinder::fail_fast(mrt_unwinder::UnwindError::UnexpectedThunk(
                "hijack trampoline reached without a hijack",
            ));
        };
        log::trace!(
            "thread {}: hijack tripped, resuming at {:#x}",
            self.id(),
            state.return_address
        );
        // SAFETY: upheld by the caller.
        unsafe {
            let f = frame.as_ptr();
            (*f).rip = state.return_address;
            (*f).flags |= TransitionFrameFlags::from_return_kind(state.kind).bits();
            (*f).thread = self as *const Thread as usize;
            self.gc_poll(frame, store);
        }
        state.return_address
    }
}

impl SuspendedThread<'_> {
    pub fn thread(&self) -> &Thread {
        self.thread
    }

    pub fn is_hijacked(&self) -> bool {
        WalkableThread::is_hijacked(self.thread)
    }

    /// Remove a hijack placed earlier, restoring the return address.
    pub fn cross_thread_unhijack(&self) {
        self.thread.restore_hijacked_return_address();
    }

    fn hijack_callback(&self, instance: &RuntimeInstance, ctx: &mut PalLimitedContext) -> bool {
        // The suspending thread may hold the module lock for writing while
        // this thread is stopped; never wait for it here.
        let Some(modules) = instance.try_read_modules() else {
            log::trace!("thread {}: module list busy", self.thread.id());
            return false;
        };
        if self.thread.transition_frame_raw() != 0 {
            // Parked or in native code. A stale hijack would trip the walk.
            self.cross_thread_unhijack();
            return true;
        }
        // Only meaningful while the thread is stopped; it may have entered
        // the region after the suspension was requested.
        if self.thread.is_do_not_trigger_gc_set() {
            log::trace!("thread {}: do-not-trigger-gc set, not hijacking", self.thread.id());
            return false;
        }
        if !modules.is_managed(ctx.ip()) {
            log::trace!(
                "thread {}: stopped outside managed code at {:#x}",
                self.thread.id(),
                ctx.ip()
            );
            return false;
        }
        self.internal_hijack(&*modules, ctx, instance.hijack_targets())
    }

    /// Overwrite the return address of the frame the thread is stopped in
    /// with the trampoline matching its return kind.
    pub fn internal_hijack(
        &self,
        registry: &dyn CodeRegistry,
        ctx: &mut PalLimitedContext,
        targets: &HijackTargets,
    ) -> bool {
        // SAFETY: the thread is stopped and `ctx` is its register state.
        let mut iter = unsafe {
            StackFrameIterator::from_limited_context(self.thread, registry, NonNull::from(&mut *ctx))
        };
        if !iter.is_valid() {
            return false;
        }
        let Some(code_manager) = iter.code_manager() else {
            return false;
        };
        let info = iter.method_info();
        // SAFETY: the register set describes the stopped frame.
        let Some((location, kind)) =
            (unsafe { code_manager.get_return_address_hijack_info(&info, iter.register_set()) })
        else {
            log::trace!(
                "thread {}: frame at {:#x} is not hijackable",
                self.thread.id(),
                iter.control_pc()
            );
            return false;
        };

        let target = targets.for_kind(kind);
        // SAFETY: the code manager returned a slot of the stopped frame.
        let current = unsafe { *location.as_ptr() };
        if current == target && self.thread.hijack_state().map(|s| s.location) == Some(location) {
            return true;
        }
        self.cross_thread_unhijack();
        // SAFETY: as above; the unhijack may have rewritten the slot.
        let return_address = unsafe { *location.as_ptr() };
        if !thunks::is_valid_return_address(return_address, registry) {
            log::debug!(
                "thread {}: refusing to hijack unexpected return address {return_address:#x}",
                self.thread.id()
            );
            return false;
        }

        self.thread.record_hijack(HijackState {
            location,
            return_address,
            kind,
        });
        // SAFETY: as above.
        unsafe { *location.as_ptr() = target };
        log::debug!(
            "thread {}: hijacked return address {return_address:#x} at {location:p} ({kind:?})",
            self.thread.id()
        );
        true
    }
}
