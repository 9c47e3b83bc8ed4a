//! Stack-walk entry points for the exception dispatcher.
//!
//! The dispatcher drives a [`StackFrameIterator`] one frame at a time from
//! managed code. It may be hijacked while it runs, so every entry point
//! removes the calling thread's hijack before touching the iterator.

use crate::thread::Thread;
use core::ptr::NonNull;
use mrt_unwinder::{CodeRegistry, ExKind, NO_CLAUSE, PalLimitedContext, StackFrameIterator};

/// Outcome of one [`sfi_next`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStep {
    /// Whether the iterator is on a frame.
    pub valid: bool,
    /// Clause of the collided dispatch that was running, or [`NO_CLAUSE`].
    pub ex_collide_clause: u32,
    /// Whether the step crossed a reverse P/Invoke boundary.
    pub unwound_reverse_pinvoke: bool,
}

/// Start a dispatch walk of the current thread.
///
/// With a context the walk starts at the throw site it describes; without
/// one it is a stack trace of the current thread.
///
/// # Safety
///
/// `thread` must be the current thread and `ctx` must describe a frame of
/// its stack.
pub unsafe fn sfi_init<'a>(
    thread: &'a Thread,
    registry: &'a dyn CodeRegistry,
    ctx: Option<NonNull<PalLimitedContext>>,
    instruction_fault: bool,
) -> StackFrameIterator<'a> {
    thread.unhijack();
    let mut iter = unsafe {
        match ctx {
            Some(ctx) => StackFrameIterator::for_eh(thread, registry, ctx, instruction_fault),
            None => StackFrameIterator::for_stack_trace(thread, registry),
        }
    };
    if iter.is_valid() {
        iter.calculate_current_method_state();
    }
    iter
}

/// Advance a dispatch walk by one frame.
///
/// When the step collides with an older dispatch that was running a
/// handler, that dispatch is marked superseded and its clause is returned.
pub fn sfi_next(thread: &Thread, iter: &mut StackFrameIterator<'_>) -> DispatchStep {
    thread.unhijack();
    let collided_with = iter.next_ex_info();
    iter.next();
    let valid = iter.is_valid();
    if valid {
        iter.calculate_current_method_state();
    }

    let mut ex_collide_clause = NO_CLAUSE;
    if iter.ex_collided() {
        let Some(ex_info) = collided_with else {
            mrt_unwinder::fail_fast(mrt_unwinder::UnwindError::MissingExInfo);
        };
        // SAFETY: records on the current thread's stack outlive the walk.
        let ex_info = unsafe { &mut *ex_info.as_ptr() };
        debug_assert_ne!(ex_info.idx_cur_clause, NO_CLAUSE);
        ex_collide_clause = ex_info.idx_cur_clause;
        ex_info.kind |= ExKind::SUPERSEDED;
        log::debug!("dispatch superseded exception {:#x}", ex_info.exception);
    }

    DispatchStep {
        valid,
        ex_collide_clause,
        unwound_reverse_pinvoke: iter.unwound_reverse_pinvoke(),
    }
}
