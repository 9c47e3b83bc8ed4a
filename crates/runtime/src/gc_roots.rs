//! GC root enumeration for suspended threads.

use crate::config::RuntimeConfig;
use crate::instance::RuntimeInstance;
use crate::thread::Thread;
use core::ptr::NonNull;
use mrt_unwinder::{
    ExInfo, GcRefKind, GcRootSink, RootFlags, StackFrameIterator, UnwindError, WalkSeed, fail_fast,
};

/// Report every root held by `thread`'s stack and exception state.
///
/// The thread must be stopped at a walkable point, normally by
/// [`ThreadStore::suspend_all_threads`](crate::ThreadStore::suspend_all_threads).
pub fn gc_scan_roots(thread: &Thread, instance: &RuntimeInstance, sink: &mut dyn GcRootSink) {
    let Some(seed) = thread.walk_seed() else {
        fail_fast(UnwindError::ThreadNotSuspended);
    };
    let modules = instance.read_modules();
    log::debug!("scanning roots of thread {} from {seed:?}", thread.id());
    // SAFETY: the thread is stopped and the seed is the one it published.
    let mut iter = unsafe { StackFrameIterator::new(thread, &*modules, seed) };
    gc_scan_roots_worker(thread, &mut iter, instance.config(), sink);
}

/// Report the roots reachable from `iter`, followed by the exception
/// objects `thread` holds on to.
pub fn gc_scan_roots_worker(
    thread: &Thread,
    iter: &mut StackFrameIterator<'_>,
    config: &RuntimeConfig,
    sink: &mut dyn GcRootSink,
) {
    if let Some((location, kind)) = iter.hijacked_return_value_location() {
        let flags = match kind {
            GcRefKind::Byref => RootFlags::INTERIOR,
            _ => RootFlags::empty(),
        };
        sink.report(location, flags);
    }

    if iter.is_valid() {
        if config.is_conservative_stack_reporting() {
            report_whole_stack(thread, iter, sink);
        } else {
            report_frames(iter, sink);
        }
    }

    // SAFETY: the thread is stopped, so its records stay put.
    for ex_info in unsafe { thread.ex_infos() } {
        sink.report(exception_location(ex_info), RootFlags::empty());
    }

    if thread.thread_abort_exception() != 0 {
        sink.report(thread.thread_abort_exception_location(), RootFlags::empty());
    }
}

fn report_frames(iter: &mut StackFrameIterator<'_>, sink: &mut dyn GcRootSink) {
    while iter.is_valid() {
        iter.calculate_current_method_state();
        if !iter.should_skip_regular_gc_reporting()
            && let Some(code_manager) = iter.code_manager()
        {
            let info = iter.method_info();
            let safe_point = iter.effective_safe_point_address();
            let active = iter.is_active_stack_frame();
            // SAFETY: the iterator's register set describes a live frame.
            unsafe {
                code_manager.enum_gc_refs(&info, safe_point, iter.register_set(), sink, active);
            }
        }
        if let Some((lower, upper)) = iter.stack_range_to_report_conservatively() {
            sink.report_conservative_range(lower, upper);
        }
        iter.next();
    }
}

/// One range covering everything from the innermost managed frame (or the
/// transition frame, whichever is lower) to the top of the stack.
fn report_whole_stack(thread: &Thread, iter: &StackFrameIterator<'_>, sink: &mut dyn GcRootSink) {
    let mut lower = iter.register_set().sp();
    if let Some(WalkSeed::Frame(frame)) = thread.walk_seed() {
        lower = lower.min(frame.as_ptr() as usize);
    }
    let upper = thread.stack_range().end;
    let (Some(lower), Some(upper)) = (
        NonNull::new(lower as *mut usize),
        NonNull::new(upper as *mut usize),
    ) else {
        return;
    };
    if lower < upper {
        sink.report_conservative_range(lower, upper);
    }
}

fn exception_location(ex_info: NonNull<ExInfo>) -> NonNull<usize> {
    // SAFETY: projecting to a field of a live record.
    unsafe { NonNull::new_unchecked(&raw mut (*ex_info.as_ptr()).exception) }
}
