mod common;

use common::*;
use mrt_runtime::{PalThreadHandle, Thread};
use mrt_unwinder::arch::PInvokeTransitionFrame;
use mrt_unwinder::{TransitionFrameRef, WalkSeed, WalkableThread};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

fn empty_frame() -> PInvokeTransitionFrame {
    PInvokeTransitionFrame {
        rip: 0x2020,
        frame_pointer: 0,
        thread: 0,
        flags: 0,
        preserved_regs: [],
    }
}

/// Suspend every thread from a helper OS thread, run `inspect` while they
/// are stopped, then resume them.
fn while_suspended<R: Send>(fx: &Fixture, inspect: impl FnOnce() -> R + Send) -> R {
    std::thread::scope(|s| {
        s.spawn(|| {
            let store = fx.instance.thread_store();
            let _guard = store.suspend_all_threads(&fx.instance, &fx.pal, None);
            inspect()
        })
        .join()
        .unwrap()
    })
}

fn is_seeded_at(thread: &Thread, frame: usize) -> bool {
    matches!(thread.walk_seed(), Some(WalkSeed::Frame(f)) if f.as_ptr() as usize == frame)
}

#[test]
fn parked_threads_need_no_hijack() {
    let fx = Fixture::new();
    let store = fx.instance.thread_store();
    let idle = Arc::new(Thread::new(0..usize::MAX).with_pal_handle(HANDLE));
    store.attach(idle.clone());

    let guard = store.suspend_all_threads(&fx.instance, &fx.pal, None);
    assert!(store.is_trap_threads_requested());
    assert_eq!(fx.pal.calls(), 0);
    assert_eq!(idle.walk_seed(), Some(WalkSeed::TopOfStack));
    drop(guard);

    assert!(!store.is_trap_threads_requested());
    assert!(store.detach(&idle));
    assert!(store.threads().is_empty());
}

#[test]
fn the_suspending_thread_is_skipped() {
    let fx = Fixture::new();
    let store = fx.instance.thread_store();
    let b = fx.builder();
    let me = Arc::new(fx.running_thread(&b));
    store.attach(me.clone());

    let guard = store.suspend_all_threads(&fx.instance, &fx.pal, Some(&me));
    assert_eq!(store.suspending_thread(), Some(me.id()));
    assert_eq!(fx.pal.calls(), 0);
    guard.resume();
    assert_eq!(store.suspending_thread(), None);
}

#[test]
fn stale_hijacks_are_removed_before_the_walk() {
    let fx = Fixture::new();
    let store = fx.instance.thread_store();
    let mut b = fx.builder();
    b.call("main", 0x10).unwrap();
    let work = b.call("work", 0x20).unwrap();
    let leaf = b.call("leaf", 0x30).unwrap();
    let thread = Arc::new(fx.running_thread(&b));
    store.attach(thread.clone());
    fx.pal.set_context(HANDLE, b.context());
    assert!(fx.hijack(&thread));

    // The thread went on into native code without returning through the
    // hijacked frame.
    let mut frame = empty_frame();
    let frame = NonNull::from(&mut frame);
    unsafe { thread.pinvoke_enter(frame) };
    let frame_addr = frame.as_ptr() as usize;

    let (hijacked, seeded) = while_suspended(&fx, || {
        (
            WalkableThread::is_hijacked(&*thread),
            is_seeded_at(&thread, frame_addr),
        )
    });
    assert!(!hijacked);
    assert!(seeded);
    assert_eq!(b.stack().read(leaf.fp + W), work.pc);
    assert_eq!(fx.pal.calls(), 2);
    assert_eq!(thread.transition_frame(), Some(TransitionFrameRef::Frame(frame)));
}

#[test]
fn stale_hijacks_are_removed_inside_no_gc_regions() {
    let fx = Fixture::new();
    let store = fx.instance.thread_store();
    let mut b = fx.builder();
    b.call("main", 0x10).unwrap();
    let work = b.call("work", 0x20).unwrap();
    let leaf = b.call("leaf", 0x30).unwrap();
    let thread = Arc::new(fx.running_thread(&b));
    store.attach(thread.clone());
    fx.pal.set_context(HANDLE, b.context());
    assert!(fx.hijack(&thread));

    // Parked in native code inside a no-GC region, hijack still armed.
    thread.set_do_not_trigger_gc();
    let mut frame = empty_frame();
    let frame = NonNull::from(&mut frame);
    unsafe { thread.pinvoke_enter(frame) };
    let frame_addr = frame.as_ptr() as usize;

    let (hijacked, seeded) = while_suspended(&fx, || {
        (
            WalkableThread::is_hijacked(&*thread),
            is_seeded_at(&thread, frame_addr),
        )
    });
    assert!(!hijacked);
    assert!(seeded);
    assert!(thread.is_do_not_trigger_gc_set());
    assert_eq!(b.stack().read(leaf.fp + W), work.pc);
    assert_eq!(fx.pal.calls(), 2);
}

#[test]
fn running_thread_stops_at_its_next_poll() {
    let fx = Arc::new(Fixture::new());
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let mutator = {
        let fx = fx.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let store = fx.instance.thread_store();
            // No context is known for this handle, so it is never hijacked.
            let thread = Arc::new(Thread::new(0..usize::MAX).with_pal_handle(PalThreadHandle(99)));
            store.attach(thread.clone());
            let saved = thread.reverse_pinvoke_enter(store);
            tx.send(thread.clone()).unwrap();

            let mut frame = empty_frame();
            let mut polls = 0usize;
            while !stop.load(Ordering::SeqCst) {
                unsafe { thread.gc_poll(NonNull::from(&mut frame), store) };
                polls += 1;
                std::thread::yield_now();
            }
            thread.reverse_pinvoke_return(saved);
            store.detach(&thread);
            polls
        })
    };

    let thread = rx.recv().unwrap();
    let store = fx.instance.thread_store();
    let guard = store.suspend_all_threads(&fx.instance, &fx.pal, None);
    assert!(matches!(thread.walk_seed(), Some(WalkSeed::Frame(_))));
    drop(guard);

    stop.store(true, Ordering::SeqCst);
    assert!(mutator.join().unwrap() > 0);
    assert!(store.threads().is_empty());
}
