//! Per-thread runtime state.
//!
//! A [`Thread`] is shared between the OS thread it describes (its owner) and
//! whichever thread is suspending the world. Everything another thread may
//! look at lives in atomics; the hijack fields are only written by the owner
//! or by a thread that has the owner stopped.

use crate::pal::PalThreadHandle;
use crate::sync::current_thread_token;
use crate::thread_store::ThreadStore;
use core::ops::Range;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use mrt_unwinder::{
    ExInfo, ExInfoIter, GcRefKind, PInvokeTransitionFrame, PalLimitedContext, TransitionFrameRef,
    WalkSeed, WalkableThread,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadStateFlags: u32 {
        /// The thread is in a thread store.
        const ATTACHED = 0x1;
        /// The thread has left its thread store for good.
        const DETACHED = 0x2;
        /// The thread must not be stopped for a GC.
        const DO_NOT_TRIGGER_GC = 0x4;
    }
}

/// Recorded hijack: where the return address was overwritten, what it was,
/// and what kind of value the hijacked method returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HijackState {
    pub location: NonNull<usize>,
    pub return_address: usize,
    pub kind: GcRefKind,
}

pub struct Thread {
    id: u64,
    owner: u64,
    pal_handle: Option<PalThreadHandle>,
    stack: Range<usize>,
    state: AtomicU32,

    transition_frame: AtomicUsize,
    cached_transition_frame: AtomicUsize,
    transition_frame_for_stack_trace: AtomicUsize,
    interrupted_context: AtomicPtr<PalLimitedContext>,

    hijacked_location: AtomicPtr<usize>,
    hijacked_return_address: AtomicUsize,
    hijacked_kind: AtomicU8,

    ex_info_head: AtomicPtr<ExInfo>,
    thread_abort_exception: AtomicUsize,
}

impl Thread {
    /// Runtime state for the calling OS thread, whose stack occupies `stack`.
    ///
    /// The thread starts with no managed frames.
    pub fn new(stack: Range<usize>) -> Thread {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Thread {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            owner: current_thread_token(),
            pal_handle: None,
            stack,
            state: AtomicU32::new(0),
            transition_frame: AtomicUsize::new(TransitionFrameRef::TOP_OF_STACK),
            cached_transition_frame: AtomicUsize::new(0),
            transition_frame_for_stack_trace: AtomicUsize::new(TransitionFrameRef::TOP_OF_STACK),
            interrupted_context: AtomicPtr::new(ptr::null_mut()),
            hijacked_location: AtomicPtr::new(ptr::null_mut()),
            hijacked_return_address: AtomicUsize::new(0),
            hijacked_kind: AtomicU8::new(0),
            ex_info_head: AtomicPtr::new(ptr::null_mut()),
            thread_abort_exception: AtomicUsize::new(0),
        }
    }

    /// The OS handle used to stop the thread. Without one the thread can
    /// never be hijacked.
    pub fn with_pal_handle(mut self, handle: PalThreadHandle) -> Thread {
        self.pal_handle = Some(handle);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pal_handle(&self) -> Option<PalThreadHandle> {
        self.pal_handle
    }

    pub fn stack_range(&self) -> Range<usize> {
        self.stack.clone()
    }

    /// Whether the caller is the OS thread this state belongs to.
    pub fn is_current(&self) -> bool {
        self.owner == current_thread_token()
    }

    pub fn state(&self) -> ThreadStateFlags {
        ThreadStateFlags::from_bits_retain(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, flags: ThreadStateFlags) {
        self.state.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_state(&self, flags: ThreadStateFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn set_do_not_trigger_gc(&self) {
        self.set_state(ThreadStateFlags::DO_NOT_TRIGGER_GC);
    }

    pub fn clear_do_not_trigger_gc(&self) {
        self.clear_state(ThreadStateFlags::DO_NOT_TRIGGER_GC);
    }

    pub fn is_do_not_trigger_gc_set(&self) -> bool {
        self.state().contains(ThreadStateFlags::DO_NOT_TRIGGER_GC)
    }

    /// The transition frame the thread is currently stopped at, if any.
    pub fn transition_frame(&self) -> Option<TransitionFrameRef> {
        TransitionFrameRef::from_raw(self.transition_frame.load(Ordering::SeqCst))
    }

    pub(crate) fn transition_frame_raw(&self) -> usize {
        self.transition_frame.load(Ordering::SeqCst)
    }

    fn set_transition_frame_raw(&self, raw: usize) {
        self.transition_frame.store(raw, Ordering::SeqCst);
    }

    /// Snapshot the transition frame for a suspension in progress. Returns
    /// whether the thread is at a walkable point.
    pub(crate) fn cache_transition_frame_for_suspend(&self) -> bool {
        let raw = self.transition_frame_raw();
        self.cached_transition_frame.store(raw, Ordering::SeqCst);
        raw != 0
    }

    pub(crate) fn reset_cached_transition_frame(&self) {
        self.cached_transition_frame.store(0, Ordering::SeqCst);
    }

    /// Where a GC walk of this (suspended) thread starts.
    pub fn walk_seed(&self) -> Option<WalkSeed> {
        let cached = self.cached_transition_frame.load(Ordering::SeqCst);
        let raw = if cached != 0 {
            cached
        } else {
            self.transition_frame_raw()
        };
        WalkSeed::from_raw(raw)
    }

    /// Record that the thread was stopped mid-frame with register state
    /// `ctx`, or clear that record.
    ///
    /// # Safety
    ///
    /// `ctx` must stay valid until it is cleared again.
    pub unsafe fn set_interrupted_context(&self, ctx: Option<NonNull<PalLimitedContext>>) {
        match ctx {
            Some(ctx) => {
                self.interrupted_context.store(ctx.as_ptr(), Ordering::SeqCst);
                self.set_transition_frame_raw(TransitionFrameRef::INTERRUPTED);
            }
            None => {
                self.set_transition_frame_raw(0);
                self.interrupted_context.store(ptr::null_mut(), Ordering::SeqCst);
            }
        }
    }

    pub fn set_transition_frame_for_stack_trace(&self, frame: TransitionFrameRef) {
        self.transition_frame_for_stack_trace
            .store(frame.to_raw(), Ordering::SeqCst);
    }

    /// Link a new exception dispatch record into the thread's chain.
    ///
    /// # Safety
    ///
    /// `ex_info` must live on this thread's stack below every record already
    /// in the chain and stay live until popped.
    pub unsafe fn push_ex_info(&self, ex_info: NonNull<ExInfo>) {
        debug_assert!(self.is_current());
        let head = self.ex_info_head.load(Ordering::SeqCst);
        debug_assert!(
            head.is_null() || (ex_info.as_ptr() as usize) < head as usize,
            "exception records must be pushed in stack order"
        );
        // SAFETY: upheld by the caller.
        unsafe { (*ex_info.as_ptr()).prev = NonNull::new(head) };
        self.ex_info_head.store(ex_info.as_ptr(), Ordering::SeqCst);
    }

    /// Unlink every record below `sp`; their frames are gone.
    ///
    /// # Safety
    ///
    /// Every record in the chain must still be readable.
    pub unsafe fn pop_ex_infos_below(&self, sp: usize) {
        let mut head = self.ex_info_head.load(Ordering::SeqCst);
        while !head.is_null() && (head as usize) < sp {
            // SAFETY: upheld by the caller.
            head = unsafe { (*head).prev }.map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        self.ex_info_head.store(head, Ordering::SeqCst);
    }

    /// The thread's exception dispatch records, innermost first.
    ///
    /// # Safety
    ///
    /// The records must stay live while the iterator is used.
    pub unsafe fn ex_infos(&self) -> ExInfoIter<'_> {
        unsafe { ExInfoIter::new(self.ex_info_head()) }
    }

    pub fn set_thread_abort_exception(&self, exception: usize) {
        self.thread_abort_exception.store(exception, Ordering::SeqCst);
    }

    pub fn thread_abort_exception(&self) -> usize {
        self.thread_abort_exception.load(Ordering::SeqCst)
    }

    pub(crate) fn thread_abort_exception_location(&self) -> NonNull<usize> {
        // SAFETY: `AtomicUsize::as_ptr` never returns null.
        unsafe { NonNull::new_unchecked(self.thread_abort_exception.as_ptr()) }
    }

    pub(crate) fn hijack_state(&self) -> Option<HijackState> {
        let location = NonNull::new(self.hijacked_location.load(Ordering::SeqCst))?;
        Some(HijackState {
            location,
            return_address: self.hijacked_return_address.load(Ordering::SeqCst),
            kind: decode_kind(self.hijacked_kind.load(Ordering::SeqCst)),
        })
    }

    pub(crate) fn record_hijack(&self, state: HijackState) {
        debug_assert!(self.hijack_state().is_none());
        self.hijacked_return_address
            .store(state.return_address, Ordering::SeqCst);
        self.hijacked_kind.store(encode_kind(state.kind), Ordering::SeqCst);
        self.hijacked_location
            .store(state.location.as_ptr(), Ordering::SeqCst);
    }

    /// Forget the recorded hijack without touching the stack.
    pub(crate) fn take_hijack(&self) -> Option<HijackState> {
        let state = self.hijack_state()?;
        self.hijacked_location.store(ptr::null_mut(), Ordering::SeqCst);
        self.hijacked_return_address.store(0, Ordering::SeqCst);
        self.hijacked_kind.store(0, Ordering::SeqCst);
        Some(state)
    }

    /// Put the original return address back and forget the hijack.
    ///
    /// Callers are the owner or a thread holding the owner stopped.
    pub(crate) fn restore_hijacked_return_address(&self) {
        if let Some(state) = self.take_hijack() {
            log::trace!(
                "thread {}: restoring return address {:#x} at {:p}",
                self.id,
                state.return_address,
                state.location
            );
            // SAFETY: a recorded location stays inside a live frame of the
            // thread until the hijack trips or is removed.
            unsafe { *state.location.as_ptr() = state.return_address };
        }
    }

    /// The thread is about to call native code through the P/Invoke
    /// transition frame `frame`. From here on the thread counts as stopped.
    ///
    /// # Safety
    ///
    /// `frame` must describe the caller and stay live until
    /// [`Thread::pinvoke_return`].
    pub unsafe fn pinvoke_enter(&self, frame: NonNull<PInvokeTransitionFrame>) {
        debug_assert!(self.is_current());
        // SAFETY: upheld by the caller.
        unsafe { (*frame.as_ptr()).thread = self as *const Thread as usize };
        self.set_transition_frame_raw(frame.as_ptr() as usize);
    }

    /// Back from native code. Blocks while a suspension is in progress.
    ///
    /// # Safety
    ///
    /// `frame` must be the frame passed to [`Thread::pinvoke_enter`].
    pub unsafe fn pinvoke_return(&self, frame: NonNull<PInvokeTransitionFrame>, store: &ThreadStore) {
        debug_assert!(self.is_current());
        self.set_transition_frame_raw(0);
        if store.is_trap_threads_requested() {
            unsafe { self.wait_for_gc(frame, store) };
        }
    }

    /// Native code is calling into managed code. Waits out any suspension in
    /// progress and returns the transition frame to hand back to
    /// [`Thread::reverse_pinvoke_return`]; the entered method saves it in
    /// its frame.
    pub fn reverse_pinvoke_enter(&self, store: &ThreadStore) -> TransitionFrameRef {
        debug_assert!(self.is_current());
        let saved = self.transition_frame_raw();
        debug_assert_ne!(saved, 0, "reverse P/Invoke from a thread running managed code");
        loop {
            self.set_transition_frame_raw(0);
            if !store.is_trap_threads_requested() {
                break;
            }
            // A suspender may already have taken `saved` as this thread's
            // walk seed. Stay stopped until it is done.
            self.set_transition_frame_raw(saved);
            self.restore_hijacked_return_address();
            store.wait_for_gc_completion();
        }
        TransitionFrameRef::from_raw(saved).unwrap_or(TransitionFrameRef::TopOfStack)
    }

    /// Managed code is returning to native code.
    pub fn reverse_pinvoke_return(&self, saved: TransitionFrameRef) {
        debug_assert!(self.is_current());
        self.set_transition_frame_raw(saved.to_raw());
    }

    /// Poll point in managed code: stop at `frame` if a suspension is in
    /// progress.
    ///
    /// # Safety
    ///
    /// `frame` must describe the caller.
    pub unsafe fn gc_poll(&self, frame: NonNull<PInvokeTransitionFrame>, store: &ThreadStore) {
        if store.is_trap_threads_requested() {
            unsafe { self.wait_for_gc(frame, store) };
        }
    }

    /// Publish `frame`, drop any hijack and block until the suspension is
    /// over, for as long as suspensions keep coming.
    ///
    /// # Safety
    ///
    /// `frame` must describe the caller.
    pub unsafe fn wait_for_gc(&self, frame: NonNull<PInvokeTransitionFrame>, store: &ThreadStore) {
        debug_assert!(self.is_current());
        loop {
            self.set_transition_frame_raw(frame.as_ptr() as usize);
            self.restore_hijacked_return_address();
            store.wait_for_gc_completion();
            self.set_transition_frame_raw(0);
            if !store.is_trap_threads_requested() {
                break;
            }
        }
    }
}

impl WalkableThread for Thread {
    fn ex_info_head(&self) -> Option<NonNull<ExInfo>> {
        NonNull::new(self.ex_info_head.load(Ordering::SeqCst))
    }

    fn interrupted_context(&self) -> Option<NonNull<PalLimitedContext>> {
        NonNull::new(self.interrupted_context.load(Ordering::SeqCst))
    }

    fn transition_frame_for_stack_trace(&self) -> TransitionFrameRef {
        TransitionFrameRef::from_raw(self.transition_frame_for_stack_trace.load(Ordering::SeqCst))
            .unwrap_or(TransitionFrameRef::TopOfStack)
    }

    fn is_hijacked(&self) -> bool {
        self.hijack_state().is_some()
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field(
                "transition_frame",
                &format_args!("{:#x}", self.transition_frame_raw()),
            )
            .field("hijack", &self.hijack_state())
            .finish_non_exhaustive()
    }
}

fn encode_kind(kind: GcRefKind) -> u8 {
    match kind {
        GcRefKind::Scalar => 0,
        GcRefKind::Object => 1,
        GcRefKind::Byref => 2,
    }
}

fn decode_kind(raw: u8) -> GcRefKind {
    match raw {
        1 => GcRefKind::Object,
        2 => GcRefKind::Byref,
        _ => GcRefKind::Scalar,
    }
}
