//! The stack frame iterator.
//!
//! A [`StackFrameIterator`] yields the logical frames of one thread, callee
//! first. What counts as a logical frame depends on the kind of walk:
//!
//! * GC walks skip native frames, collapse funclets into the frame that owns
//!   them and thread through exception dispatch by colliding with the
//!   thread's [`ExInfo`] records at throw sites.
//! * EH walks stop at native frames, keep funclets separate and collide at
//!   funclet invoke thunks instead.
//!
//! Thunks are never yielded. Unwinding through them may publish a
//! conservative range that must be reported together with the next frame.
//!
//! All fallible steps return [`UnwindError`]; the public surface turns every
//! such error into [`fail_fast`].

use crate::arch::{
    self, FUNCLET_PRESERVED_REGS, NativeContext, PalLimitedContext, seed_from_limited_context,
    seed_from_native_context, seed_preserved_from_limited_context,
};
use crate::thunks::{self, ReturnAddressCategory};
use crate::transition::seed_from_transition_frame;
use crate::{
    CodeManager, CodeRegistry, ExInfo, ExKind, GcRefKind, MethodInfo, NO_CLAUSE, Reg,
    RegisterSet, TransitionFrameRef, UnwindError, UnwindFlags, WalkSeed, WalkableThread,
    fail_fast,
};
use core::fmt;
use core::ptr::NonNull;

bitflags::bitflags! {
    /// Kind of walk and per-frame walk state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WalkFlags: u32 {
        /// The code manager, method info and frame pointer of the current
        /// frame are known.
        const METHOD_STATE_CALCULATED = 0x1;
        /// The last unwind crossed a reverse P/Invoke boundary.
        const UNWOUND_REVERSE_PINVOKE = 0x2;
        /// The current frame was reached through an exception-info
        /// collision.
        const EX_COLLIDE = 0x4;
        /// Step return addresses back into the call instruction.
        const APPLY_RETURN_ADDRESS_ADJUSTMENT = 0x8;
        /// Skip funclet owners whose roots the funclet already reported.
        const COLLAPSE_FUNCLETS = 0x10;
        /// Report hardware faults at their nearest safe point.
        const REMAP_HARDWARE_FAULTS_TO_SAFE_POINT = 0x20;
        /// Continue at the managed caller of a reverse P/Invoke instead of
        /// yielding the native frame.
        const SKIP_NATIVE_FRAMES = 0x40;
        /// The current frame is the one the thread was interrupted in.
        const ACTIVE_STACK_FRAME = 0x80;

        const GC_STACK_WALK = Self::COLLAPSE_FUNCLETS.bits()
            | Self::REMAP_HARDWARE_FAULTS_TO_SAFE_POINT.bits()
            | Self::SKIP_NATIVE_FRAMES.bits();
        const EH_STACK_WALK = Self::APPLY_RETURN_ADDRESS_ADJUSTMENT.bits();
        const STACK_TRACE_STACK_WALK = Self::GC_STACK_WALK.bits();
    }
}

/// The copyable state of a walk.
///
/// It is saved inside each [`ExInfo`] by the exception dispatcher so that a
/// later walk can resume in the frame that owns a running funclet.
#[derive(Clone, Copy)]
pub struct FrameIterState {
    control_pc: usize,
    original_control_pc: usize,
    regs: RegisterSet,
    frame_pointer: usize,
    code_manager: Option<&'static dyn CodeManager>,
    method_info: MethodInfo,
    effective_safe_point: usize,
    flags: WalkFlags,
    hijacked_return_value: Option<(NonNull<usize>, GcRefKind)>,
    conservative_lower: Option<NonNull<usize>>,
    conservative_upper: Option<NonNull<usize>>,
    should_skip_regular_gc_reporting: bool,
    pending_funclet_frame_pointer: usize,
    next_ex_info: Option<NonNull<ExInfo>>,
    previous_transition_frame: Option<TransitionFrameRef>,
    funclet_regs: [Option<NonNull<usize>>; Reg::COUNT],
}

impl Default for FrameIterState {
    fn default() -> Self {
        FrameIterState {
            control_pc: 0,
            original_control_pc: 0,
            regs: RegisterSet::default(),
            frame_pointer: 0,
            code_manager: None,
            method_info: MethodInfo::default(),
            effective_safe_point: 0,
            flags: WalkFlags::empty(),
            hijacked_return_value: None,
            conservative_lower: None,
            conservative_upper: None,
            should_skip_regular_gc_reporting: false,
            pending_funclet_frame_pointer: 0,
            next_ex_info: None,
            previous_transition_frame: None,
            funclet_regs: [None; Reg::COUNT],
        }
    }
}

impl fmt::Debug for FrameIterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameIterState")
            .field("control_pc", &format_args!("{:#x}", self.control_pc))
            .field("frame_pointer", &format_args!("{:#x}", self.frame_pointer))
            .field("flags", &self.flags)
            .field("regs", &self.regs)
            .field("next_ex_info", &self.next_ex_info)
            .finish_non_exhaustive()
    }
}

impl FrameIterState {
    /// Whether the state describes a frame.
    pub fn is_valid(&self) -> bool {
        self.control_pc != 0
    }

    /// Control PC of the frame, possibly adjusted back into the call.
    pub fn control_pc(&self) -> usize {
        self.control_pc
    }

    /// Frame pointer of the logical frame.
    pub fn frame_pointer(&self) -> usize {
        self.frame_pointer
    }

    /// Register state of the frame.
    pub fn register_set(&self) -> &RegisterSet {
        &self.regs
    }

    /// Walk flags.
    pub fn flags(&self) -> WalkFlags {
        self.flags
    }

    fn is_native_frame(&self) -> bool {
        self.flags
            .intersection(WalkFlags::SKIP_NATIVE_FRAMES | WalkFlags::UNWOUND_REVERSE_PINVOKE)
            == WalkFlags::UNWOUND_REVERSE_PINVOKE
    }

    fn set_control_pc(&mut self, pc: usize) {
        self.control_pc = pc;
        self.original_control_pc = pc;
    }
}

/// Walks the frames of one thread.
pub struct StackFrameIterator<'a> {
    thread: &'a dyn WalkableThread,
    registry: &'a dyn CodeRegistry,
    state: FrameIterState,
}

impl<'a> StackFrameIterator<'a> {
    /// Start a GC walk of a suspended thread.
    ///
    /// # Safety
    ///
    /// `thread` must not run while the iterator is alive, and `seed` must
    /// describe its current stack.
    pub unsafe fn new(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
        seed: WalkSeed,
    ) -> StackFrameIterator<'a> {
        unsafe { Self::try_new(thread, registry, seed) }.unwrap_or_else(|e| fail_fast(e))
    }

    pub(crate) unsafe fn try_new(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
        seed: WalkSeed,
    ) -> Result<StackFrameIterator<'a>, UnwindError> {
        log::trace!("----Init---- [ GC ]");
        debug_assert!(!thread.is_hijacked());
        let mut iter = Self::empty(thread, registry);
        unsafe {
            match seed {
                WalkSeed::InterruptedThread => {
                    let ctx = thread
                        .interrupted_context()
                        .ok_or(UnwindError::ThreadNotSuspended)?;
                    iter.init_from_limited_context(
                        ctx,
                        WalkFlags::GC_STACK_WALK | WalkFlags::ACTIVE_STACK_FRAME,
                    );
                }
                WalkSeed::TopOfStack => {
                    iter.init_from_transition_frame(
                        TransitionFrameRef::TopOfStack,
                        WalkFlags::GC_STACK_WALK,
                    )?;
                }
                WalkSeed::Frame(frame) => {
                    iter.init_from_transition_frame(
                        TransitionFrameRef::Frame(frame),
                        WalkFlags::GC_STACK_WALK,
                    )?;
                }
            }
            iter.prepare_to_yield_frame()?;
        }
        Ok(iter)
    }

    /// Start a walk from a saved register context, as done when hijacking.
    ///
    /// If the context's IP is not in managed code the iterator starts out
    /// invalid.
    ///
    /// # Safety
    ///
    /// `ctx` must describe the current state of `thread`, which must not run
    /// while the iterator is alive.
    pub unsafe fn from_limited_context(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
        ctx: NonNull<PalLimitedContext>,
    ) -> StackFrameIterator<'a> {
        log::trace!("----Init with limited ctx---- [ hijack ]");
        let mut iter = Self::empty(thread, registry);
        unsafe {
            iter.init_from_limited_context(ctx, WalkFlags::empty());
            iter.prepare_to_yield_frame().unwrap_or_else(|e| fail_fast(e));
        }
        iter
    }

    /// Start a walk from an OS thread context.
    ///
    /// # Safety
    ///
    /// Same as [`StackFrameIterator::from_limited_context`].
    pub unsafe fn from_native_context(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
        ctx: NonNull<NativeContext>,
    ) -> StackFrameIterator<'a> {
        log::trace!("----Init with native ctx---- [ hijack ]");
        let mut iter = Self::empty(thread, registry);
        unsafe {
            iter.init_from_native_context(ctx, WalkFlags::empty());
            iter.prepare_to_yield_frame().unwrap_or_else(|e| fail_fast(e));
        }
        iter
    }

    /// Start an exception dispatch walk from the throw-site context.
    ///
    /// With `instruction_fault` the context's IP is the faulting instruction
    /// itself, so the first frame is not adjusted back.
    ///
    /// # Safety
    ///
    /// `ctx` must describe a frame of the current stack of `thread`.
    pub unsafe fn for_eh(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
        ctx: NonNull<PalLimitedContext>,
        instruction_fault: bool,
    ) -> StackFrameIterator<'a> {
        log::trace!("----Init---- [ EH ]");
        let mut iter = Self::empty(thread, registry);
        unsafe {
            iter.init_from_limited_context(ctx, WalkFlags::EH_STACK_WALK);
            let result = if instruction_fault {
                iter.state.flags.remove(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT);
                let result = iter.prepare_to_yield_frame();
                iter.state.flags.insert(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT);
                result
            } else {
                iter.prepare_to_yield_frame()
            };
            result.unwrap_or_else(|e| fail_fast(e));
        }
        log::trace!("   {:#x}", iter.state.control_pc);
        iter
    }

    /// Start a stack trace walk of the current thread.
    ///
    /// # Safety
    ///
    /// `thread` must be the current thread and its stack-trace transition
    /// frame must describe its stack.
    pub unsafe fn for_stack_trace(
        thread: &'a dyn WalkableThread,
        registry: &'a dyn CodeRegistry,
    ) -> StackFrameIterator<'a> {
        log::trace!("----Init---- [ StackTrace ]");
        let mut iter = Self::empty(thread, registry);
        let frame = thread.transition_frame_for_stack_trace();
        unsafe {
            iter.init_from_transition_frame(frame, WalkFlags::STACK_TRACE_STACK_WALK)
                .and_then(|()| iter.prepare_to_yield_frame())
                .unwrap_or_else(|e| fail_fast(e));
        }
        iter
    }

    fn empty(thread: &'a dyn WalkableThread, registry: &'a dyn CodeRegistry) -> Self {
        StackFrameIterator {
            thread,
            registry,
            state: FrameIterState::default(),
        }
    }

    /// Whether the iterator is positioned on a frame.
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// Advance to the next logical frame.
    pub fn next(&mut self) {
        // SAFETY: the constructor's contract keeps the walked stack live.
        unsafe { self.try_next() }.unwrap_or_else(|e| fail_fast(e))
    }

    pub(crate) unsafe fn try_next(&mut self) -> Result<(), UnwindError> {
        unsafe {
            self.try_calculate_current_method_state()?;
            self.next_internal()?;
        }
        log::trace!("   {:#x}", self.state.control_pc);
        Ok(())
    }

    /// Resolve the code manager, method info and frame pointer of the
    /// current frame. Native frames have none.
    pub fn calculate_current_method_state(&mut self) {
        // SAFETY: the constructor's contract keeps the walked stack live.
        unsafe { self.try_calculate_current_method_state() }.unwrap_or_else(|e| fail_fast(e))
    }

    /// Register state of the current frame.
    pub fn register_set(&self) -> &RegisterSet {
        debug_assert!(self.is_valid());
        &self.state.regs
    }

    /// Mutable register state of the current frame.
    pub fn register_set_mut(&mut self) -> &mut RegisterSet {
        debug_assert!(self.is_valid());
        &mut self.state.regs
    }

    /// Control PC of the current frame.
    pub fn control_pc(&self) -> usize {
        self.state.control_pc
    }

    /// Control PC before any return-address adjustment.
    pub fn original_control_pc(&self) -> usize {
        self.state.original_control_pc
    }

    /// Frame pointer of the current logical frame.
    pub fn frame_pointer(&mut self) -> usize {
        self.calculate_current_method_state();
        self.state.frame_pointer
    }

    /// Address at which to look up the GC information of the current frame.
    pub fn effective_safe_point_address(&mut self) -> usize {
        self.calculate_current_method_state();
        debug_assert!(self.state.effective_safe_point != 0);
        self.state.effective_safe_point
    }

    /// Code manager of the current frame; `None` for native frames.
    pub fn code_manager(&mut self) -> Option<&'static dyn CodeManager> {
        self.calculate_current_method_state();
        self.state.code_manager
    }

    /// Method info of the current frame.
    pub fn method_info(&mut self) -> MethodInfo {
        self.calculate_current_method_state();
        self.state.method_info
    }

    /// Whether the current frame is the one the thread was interrupted in.
    pub fn is_active_stack_frame(&self) -> bool {
        debug_assert!(self.is_valid());
        self.state.flags.contains(WalkFlags::ACTIVE_STACK_FRAME)
    }

    /// Location and kind of a return value captured by a hijack trampoline.
    pub fn hijacked_return_value_location(&self) -> Option<(NonNull<usize>, GcRefKind)> {
        self.state.hijacked_return_value
    }

    /// Whether the current frame carries a conservative range.
    pub fn has_stack_range_to_report_conservatively(&self) -> bool {
        self.is_valid() && self.state.conservative_upper.is_some()
    }

    /// The `[lower, upper)` conservative range of the current frame.
    pub fn stack_range_to_report_conservatively(
        &self,
    ) -> Option<(NonNull<usize>, NonNull<usize>)> {
        if !self.is_valid() {
            return None;
        }
        Some((self.state.conservative_lower?, self.state.conservative_upper?))
    }

    /// Whether precise reporting must be skipped for the current frame.
    pub fn should_skip_regular_gc_reporting(&self) -> bool {
        self.state.should_skip_regular_gc_reporting
    }

    /// The exception record the walk will collide with next.
    pub fn next_ex_info(&self) -> Option<NonNull<ExInfo>> {
        self.state.next_ex_info
    }

    /// Whether the current frame was reached through a collision.
    pub fn ex_collided(&self) -> bool {
        self.state.flags.contains(WalkFlags::EX_COLLIDE)
    }

    /// Whether the last step crossed a reverse P/Invoke boundary.
    pub fn unwound_reverse_pinvoke(&self) -> bool {
        self.state.flags.contains(WalkFlags::UNWOUND_REVERSE_PINVOKE)
    }

    /// The transition frame reported by the last unwind, or the seed frame.
    pub fn previous_transition_frame(&self) -> Option<TransitionFrameRef> {
        self.state.previous_transition_frame
    }

    /// The copyable walk state.
    pub fn state(&self) -> &FrameIterState {
        &self.state
    }

    fn enter_initial_invalid_state(&mut self) {
        let s = &mut self.state;
        s.code_manager = None;
        s.hijacked_return_value = None;
        s.conservative_lower = None;
        s.conservative_upper = None;
        s.should_skip_regular_gc_reporting = false;
        s.pending_funclet_frame_pointer = 0;
        s.next_ex_info = self.thread.ex_info_head();
        s.previous_transition_frame = None;
        s.set_control_pc(0);
    }

    fn reset_next_ex_info_for_sp(&mut self, sp: usize) {
        while let Some(ex) = self.state.next_ex_info {
            if sp <= ExInfo::addr(ex) {
                break;
            }
            // SAFETY: records on the chain are live while the thread is
            // stopped.
            self.state.next_ex_info = unsafe { (*ex.as_ptr()).prev };
        }
    }

    /// Seed from a transition frame. A PC inside a non-EH thunk is unwound
    /// to the nearest managed frame.
    unsafe fn init_from_transition_frame(
        &mut self,
        frame: TransitionFrameRef,
        flags: WalkFlags,
    ) -> Result<(), UnwindError> {
        debug_assert!(
            !flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT),
            "transition frames cannot seed an EH walk"
        );
        self.enter_initial_invalid_state();

        let frame_ptr = match frame {
            TransitionFrameRef::TopOfStack => return Ok(()),
            TransitionFrameRef::Frame(f) => f,
        };

        self.state.flags = flags;
        self.state.previous_transition_frame = Some(frame);
        self.reset_next_ex_info_for_sp(frame_ptr.as_ptr() as usize);

        // SAFETY: upheld by the constructor's caller.
        let kind = unsafe { seed_from_transition_frame(&mut self.state.regs, frame_ptr) };
        self.state.set_control_pc(self.state.regs.ip());
        if kind != GcRefKind::Scalar {
            self.state.hijacked_return_value = self
                .state
                .regs
                .location(Reg::RETURN_VALUE)
                .map(|loc| (loc, kind));
        }

        let category = thunks::classify(self.state.control_pc);
        if category == ReturnAddressCategory::InManagedCode {
            debug_assert!(self.registry.is_managed(self.state.control_pc));
        } else if thunks::is_non_eh_thunk(category) {
            unsafe { self.unwind_non_eh_thunk_sequence()? };
        } else {
            return Err(UnwindError::UnexpectedThunk(
                "transition frame PC points to an exception handling thunk",
            ));
        }
        log::trace!("   {:#x}", self.state.control_pc);
        Ok(())
    }

    /// Seed from a saved register context. A context outside managed code
    /// leaves the iterator invalid.
    unsafe fn init_from_limited_context(
        &mut self,
        ctx: NonNull<PalLimitedContext>,
        flags: WalkFlags,
    ) {
        debug_assert!(!flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
        self.enter_initial_invalid_state();
        self.state.flags = flags;

        // SAFETY: upheld by the constructor's caller.
        let (ip, sp) = unsafe {
            let c = ctx.as_ref();
            (c.ip(), c.sp())
        };
        self.reset_next_ex_info_for_sp(sp);
        if !self.registry.is_managed(ip) {
            return;
        }

        self.state.regs.set_sp(sp);
        self.state.regs.set_ip(ip);
        self.state.set_control_pc(ip);
        unsafe { seed_from_limited_context(&mut self.state.regs, ctx) };
    }

    unsafe fn init_from_native_context(&mut self, ctx: NonNull<NativeContext>, flags: WalkFlags) {
        debug_assert!(!flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
        self.enter_initial_invalid_state();
        self.state.flags = flags;

        // SAFETY: upheld by the constructor's caller.
        let (ip, sp) = unsafe {
            let c = ctx.as_ref();
            (c.ip(), c.sp())
        };
        self.reset_next_ex_info_for_sp(sp);
        debug_assert!(self.registry.is_managed(ip));

        self.state.regs.set_sp(sp);
        self.state.regs.set_ip(ip);
        self.state.set_control_pc(ip);
        unsafe { seed_from_native_context(&mut self.state.regs, ctx) };
    }

    unsafe fn try_calculate_current_method_state(&mut self) -> Result<(), UnwindError> {
        let s = &mut self.state;
        if s.flags.contains(WalkFlags::METHOD_STATE_CALCULATED) {
            return Ok(());
        }

        if s.is_native_frame() {
            s.code_manager = None;
            s.effective_safe_point = 0;
            s.frame_pointer = 0;
            s.flags.insert(WalkFlags::METHOD_STATE_CALCULATED);
            return Ok(());
        }

        let pc = s.control_pc;
        // The caller is most likely in the same module.
        let cached = s
            .code_manager
            .and_then(|cm| cm.find_method_info(pc).map(|info| (cm, info)));
        let (code_manager, info) = match cached {
            Some(found) => found,
            None => {
                let cm = self
                    .registry
                    .code_manager_for_address(pc)
                    .ok_or(UnwindError::NoCodeManager { pc })?;
                let info = cm
                    .find_method_info(pc)
                    .ok_or(UnwindError::NoCodeManager { pc })?;
                (cm, info)
            }
        };

        s.code_manager = Some(code_manager);
        s.method_info = info;
        s.effective_safe_point = pc;
        // SAFETY: the register set describes a live frame of `info`.
        s.frame_pointer = unsafe { code_manager.get_frame_pointer(&s.method_info, &s.regs) };
        s.flags.insert(WalkFlags::METHOD_STATE_CALCULATED);
        Ok(())
    }

    unsafe fn next_internal(&mut self) -> Result<(), UnwindError> {
        loop {
            debug_assert!(self.state.flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
            if self.state.is_native_frame() {
                return Err(UnwindError::NativeFrame);
            }
            debug_assert!(self.is_valid());

            let s = &mut self.state;
            s.flags.remove(
                WalkFlags::EX_COLLIDE
                    | WalkFlags::METHOD_STATE_CALCULATED
                    | WalkFlags::UNWOUND_REVERSE_PINVOKE
                    | WalkFlags::ACTIVE_STACK_FRAME,
            );
            s.hijacked_return_value = None;
            s.conservative_lower = None;
            s.conservative_upper = None;
            let pre_unwind_sp = s.regs.sp();

            let mut unwind_flags = UnwindFlags::empty();
            if s.flags.contains(WalkFlags::SKIP_NATIVE_FRAMES) {
                unwind_flags |= UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME;
            }
            if s.flags.contains(WalkFlags::GC_STACK_WALK) {
                unwind_flags |= UnwindFlags::GC_UNWIND;
            }

            let pc = s.control_pc;
            let code_manager = s.code_manager.ok_or(UnwindError::NoCodeManager { pc })?;
            let info = s.method_info;
            // SAFETY: the register set describes a live frame of `info`.
            s.previous_transition_frame =
                unsafe { code_manager.unwind_stack_frame(&info, unwind_flags, &mut s.regs)? };
            if s.previous_transition_frame.is_some() {
                s.flags.insert(WalkFlags::UNWOUND_REVERSE_PINVOKE);
            }
            let doing_funclet_unwind = code_manager.is_funclet(&info);

            if let Some(prev) = s.previous_transition_frame
                && s.flags.contains(WalkFlags::SKIP_NATIVE_FRAMES)
            {
                debug_assert!(!doing_funclet_unwind);
                match prev {
                    TransitionFrameRef::TopOfStack => s.set_control_pc(0),
                    TransitionFrameRef::Frame(_) => {
                        // May publish a conservative range if the P/Invoke
                        // call site is inside a thunk.
                        unsafe {
                            self.init_from_transition_frame(prev, WalkFlags::GC_STACK_WALK)?
                        };
                        self.state.flags.insert(WalkFlags::UNWOUND_REVERSE_PINVOKE);
                        debug_assert!(self.registry.is_managed(self.state.control_pc));
                    }
                }
                break;
            }

            debug_assert!(!self.thread.is_hijacked());
            s.set_control_pc(s.regs.ip());

            let mut collapsing_target = 0;
            let mut ex_collide = false;
            let category = thunks::classify(s.control_pc);

            if doing_funclet_unwind {
                debug_assert_eq!(s.pending_funclet_frame_pointer, 0);
                debug_assert_ne!(s.frame_pointer, 0);
                match category {
                    ReturnAddressCategory::InFuncletInvokeThunk => {
                        // Cleared again when the walk collides with the
                        // record that invoked this funclet.
                        s.pending_funclet_frame_pointer = s.frame_pointer;
                        unsafe { self.unwind_funclet_invoke_thunk()? };
                        if !self.state.flags.contains(WalkFlags::COLLAPSE_FUNCLETS) {
                            ex_collide = true;
                        }
                    }
                    ReturnAddressCategory::InFilterFuncletInvokeThunk => {
                        unsafe { self.unwind_funclet_invoke_thunk()? };
                    }
                    ReturnAddressCategory::InManagedCode => {
                        if s.flags.contains(WalkFlags::COLLAPSE_FUNCLETS) {
                            collapsing_target = s.frame_pointer;
                        }
                    }
                    _ => {
                        return Err(UnwindError::UnexpectedThunk(
                            "unwinding out of a funclet",
                        ));
                    }
                }
            } else if category != ReturnAddressCategory::InManagedCode {
                if thunks::is_non_eh_thunk(category) {
                    unsafe { self.unwind_non_eh_thunk_sequence()? };
                } else if category == ReturnAddressCategory::InThrowSiteThunk {
                    if s.flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT) {
                        return Err(UnwindError::UnexpectedThunk(
                            "EH stack walk is attempting to propagate an exception across a throw site",
                        ));
                    }
                    unsafe { self.unwind_throw_site_thunk()? };
                    if self.state.flags.contains(WalkFlags::COLLAPSE_FUNCLETS)
                        && let Some(next) = self.state.next_ex_info
                        && self.state.regs.sp() > ExInfo::addr(next)
                    {
                        ex_collide = true;
                    }
                } else {
                    return Err(UnwindError::UnexpectedThunk(
                        "unwinding out of a non-funclet",
                    ));
                }
            }

            if ex_collide {
                let ex = self.state.next_ex_info.ok_or(UnwindError::MissingExInfo)?;
                debug_assert!(pre_unwind_sp <= ExInfo::addr(ex));
                debug_assert_eq!(collapsing_target, 0);
                collapsing_target = unsafe { self.handle_ex_collide(ex)? };
            }

            if collapsing_target != 0 {
                debug_assert!(self.state.flags.contains(WalkFlags::COLLAPSE_FUNCLETS));
                unsafe { self.try_calculate_current_method_state()? };
                if self.state.frame_pointer != collapsing_target {
                    return Err(UnwindError::CollapseMismatch {
                        expected: collapsing_target,
                        found: self.state.frame_pointer,
                    });
                }
                if self.state.conservative_lower.is_some() {
                    return Err(UnwindError::CollapseDropsRange);
                }
                log::trace!("[ KeepUnwinding ]");
                continue;
            }

            if ex_collide {
                self.state.flags.insert(WalkFlags::EX_COLLIDE);
            }
            break;
        }

        unsafe { self.prepare_to_yield_frame() }
    }

    /// Returns the frame pointer of a funclet owner the walk must skip, or
    /// zero.
    unsafe fn handle_ex_collide(&mut self, ex: NonNull<ExInfo>) -> Result<usize, UnwindError> {
        // SAFETY: records on the chain are live while the thread is stopped.
        let (kind, pass_number, idx_cur_clause, ex_context, prev, frame_iter) = unsafe {
            let e = ex.as_ref();
            (e.kind, e.pass_number, e.idx_cur_clause, e.ex_context, e.prev, e.frame_iter)
        };
        log::trace!(
            "   [ ex collide ] kind = {kind:?}, pass = {pass_number}, idxCurClause = {idx_cur_clause:#x}"
        );

        let cur_flags = self.state.flags;
        let active_funclet_frame_pointer = self.state.pending_funclet_frame_pointer;
        self.state.pending_funclet_frame_pointer = 0;

        // A GC walk taken inside the dispatcher before any handler runs
        // behaves like a first-pass collision.
        if pass_number == 1 || idx_cur_clause == NO_CLAUSE {
            if cur_flags.contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT) {
                return Err(UnwindError::FirstPassCollision);
            }
            unsafe {
                self.init_from_limited_context(ex_context, cur_flags);
                self.state.next_ex_info = prev;
                self.try_calculate_current_method_state()?;
            }
            debug_assert!(self.is_valid());

            if kind.contains(ExKind::HARDWARE_FAULT)
                && cur_flags.contains(WalkFlags::REMAP_HARDWARE_FAULTS_TO_SAFE_POINT)
            {
                let pc = self.state.control_pc;
                let cm = self
                    .state
                    .code_manager
                    .ok_or(UnwindError::NoCodeManager { pc })?;
                self.state.effective_safe_point =
                    cm.remap_hardware_fault_to_gc_safe_point(&self.state.method_info, pc);
            }
            return Ok(0);
        }

        debug_assert_ne!(
            active_funclet_frame_pointer, 0,
            "collided with an active funclet invoke but the funclet frame pointer is unknown"
        );

        self.update_from_exception_dispatch(&frame_iter);
        self.reset_next_ex_info_for_sp(self.state.regs.sp());

        // The caller applies the return address adjustment again.
        self.state.control_pc = self.state.original_control_pc;
        self.state.flags = cur_flags;

        // The walk is now in the owner frame of the funclet this record
        // invoked; both share a frame pointer.
        if !self.is_valid() {
            return Ok(0);
        }
        unsafe { self.try_calculate_current_method_state()? };
        debug_assert_eq!(self.state.frame_pointer, active_funclet_frame_pointer);

        if cur_flags.contains(WalkFlags::COLLAPSE_FUNCLETS) {
            Ok(active_funclet_frame_pointer)
        } else {
            Ok(0)
        }
    }

    /// Continue from the dispatcher's saved iterator, keeping this walk's
    /// view of the funclet's preserved registers.
    fn update_from_exception_dispatch(&mut self, source: &FrameIterState) {
        debug_assert_eq!(self.state.pending_funclet_frame_pointer, 0);
        let funclet_regs = self.state.funclet_regs;

        self.state = *source;
        self.state.pending_funclet_frame_pointer = 0;

        for reg in FUNCLET_PRESERVED_REGS {
            match funclet_regs[reg.index()] {
                Some(loc) => self.state.regs.set_location(*reg, loc),
                None => self.state.regs.clear_location(*reg),
            }
        }
    }

    unsafe fn unwind_funclet_invoke_thunk(&mut self) -> Result<(), UnwindError> {
        debug_assert!(!self.state.flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
        let pc = self.state.control_pc;
        let kind = thunks::funclet_kind(pc).ok_or(UnwindError::UnexpectedThunk(
            "funclet unwind outside a funclet invoke thunk",
        ))?;
        let layout = arch::funclet_invoke_frame(kind)?;

        if kind != arch::FuncletKind::Filter {
            // Live until the funclet returns; restored at the collision.
            for reg in FUNCLET_PRESERVED_REGS {
                self.state.funclet_regs[reg.index()] = self.state.regs.location(*reg);
            }
        }

        // SAFETY: SP points at the thunk's frame.
        unsafe { layout.unwind(&mut self.state.regs) };
        self.state.set_control_pc(self.state.regs.ip());
        Ok(())
    }

    unsafe fn unwind_universal_transition_thunk(&mut self) -> Result<(), UnwindError> {
        debug_assert!(!self.state.flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
        debug_assert!(self.state.conservative_lower.is_none());
        let layout = arch::universal_transition_frame()?;
        // SAFETY: SP points at the thunk's frame.
        let lower = unsafe { layout.unwind(&mut self.state.regs) };
        self.state.set_control_pc(self.state.regs.ip());
        self.state.conservative_lower = lower;
        Ok(())
    }

    unsafe fn unwind_throw_site_thunk(&mut self) -> Result<(), UnwindError> {
        debug_assert!(!self.state.flags.contains(WalkFlags::METHOD_STATE_CALCULATED));
        let addr = self.state.regs.sp() + arch::throw_site_context_offset();
        let ctx = NonNull::new(addr as *mut PalLimitedContext).ok_or(
            UnwindError::UnexpectedThunk("throw site thunk with a null stack pointer"),
        )?;

        // SAFETY: the throw helpers keep the thrower's context at this
        // offset from their stack pointer.
        let (ip, sp) = unsafe {
            seed_preserved_from_limited_context(&mut self.state.regs, ctx);
            let c = ctx.as_ref();
            (c.ip(), c.sp())
        };
        self.state.regs.set_ip(ip);
        self.state.regs.set_sp(sp);
        self.state.set_control_pc(ip);

        if !self.registry.is_managed(ip) {
            return Err(UnwindError::ThrowSiteNotManaged { pc: ip });
        }
        Ok(())
    }

    /// Unwind a contiguous run of non-EH thunks, publishing the lowest
    /// conservative lower bound any of them reported.
    unsafe fn unwind_non_eh_thunk_sequence(&mut self) -> Result<(), UnwindError> {
        let mut category = thunks::classify(self.state.control_pc);
        debug_assert!(thunks::is_non_eh_thunk(category));

        let mut lowest = None;
        let mut preceding = 0;
        while category != ReturnAddressCategory::InManagedCode {
            debug_assert!(self.state.conservative_lower.is_none());
            match category {
                ReturnAddressCategory::InUniversalTransitionThunk => unsafe {
                    self.unwind_universal_transition_thunk()?
                },
                _ => {
                    return Err(UnwindError::UnexpectedThunk(
                        "unwinding a non-EH thunk sequence",
                    ));
                }
            }

            if let Some(lower) = self.state.conservative_lower.take() {
                let addr = lower.as_ptr() as usize;
                lowest.get_or_insert(lower);
                if addr >= self.state.regs.sp() {
                    return Err(UnwindError::ConservativeRange(
                        "lower bound is not below the unwound stack pointer",
                    ));
                }
                if addr <= preceding {
                    return Err(UnwindError::ConservativeRange(
                        "lower bound is not above the preceding lower bound",
                    ));
                }
                preceding = addr;
            }

            category = thunks::classify(self.state.control_pc);
        }

        self.state.conservative_lower = lowest;
        Ok(())
    }

    unsafe fn prepare_to_yield_frame(&mut self) -> Result<(), UnwindError> {
        if !self.is_valid() {
            return Ok(());
        }
        debug_assert!(
            self.registry.is_managed(self.state.control_pc)
                || self.state.is_native_frame(),
            "yielding a frame outside managed code"
        );

        if self
            .state
            .flags
            .contains(WalkFlags::APPLY_RETURN_ADDRESS_ADJUSTMENT)
        {
            self.state.control_pc = arch::adjust_return_address_backward(self.state.control_pc);
        }

        self.state.should_skip_regular_gc_reporting = false;

        let lower = match self.state.conservative_lower {
            Some(lower) if self.state.flags.contains(WalkFlags::COLLAPSE_FUNCLETS) => lower,
            _ => {
                self.state.conservative_lower = None;
                self.state.conservative_upper = None;
                return Ok(());
            }
        };

        // The range covers the arguments that flowed into the call site in
        // this frame, which end at the top of its outgoing argument area.
        unsafe { self.try_calculate_current_method_state()? };
        let pc = self.state.control_pc;
        let cm = self
            .state
            .code_manager
            .ok_or(UnwindError::NoCodeManager { pc })?;
        // SAFETY: the register set describes a live frame.
        let upper = unsafe {
            cm.get_conservative_upper_bound_for_outgoing_args(
                &self.state.method_info,
                &self.state.regs,
            )
        };
        if upper <= lower.as_ptr() as usize {
            return Err(UnwindError::ConservativeRange(
                "upper bound is not above the lower bound",
            ));
        }
        self.state.conservative_upper = NonNull::new(upper as *mut usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
