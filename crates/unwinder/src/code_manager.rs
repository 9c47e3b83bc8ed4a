use crate::{ExInfo, GcRootSink, PalLimitedContext, RegisterSet, TransitionFrameRef, UnwindError};
use core::ptr::NonNull;

/// Opaque, code-manager-specific description of one method (or funclet).
///
/// The walker only ever looks at `start`; the remaining words belong to
/// whichever [`CodeManager`] produced the value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// Address of the first instruction of the method or funclet.
    pub start: usize,
    /// Words reserved for the code manager.
    pub opaque: [usize; 4],
}

bitflags::bitflags! {
    /// Options for [`CodeManager::unwind_stack_frame`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u32 {
        /// Stop at a reverse P/Invoke boundary instead of unwinding the
        /// native caller's registers.
        const STOP_UNWIND_ON_TRANSITION_FRAME = 0x1;
        /// The unwind is part of a GC stack walk.
        const GC_UNWIND = 0x2;
    }
}

/// What kind of value a return register holds, as far as the collector is
/// concerned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcRefKind {
    /// Not a GC reference.
    #[default]
    Scalar,
    /// An object reference.
    Object,
    /// An interior reference.
    Byref,
}

/// Per-module service that understands the frames of the code it owns.
///
/// # Safety
///
/// The walker reads and writes raw stack memory based on the answers given
/// here. Implementations must only hand back locations inside the frames
/// described by the register set they were given.
pub unsafe trait CodeManager: Sync {
    /// Look up the method containing `pc`.
    fn find_method_info(&self, pc: usize) -> Option<MethodInfo>;

    /// Unwind one frame, updating `regs` to describe the caller.
    ///
    /// Returns the transition frame that was saved on entry if the method
    /// was called from native code through a reverse P/Invoke, or
    /// [`TransitionFrameRef::TopOfStack`] if there is no managed caller.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of `info`.
    unsafe fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        flags: UnwindFlags,
        regs: &mut RegisterSet,
    ) -> Result<Option<TransitionFrameRef>, UnwindError>;

    /// Whether `info` describes a funclet rather than a main method body.
    fn is_funclet(&self, info: &MethodInfo) -> bool;

    /// The frame pointer identifying the logical frame. Funclets report their
    /// owner's frame pointer.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of `info`.
    unsafe fn get_frame_pointer(&self, info: &MethodInfo, regs: &RegisterSet) -> usize;

    /// Report the live GC references of the frame at `safe_point`.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of `info`.
    unsafe fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        safe_point: usize,
        regs: &RegisterSet,
        sink: &mut dyn GcRootSink,
        is_active_frame: bool,
    );

    /// Location of the frame's return address, and the kind of value the
    /// method returns, if the frame can be hijacked.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of `info`.
    unsafe fn get_return_address_hijack_info(
        &self,
        info: &MethodInfo,
        regs: &RegisterSet,
    ) -> Option<(NonNull<usize>, GcRefKind)>;

    /// Top of the outgoing argument area of the frame.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of `info`.
    unsafe fn get_conservative_upper_bound_for_outgoing_args(
        &self,
        info: &MethodInfo,
        regs: &RegisterSet,
    ) -> usize;

    /// Map a faulting instruction to the safe point whose GC information
    /// describes it.
    fn remap_hardware_fault_to_gc_safe_point(&self, info: &MethodInfo, pc: usize) -> usize;
}

/// The set of code ranges whose frames the walker can unwind.
pub trait CodeRegistry {
    /// Whether `pc` lies in managed code.
    fn is_managed(&self, pc: usize) -> bool;

    /// The code manager owning `pc`.
    fn code_manager_for_address(&self, pc: usize) -> Option<&'static dyn CodeManager>;
}

/// The per-thread state a stack walk reads.
pub trait WalkableThread {
    /// Most recent in-flight exception dispatch record.
    fn ex_info_head(&self) -> Option<NonNull<ExInfo>>;

    /// Context captured when the thread was interrupted mid-frame.
    fn interrupted_context(&self) -> Option<NonNull<PalLimitedContext>>;

    /// Transition frame a stack trace of the current thread starts from.
    fn transition_frame_for_stack_trace(&self) -> TransitionFrameRef;

    /// Whether a return address of this thread is currently hijacked.
    fn is_hijacked(&self) -> bool;
}
