use crate::arch::{PInvokeTransitionFrame, SavedSlot, TRANSITION_FRAME_SAVE_ORDER, TransitionFrameFlags};
use crate::{GcRefKind, Reg, RegisterSet};
use core::ptr::NonNull;

/// A transition frame as recorded by a thread or returned by an unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionFrameRef {
    /// There are no managed frames below this point.
    TopOfStack,
    /// A real frame.
    Frame(NonNull<PInvokeTransitionFrame>),
}

impl TransitionFrameRef {
    /// Raw value recorded for [`TransitionFrameRef::TopOfStack`].
    pub const TOP_OF_STACK: usize = usize::MAX;

    /// Raw value a thread records when it was interrupted mid-frame.
    pub const INTERRUPTED: usize = usize::MAX - 1;

    /// Decode a raw transition-frame word. Zero means "none".
    pub fn from_raw(raw: usize) -> Option<TransitionFrameRef> {
        match raw {
            0 | Self::INTERRUPTED => None,
            Self::TOP_OF_STACK => Some(TransitionFrameRef::TopOfStack),
            _ => NonNull::new(raw as *mut PInvokeTransitionFrame).map(TransitionFrameRef::Frame),
        }
    }

    /// The raw word recorded for this frame.
    pub fn to_raw(self) -> usize {
        match self {
            TransitionFrameRef::TopOfStack => Self::TOP_OF_STACK,
            TransitionFrameRef::Frame(frame) => frame.as_ptr() as usize,
        }
    }
}

/// Where a GC stack walk of a suspended thread starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkSeed {
    /// The thread has no managed frames.
    TopOfStack,
    /// The thread left managed code through this frame.
    Frame(NonNull<PInvokeTransitionFrame>),
    /// The thread was stopped mid-frame; walk from its interrupted context.
    InterruptedThread,
}

impl WalkSeed {
    /// Decode a raw transition-frame word. Zero means "none".
    pub fn from_raw(raw: usize) -> Option<WalkSeed> {
        match raw {
            TransitionFrameRef::INTERRUPTED => Some(WalkSeed::InterruptedThread),
            _ => TransitionFrameRef::from_raw(raw).map(WalkSeed::from),
        }
    }
}

impl From<TransitionFrameRef> for WalkSeed {
    fn from(frame: TransitionFrameRef) -> WalkSeed {
        match frame {
            TransitionFrameRef::TopOfStack => WalkSeed::TopOfStack,
            TransitionFrameRef::Frame(f) => WalkSeed::Frame(f),
        }
    }
}

/// Seed `regs` from a transition frame: the caller's IP, the frame pointer
/// slot and every register the frame's flags say was spilled.
///
/// Returns the kind of value held in the return register, for frames built
/// by a hijack trampoline.
///
/// # Safety
///
/// `frame` must point to a live transition frame followed by its spilled
/// registers.
pub(crate) unsafe fn seed_from_transition_frame(
    regs: &mut RegisterSet,
    frame: NonNull<PInvokeTransitionFrame>,
) -> GcRefKind {
    *regs = RegisterSet::default();

    // SAFETY: upheld by the caller.
    let (rip, flags) = unsafe {
        let f = frame.as_ptr();
        ((*f).rip, TransitionFrameFlags::from_bits_retain((*f).flags))
    };
    debug_assert!(
        !flags.contains(TransitionFrameFlags::SAVE_FP),
        "the frame pointer is never spilled into the save area"
    );
    regs.set_ip(rip);
    regs.set_location(Reg::FP, field_ptr!(frame, frame_pointer));
    // SAFETY: upheld by the caller.
    unsafe { crate::arch::seed_transition_link_register(regs, frame) };

    let mut cursor = field_ptr!(frame, preserved_regs).cast::<usize>();
    for (flag, slot) in TRANSITION_FRAME_SAVE_ORDER {
        if !flags.contains(*flag) {
            continue;
        }
        match slot {
            SavedSlot::Reg(reg) => regs.set_location(*reg, cursor),
            // SAFETY: flagged slots are present in the save area.
            SavedSlot::Sp => regs.set_sp(unsafe { *cursor.as_ptr() }),
        }
        // SAFETY: the save area holds one word per flagged slot.
        cursor = unsafe { cursor.add(1) };
    }

    flags.return_kind()
}
