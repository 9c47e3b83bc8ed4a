//! Architecture-specific register sets, context records and the fixed stack
//! frame layouts of the runtime's hand-written thunks.
//!
//! Each supported architecture exports the same set of names; this module
//! picks one with `cfg_if!` and re-exports it. Every layout described here is
//! a contract with assembly code living elsewhere and must be kept in lockstep
//! with it.

use crate::{RegisterSet, UnwindError};
use core::ptr::NonNull;

/// Project a raw pointer to a `#[repr(C)]` record onto one of its fields.
macro_rules! field_ptr {
    ($base:expr, $field:ident) => {{
        let base: core::ptr::NonNull<_> = $base;
        // SAFETY: projecting a non-null pointer to a field never yields null
        // and does not read memory.
        unsafe { core::ptr::NonNull::new_unchecked(&raw mut (*base.as_ptr()).$field) }
    }};
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as imp;
    } else {
        mod unsupported;
        use unsupported as imp;
    }
}

pub use imp::{
    FUNCLET_PRESERVED_REGS, NativeContext, PInvokeTransitionFrame, PRESERVED_FLOAT_COUNT,
    PalLimitedContext, PreservedFloat, RETURN_ADDRESS_ADJUSTMENT, Reg, STACK_ALIGN,
    THROW_SITE_OUTGOING_SCRATCH, TRANSITION_FRAME_SAVE_ORDER, TransitionFrameFlags,
};

pub(crate) use imp::{
    seed_from_limited_context, seed_from_native_context, seed_preserved_from_limited_context,
    seed_transition_link_register,
};

/// A 128-bit floating point register image, as saved by thunks and contexts
/// on targets whose ABI preserves the full vector register.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fp128 {
    pub low: u64,
    pub high: i64,
}

/// Which of the funclet-invoke thunks a return address points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncletKind {
    Catch,
    Finally,
    Filter,
}

/// Where a value found in a transition frame's spill area belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedSlot {
    Reg(Reg),
    Sp,
}

/// One slot of a thunk's fixed stack frame, listed from the thunk's stack
/// pointer upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlot {
    /// Words the unwinder does not care about (locals, argument homes, padding).
    Skip(usize),
    /// A spilled preserved register.
    Reg(Reg),
    /// The next preserved floating point register image.
    Float,
    /// The caller's return address.
    ReturnAddress,
    /// Zero-sized marker: the lowest address that must be reported
    /// conservatively for this thunk.
    ConservativeLowerBound,
}

impl FrameSlot {
    /// Size of the slot in bytes.
    pub fn size(&self) -> usize {
        match self {
            FrameSlot::Skip(words) => words * size_of::<usize>(),
            FrameSlot::Reg(_) | FrameSlot::ReturnAddress => size_of::<usize>(),
            FrameSlot::Float => size_of::<PreservedFloat>(),
            FrameSlot::ConservativeLowerBound => 0,
        }
    }
}

/// A thunk frame layout. The frame ends, and the caller's stack pointer
/// begins, right after the last slot.
#[derive(Debug, Clone, Copy)]
pub struct FixedFrameLayout {
    pub slots: &'static [FrameSlot],
}

impl FixedFrameLayout {
    /// Total size of the frame in bytes.
    pub fn size(&self) -> usize {
        self.slots.iter().map(FrameSlot::size).sum()
    }

    /// Byte offset of the first occurrence of `slot` from the frame base.
    pub fn offset_of(&self, slot: FrameSlot) -> Option<usize> {
        let mut offset = 0;
        for s in self.slots {
            if *s == slot {
                return Some(offset);
            }
            offset += s.size();
        }
        None
    }

    /// Unwind through a frame with this layout whose base is `regs.sp`.
    ///
    /// Spilled registers are located in place, preserved floats are copied,
    /// the instruction pointer is loaded from the return address slot and the
    /// stack pointer moves to the end of the frame. Returns the conservative
    /// reporting lower bound if the layout has one.
    ///
    /// # Safety
    ///
    /// `regs.sp` must point at a live frame with this layout.
    pub(crate) unsafe fn unwind(&self, regs: &mut RegisterSet) -> Option<NonNull<usize>> {
        let base = regs.sp();
        let mut offset = 0;
        let mut float = 0;
        let mut lower_bound = None;
        for slot in self.slots {
            let addr = base + offset;
            match *slot {
                FrameSlot::Skip(_) => {}
                FrameSlot::Reg(reg) => {
                    if let Some(loc) = NonNull::new(addr as *mut usize) {
                        regs.set_location(reg, loc);
                    }
                }
                FrameSlot::Float => {
                    if let Some(dst) = regs.floats.get_mut(float) {
                        // SAFETY: upheld by the caller.
                        *dst = unsafe { (addr as *const PreservedFloat).read_unaligned() };
                    }
                    float += 1;
                }
                FrameSlot::ReturnAddress => {
                    // SAFETY: upheld by the caller.
                    regs.set_ip(unsafe { *(addr as *const usize) });
                }
                FrameSlot::ConservativeLowerBound => {
                    lower_bound = NonNull::new(addr as *mut usize);
                }
            }
            offset += slot.size();
        }
        regs.set_sp(base + offset);
        lower_bound
    }
}

/// Frame layout of the universal transition thunk.
pub fn universal_transition_frame() -> Result<FixedFrameLayout, UnwindError> {
    imp::UNIVERSAL_TRANSITION_FRAME
        .map(|slots| FixedFrameLayout { slots })
        .ok_or(UnwindError::NotYetImplemented("universal transition unwind"))
}

/// Frame layout of the catch/finally/filter funclet-invoke thunks.
pub fn funclet_invoke_frame(kind: FuncletKind) -> Result<FixedFrameLayout, UnwindError> {
    imp::funclet_invoke_frame(kind)
        .map(|slots| FixedFrameLayout { slots })
        .ok_or(UnwindError::NotYetImplemented("funclet invoke unwind"))
}

/// Byte offset from a throw-site thunk's stack pointer to the context record it
/// saved for the throwing frame.
pub fn throw_site_context_offset() -> usize {
    THROW_SITE_OUTGOING_SCRATCH + stack_size_of_exinfo()
}

/// Size of an [`ExInfo`](crate::ExInfo) as laid out by the throw helpers.
pub fn stack_size_of_exinfo() -> usize {
    (size_of::<crate::ExInfo>() + (STACK_ALIGN - 1)) & !(STACK_ALIGN - 1)
}

/// Step a return address back into the call instruction that produced it.
pub fn adjust_return_address_backward(pc: usize) -> usize {
    pc - RETURN_ADDRESS_ADJUSTMENT
}

impl Reg {
    /// The register holding the frame pointer.
    pub const FP: Reg = imp::FP;

    /// The register holding a scalar or object return value.
    pub const RETURN_VALUE: Reg = imp::RETURN_VALUE;

    /// Number of tracked registers.
    pub const COUNT: usize = imp::ALL_REGS.len();

    /// Every tracked register, in index order.
    pub fn all() -> &'static [Reg] {
        imp::ALL_REGS
    }

    /// Index of this register in a register table.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The assembler name of this register.
    pub fn name(self) -> &'static str {
        imp::reg_name(self)
    }

    /// Look a register up by its assembler name.
    pub fn from_name(name: &str) -> Option<Reg> {
        Reg::all().iter().copied().find(|r| r.name() == name)
    }
}

impl core::fmt::Display for Reg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl TransitionFrameFlags {
    /// Kind of GC reference the frame's return-value register holds.
    pub fn return_kind(self) -> crate::GcRefKind {
        if self.contains(TransitionFrameFlags::RETURN_IS_GCREF) {
            crate::GcRefKind::Object
        } else if self.contains(TransitionFrameFlags::RETURN_IS_BYREF) {
            crate::GcRefKind::Byref
        } else {
            crate::GcRefKind::Scalar
        }
    }

    /// Flags that record `kind` for the return-value register.
    pub fn from_return_kind(kind: crate::GcRefKind) -> TransitionFrameFlags {
        match kind {
            crate::GcRefKind::Scalar => TransitionFrameFlags::empty(),
            crate::GcRefKind::Object => TransitionFrameFlags::RETURN_IS_GCREF,
            crate::GcRefKind::Byref => TransitionFrameFlags::RETURN_IS_BYREF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_round_trip() {
        for reg in Reg::all() {
            assert_eq!(Reg::from_name(reg.name()), Some(*reg));
        }
        assert_eq!(Reg::from_name("not-a-register"), None);
        assert_eq!(Reg::all().len(), Reg::COUNT);
    }

    #[test]
    fn register_indices_are_dense() {
        for (i, reg) in Reg::all().iter().enumerate() {
            assert_eq!(reg.index(), i);
        }
    }

    #[test]
    fn exinfo_stack_size_is_aligned() {
        let size = stack_size_of_exinfo();
        assert_eq!(size % STACK_ALIGN, 0);
        assert!(size >= size_of::<crate::ExInfo>());
    }

    #[test]
    fn layout_offsets() {
        let layout = FixedFrameLayout {
            slots: &[
                FrameSlot::Skip(2),
                FrameSlot::ConservativeLowerBound,
                FrameSlot::Skip(1),
                FrameSlot::ReturnAddress,
            ],
        };
        assert_eq!(layout.size(), 4 * size_of::<usize>());
        assert_eq!(
            layout.offset_of(FrameSlot::ConservativeLowerBound),
            Some(2 * size_of::<usize>())
        );
        assert_eq!(
            layout.offset_of(FrameSlot::ReturnAddress),
            Some(3 * size_of::<usize>())
        );
        assert_eq!(layout.offset_of(FrameSlot::Float), None);
    }

    #[test]
    fn return_kind_flags_round_trip() {
        use crate::GcRefKind;
        for kind in [GcRefKind::Scalar, GcRefKind::Object, GcRefKind::Byref] {
            assert_eq!(TransitionFrameFlags::from_return_kind(kind).return_kind(), kind);
        }
    }
}
