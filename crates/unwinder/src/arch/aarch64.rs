//! AArch64 definitions.

use super::{FrameSlot, FuncletKind, SavedSlot};
use crate::RegisterSet;
use core::ptr::NonNull;

/// Integer registers tracked by a [`RegisterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    X0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    Fp,
    Lr,
}

pub(super) const ALL_REGS: &[Reg] = &[
    Reg::X0,
    Reg::X1,
    Reg::X2,
    Reg::X3,
    Reg::X4,
    Reg::X5,
    Reg::X6,
    Reg::X7,
    Reg::X8,
    Reg::X9,
    Reg::X10,
    Reg::X11,
    Reg::X12,
    Reg::X13,
    Reg::X14,
    Reg::X15,
    Reg::X16,
    Reg::X17,
    Reg::X18,
    Reg::X19,
    Reg::X20,
    Reg::X21,
    Reg::X22,
    Reg::X23,
    Reg::X24,
    Reg::X25,
    Reg::X26,
    Reg::X27,
    Reg::X28,
    Reg::Fp,
    Reg::Lr,
];

pub(super) const FP: Reg = Reg::Fp;
pub(super) const RETURN_VALUE: Reg = Reg::X0;

const NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr",
];

pub(super) fn reg_name(reg: Reg) -> &'static str {
    NAMES[reg as usize]
}

pub const STACK_ALIGN: usize = 16;

/// Instructions are fixed width; backing up one instruction lands on the `bl`.
pub const RETURN_ADDRESS_ADJUSTMENT: usize = 4;

pub const THROW_SITE_OUTGOING_SCRATCH: usize = 0;

/// d8-d15 are callee-saved, but only their low 64 bits.
pub type PreservedFloat = u64;
pub const PRESERVED_FLOAT_COUNT: usize = 8;

pub const FUNCLET_PRESERVED_REGS: &[Reg] = &[
    Reg::X19,
    Reg::X20,
    Reg::X21,
    Reg::X22,
    Reg::X23,
    Reg::X24,
    Reg::X25,
    Reg::X26,
    Reg::X27,
    Reg::X28,
    Reg::Fp,
];

bitflags::bitflags! {
    /// Which registers a [`PInvokeTransitionFrame`] spilled, and what kind of
    /// value x0/x1 hold when the frame was built by a hijack trampoline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransitionFrameFlags: u64 {
        const SAVE_X19 = 1 << 0;
        const SAVE_X20 = 1 << 1;
        const SAVE_X21 = 1 << 2;
        const SAVE_X22 = 1 << 3;
        const SAVE_X23 = 1 << 4;
        const SAVE_X24 = 1 << 5;
        const SAVE_X25 = 1 << 6;
        const SAVE_X26 = 1 << 7;
        const SAVE_X27 = 1 << 8;
        const SAVE_X28 = 1 << 9;
        const SAVE_SP = 1 << 10;
        const SAVE_X0 = 1 << 11;
        const SAVE_X1 = 1 << 12;
        const SAVE_X2 = 1 << 13;
        const SAVE_X3 = 1 << 14;
        const SAVE_X4 = 1 << 15;
        const SAVE_X5 = 1 << 16;
        const SAVE_X6 = 1 << 17;
        const SAVE_X7 = 1 << 18;
        const SAVE_X8 = 1 << 19;
        const SAVE_X9 = 1 << 20;
        const SAVE_X10 = 1 << 21;
        const SAVE_X11 = 1 << 22;
        const SAVE_X12 = 1 << 23;
        const SAVE_X13 = 1 << 24;
        const SAVE_X14 = 1 << 25;
        const SAVE_X15 = 1 << 26;
        const SAVE_X16 = 1 << 27;
        const SAVE_X17 = 1 << 28;
        const SAVE_X18 = 1 << 29;
        /// Never set: the frame pointer is recorded in the frame itself.
        const SAVE_FP = 1 << 30;
        const SAVE_LR = 1 << 31;
        const X0_IS_GCREF = 1 << 32;
        const X0_IS_BYREF = 1 << 33;
        const X1_IS_GCREF = 1 << 34;
        const X1_IS_BYREF = 1 << 35;
        const THREAD_ABORT = 1 << 36;
    }
}

impl TransitionFrameFlags {
    pub const RETURN_IS_GCREF: Self = Self::X0_IS_GCREF;
    pub const RETURN_IS_BYREF: Self = Self::X0_IS_BYREF;
}

pub const TRANSITION_FRAME_SAVE_ORDER: &[(TransitionFrameFlags, SavedSlot)] = &[
    (TransitionFrameFlags::SAVE_X19, SavedSlot::Reg(Reg::X19)),
    (TransitionFrameFlags::SAVE_X20, SavedSlot::Reg(Reg::X20)),
    (TransitionFrameFlags::SAVE_X21, SavedSlot::Reg(Reg::X21)),
    (TransitionFrameFlags::SAVE_X22, SavedSlot::Reg(Reg::X22)),
    (TransitionFrameFlags::SAVE_X23, SavedSlot::Reg(Reg::X23)),
    (TransitionFrameFlags::SAVE_X24, SavedSlot::Reg(Reg::X24)),
    (TransitionFrameFlags::SAVE_X25, SavedSlot::Reg(Reg::X25)),
    (TransitionFrameFlags::SAVE_X26, SavedSlot::Reg(Reg::X26)),
    (TransitionFrameFlags::SAVE_X27, SavedSlot::Reg(Reg::X27)),
    (TransitionFrameFlags::SAVE_X28, SavedSlot::Reg(Reg::X28)),
    (TransitionFrameFlags::SAVE_SP, SavedSlot::Sp),
    (TransitionFrameFlags::SAVE_X0, SavedSlot::Reg(Reg::X0)),
    (TransitionFrameFlags::SAVE_X1, SavedSlot::Reg(Reg::X1)),
    (TransitionFrameFlags::SAVE_X2, SavedSlot::Reg(Reg::X2)),
    (TransitionFrameFlags::SAVE_X3, SavedSlot::Reg(Reg::X3)),
    (TransitionFrameFlags::SAVE_X4, SavedSlot::Reg(Reg::X4)),
    (TransitionFrameFlags::SAVE_X5, SavedSlot::Reg(Reg::X5)),
    (TransitionFrameFlags::SAVE_X6, SavedSlot::Reg(Reg::X6)),
    (TransitionFrameFlags::SAVE_X7, SavedSlot::Reg(Reg::X7)),
    (TransitionFrameFlags::SAVE_X8, SavedSlot::Reg(Reg::X8)),
    (TransitionFrameFlags::SAVE_X9, SavedSlot::Reg(Reg::X9)),
    (TransitionFrameFlags::SAVE_X10, SavedSlot::Reg(Reg::X10)),
    (TransitionFrameFlags::SAVE_X11, SavedSlot::Reg(Reg::X11)),
    (TransitionFrameFlags::SAVE_X12, SavedSlot::Reg(Reg::X12)),
    (TransitionFrameFlags::SAVE_X13, SavedSlot::Reg(Reg::X13)),
    (TransitionFrameFlags::SAVE_X14, SavedSlot::Reg(Reg::X14)),
    (TransitionFrameFlags::SAVE_X15, SavedSlot::Reg(Reg::X15)),
    (TransitionFrameFlags::SAVE_X16, SavedSlot::Reg(Reg::X16)),
    (TransitionFrameFlags::SAVE_X17, SavedSlot::Reg(Reg::X17)),
    (TransitionFrameFlags::SAVE_X18, SavedSlot::Reg(Reg::X18)),
    (TransitionFrameFlags::SAVE_LR, SavedSlot::Reg(Reg::Lr)),
];

/// Record written by generated code (or a hijack trampoline) when control
/// leaves managed code. The frame pointer and return address form the usual
/// fp/lr pair.
#[repr(C)]
#[derive(Debug)]
pub struct PInvokeTransitionFrame {
    pub frame_pointer: usize,
    pub rip: usize,
    pub thread: usize,
    pub flags: u64,
    pub preserved_regs: [usize; 0],
}

pub(crate) unsafe fn seed_transition_link_register(
    regs: &mut RegisterSet,
    frame: NonNull<PInvokeTransitionFrame>,
) {
    regs.set_location(Reg::Lr, field_ptr!(frame, rip));
}

/// Register state saved by the throw helpers and by thread suspension.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct PalLimitedContext {
    pub fp: usize,
    pub lr: usize,
    pub x0: usize,
    pub x1: usize,
    pub x19: usize,
    pub x20: usize,
    pub x21: usize,
    pub x22: usize,
    pub x23: usize,
    pub x24: usize,
    pub x25: usize,
    pub x26: usize,
    pub x27: usize,
    pub x28: usize,
    pub sp: usize,
    pub ip: usize,
    pub d: [u64; PRESERVED_FLOAT_COUNT],
}

impl PalLimitedContext {
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    pub fn set_fp(&mut self, fp: usize) {
        self.fp = fp;
    }

    /// Value of a register captured in this context, if the context has one.
    pub fn reg(&self, reg: Reg) -> Option<usize> {
        let ctx = NonNull::from(self);
        let mut regs = RegisterSet::default();
        // SAFETY: `ctx` is derived from a live reference.
        unsafe {
            seed_from_limited_context(&mut regs, ctx);
            regs.value(reg)
        }
    }
}

pub(crate) unsafe fn seed_preserved_from_limited_context(
    regs: &mut RegisterSet,
    ctx: NonNull<PalLimitedContext>,
) {
    regs.set_location(Reg::X19, field_ptr!(ctx, x19));
    regs.set_location(Reg::X20, field_ptr!(ctx, x20));
    regs.set_location(Reg::X21, field_ptr!(ctx, x21));
    regs.set_location(Reg::X22, field_ptr!(ctx, x22));
    regs.set_location(Reg::X23, field_ptr!(ctx, x23));
    regs.set_location(Reg::X24, field_ptr!(ctx, x24));
    regs.set_location(Reg::X25, field_ptr!(ctx, x25));
    regs.set_location(Reg::X26, field_ptr!(ctx, x26));
    regs.set_location(Reg::X27, field_ptr!(ctx, x27));
    regs.set_location(Reg::X28, field_ptr!(ctx, x28));
    regs.set_location(Reg::Fp, field_ptr!(ctx, fp));
}

pub(crate) unsafe fn seed_from_limited_context(
    regs: &mut RegisterSet,
    ctx: NonNull<PalLimitedContext>,
) {
    unsafe { seed_preserved_from_limited_context(regs, ctx) };
    regs.set_location(Reg::Lr, field_ptr!(ctx, lr));
    regs.set_location(Reg::X0, field_ptr!(ctx, x0));
    regs.set_location(Reg::X1, field_ptr!(ctx, x1));
    // SAFETY: the caller guarantees `ctx` is readable.
    regs.floats = unsafe { (*ctx.as_ptr()).d };
    for reg in &ALL_REGS[Reg::X2 as usize..=Reg::X18 as usize] {
        regs.clear_location(*reg);
    }
}

/// An operating system thread context, reduced to what the unwinder reads.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct NativeContext {
    pub x: [usize; 29],
    pub fp: usize,
    pub lr: usize,
    pub sp: usize,
    pub pc: usize,
}

impl NativeContext {
    pub fn ip(&self) -> usize {
        self.pc
    }

    pub fn sp(&self) -> usize {
        self.sp
    }
}

pub(crate) unsafe fn seed_from_native_context(regs: &mut RegisterSet, ctx: NonNull<NativeContext>) {
    let x = field_ptr!(ctx, x).cast::<usize>();
    for (i, reg) in ALL_REGS[..=Reg::X28 as usize].iter().enumerate() {
        // SAFETY: `i` is in bounds of the 29-element `x` array.
        regs.set_location(*reg, unsafe { x.add(i) });
    }
    regs.set_location(Reg::Fp, field_ptr!(ctx, fp));
    regs.set_location(Reg::Lr, field_ptr!(ctx, lr));
}

//                                      ChildSP+000 CallerSP-100 fp
//                                      ChildSP+008 CallerSP-0F8 lr
//                                      ChildSP+010 CallerSP-0F0 q0-q7
//                                      ChildSP+090 CallerSP-070 return block
//                                      ChildSP+0B0 CallerSP-050 x0-x8
//                                      ChildSP+0F8 CallerSP-008 padding
pub(super) const UNIVERSAL_TRANSITION_FRAME: Option<&[FrameSlot]> = Some(&[
    FrameSlot::Reg(Reg::Fp),
    FrameSlot::ReturnAddress,
    FrameSlot::Skip(16),
    FrameSlot::ConservativeLowerBound,
    FrameSlot::Skip(4),
    FrameSlot::Skip(9),
    FrameSlot::Skip(1),
]);

const fn funclet_frame(extra: usize) -> [FrameSlot; 22] {
    let mut slots = [FrameSlot::Skip(0); 22];
    let mut i = 0;
    while i < PRESERVED_FLOAT_COUNT {
        slots[i] = FrameSlot::Float;
        i += 1;
    }
    slots[8] = FrameSlot::Skip(extra);
    slots[9] = FrameSlot::Reg(Reg::Fp);
    slots[10] = FrameSlot::ReturnAddress;
    let mut j = 0;
    while j < 10 {
        slots[11 + j] = FrameSlot::Reg(ALL_REGS[Reg::X19 as usize + j]);
        j += 1;
    }
    slots
}

// The catch thunk keeps two extra words on its frame; filters keep none.
static CATCH_FUNCLET_FRAME: [FrameSlot; 22] = funclet_frame(6);
static FINALLY_FUNCLET_FRAME: [FrameSlot; 22] = funclet_frame(4);
static FILTER_FUNCLET_FRAME: [FrameSlot; 22] = funclet_frame(0);

pub(super) fn funclet_invoke_frame(kind: FuncletKind) -> Option<&'static [FrameSlot]> {
    Some(match kind {
        FuncletKind::Catch => &CATCH_FUNCLET_FRAME,
        FuncletKind::Finally => &FINALLY_FUNCLET_FRAME,
        FuncletKind::Filter => &FILTER_FUNCLET_FRAME,
    })
}

#[cfg(test)]
mod tests {
    use super::super::{FixedFrameLayout, universal_transition_frame};
    use super::*;

    #[test]
    fn universal_transition_offsets() {
        let frame = universal_transition_frame().unwrap();
        assert_eq!(frame.size(), 0x100);
        assert_eq!(frame.offset_of(FrameSlot::ReturnAddress), Some(0x8));
        assert_eq!(frame.offset_of(FrameSlot::ConservativeLowerBound), Some(0x90));
    }

    #[test]
    fn funclet_frames() {
        let catch = FixedFrameLayout {
            slots: funclet_invoke_frame(FuncletKind::Catch).unwrap(),
        };
        assert_eq!(catch.offset_of(FrameSlot::Reg(Reg::Fp)), Some((8 + 6) * 8));
        assert_eq!(catch.offset_of(FrameSlot::Reg(Reg::X28)), Some((8 + 6 + 2 + 9) * 8));
        let filter = FixedFrameLayout {
            slots: funclet_invoke_frame(FuncletKind::Filter).unwrap(),
        };
        assert_eq!(filter.offset_of(FrameSlot::ReturnAddress), Some(9 * 8));
        assert_eq!(filter.size(), (8 + 2 + 10) * 8);
    }

    #[test]
    fn register_names() {
        assert_eq!(Reg::X19.name(), "x19");
        assert_eq!(Reg::Fp.name(), "fp");
        assert_eq!(Reg::Lr.name(), "lr");
    }

    #[test]
    fn limited_context_register_lookup() {
        let ctx = PalLimitedContext {
            fp: 0x10,
            x19: 0x20,
            x1: 0x30,
            ..Default::default()
        };
        assert_eq!(ctx.reg(Reg::Fp), Some(0x10));
        assert_eq!(ctx.reg(Reg::X19), Some(0x20));
        assert_eq!(ctx.reg(Reg::X1), Some(0x30));
        assert_eq!(ctx.reg(Reg::X5), None);
    }
}
