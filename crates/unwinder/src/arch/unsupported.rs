//! Placeholder definitions for architectures the unwinder does not support
//! yet. Walks seeded here can read a frame pointer and an instruction
//! pointer, but every thunk unwind fails with
//! [`UnwindError::NotYetImplemented`](crate::UnwindError::NotYetImplemented).

use super::{FrameSlot, FuncletKind, SavedSlot};
use crate::RegisterSet;
use core::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Fp,
    Ret,
}

pub(super) const ALL_REGS: &[Reg] = &[Reg::Fp, Reg::Ret];
pub(super) const FP: Reg = Reg::Fp;
pub(super) const RETURN_VALUE: Reg = Reg::Ret;

pub(super) fn reg_name(reg: Reg) -> &'static str {
    match reg {
        Reg::Fp => "fp",
        Reg::Ret => "ret",
    }
}

pub const STACK_ALIGN: usize = 16;
pub const RETURN_ADDRESS_ADJUSTMENT: usize = 1;
pub const THROW_SITE_OUTGOING_SCRATCH: usize = 0;
pub type PreservedFloat = u64;
pub const PRESERVED_FLOAT_COUNT: usize = 0;
pub const FUNCLET_PRESERVED_REGS: &[Reg] = &[Reg::Fp];

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransitionFrameFlags: u64 {
        const SAVE_FP = 0x1;
        const SAVE_SP = 0x2;
        const SAVE_RET = 0x4;
        const RET_IS_GCREF = 0x8;
        const RET_IS_BYREF = 0x10;
        const THREAD_ABORT = 0x20;
    }
}

impl TransitionFrameFlags {
    pub const RETURN_IS_GCREF: Self = Self::RET_IS_GCREF;
    pub const RETURN_IS_BYREF: Self = Self::RET_IS_BYREF;
}

pub const TRANSITION_FRAME_SAVE_ORDER: &[(TransitionFrameFlags, SavedSlot)] = &[
    (TransitionFrameFlags::SAVE_SP, SavedSlot::Sp),
    (TransitionFrameFlags::SAVE_RET, SavedSlot::Reg(Reg::Ret)),
];

#[repr(C)]
#[derive(Debug)]
pub struct PInvokeTransitionFrame {
    pub rip: usize,
    pub frame_pointer: usize,
    pub thread: usize,
    pub flags: u64,
    pub preserved_regs: [usize; 0],
}

pub(crate) unsafe fn seed_transition_link_register(
    _regs: &mut RegisterSet,
    _frame: NonNull<PInvokeTransitionFrame>,
) {
}

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct PalLimitedContext {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    pub ret: usize,
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

    pub fn reg(&self, reg: Reg) -> Option<usize> {
        Some(match reg {
            Reg::Fp => self.fp,
            Reg::Ret => self.ret,
        })
    }
}

pub(crate) unsafe fn seed_preserved_from_limited_context(
    regs: &mut RegisterSet,
    ctx: NonNull<PalLimitedContext>,
) {
    regs.set_location(Reg::Fp, field_ptr!(ctx, fp));
}

pub(crate) unsafe fn seed_from_limited_context(
    regs: &mut RegisterSet,
    ctx: NonNull<PalLimitedContext>,
) {
    unsafe { seed_preserved_from_limited_context(regs, ctx) };
    regs.set_location(Reg::Ret, field_ptr!(ctx, ret));
}

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct NativeContext {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    pub ret: usize,
}

impl NativeContext {
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn sp(&self) -> usize {
        self.sp
    }
}

pub(crate) unsafe fn seed_from_native_context(regs: &mut RegisterSet, ctx: NonNull<NativeContext>) {
    regs.set_location(Reg::Fp, field_ptr!(ctx, fp));
    regs.set_location(Reg::Ret, field_ptr!(ctx, ret));
}

pub(super) const UNIVERSAL_TRANSITION_FRAME: Option<&[FrameSlot]> = None;

pub(super) fn funclet_invoke_frame(_kind: FuncletKind) -> Option<&'static [FrameSlot]> {
    None
}
