//! x86-64 definitions, for both the System V and the Windows calling
//! conventions.

use super::{FrameSlot, FuncletKind, SavedSlot};
use crate::RegisterSet;
use core::ptr::NonNull;

/// Integer registers tracked by a [`RegisterSet`]. The stack pointer and
/// instruction pointer are tracked by value and are not part of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub(super) const ALL_REGS: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

pub(super) const FP: Reg = Reg::Rbp;
pub(super) const RETURN_VALUE: Reg = Reg::Rax;

pub(super) fn reg_name(reg: Reg) -> &'static str {
    match reg {
        Reg::Rax => "rax",
        Reg::Rcx => "rcx",
        Reg::Rdx => "rdx",
        Reg::Rbx => "rbx",
        Reg::Rbp => "rbp",
        Reg::Rsi => "rsi",
        Reg::Rdi => "rdi",
        Reg::R8 => "r8",
        Reg::R9 => "r9",
        Reg::R10 => "r10",
        Reg::R11 => "r11",
        Reg::R12 => "r12",
        Reg::R13 => "r13",
        Reg::R14 => "r14",
        Reg::R15 => "r15",
    }
}

pub const STACK_ALIGN: usize = 16;

/// `call` pushes the address of the next instruction; one byte back is
/// always inside the call.
pub const RETURN_ADDRESS_ADJUSTMENT: usize = 1;

bitflags::bitflags! {
    /// Which registers a [`PInvokeTransitionFrame`] spilled, and what kind of
    /// value the return register holds when the frame was built by a hijack
    /// trampoline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransitionFrameFlags: u64 {
        const SAVE_RBX = 0x0000_0001;
        const SAVE_RSI = 0x0000_0002;
        const SAVE_RDI = 0x0000_0004;
        /// Never set: methods with transitions always have a frame pointer.
        const SAVE_RBP = 0x0000_0008;
        const SAVE_R12 = 0x0000_0010;
        const SAVE_R13 = 0x0000_0020;
        const SAVE_R14 = 0x0000_0040;
        const SAVE_R15 = 0x0000_0080;
        const SAVE_RAX = 0x0000_0100;
        const SAVE_RCX = 0x0000_0200;
        const SAVE_RDX = 0x0000_0400;
        const SAVE_R8 = 0x0000_0800;
        const SAVE_R9 = 0x0000_1000;
        const SAVE_R10 = 0x0000_2000;
        const SAVE_R11 = 0x0000_4000;
        const SAVE_RSP = 0x0000_8000;
        const RAX_IS_GCREF = 0x0001_0000;
        const RAX_IS_BYREF = 0x0002_0000;
        const THREAD_ABORT = 0x0004_0000;

        const SAVE_ALL_PRESERVED = Self::SAVE_RBX.bits()
            | Self::SAVE_RSI.bits()
            | Self::SAVE_RDI.bits()
            | Self::SAVE_R12.bits()
            | Self::SAVE_R13.bits()
            | Self::SAVE_R14.bits()
            | Self::SAVE_R15.bits();
        const SAVE_ALL_SCRATCH = Self::SAVE_RAX.bits()
            | Self::SAVE_RCX.bits()
            | Self::SAVE_RDX.bits()
            | Self::SAVE_R8.bits()
            | Self::SAVE_R9.bits()
            | Self::SAVE_R10.bits()
            | Self::SAVE_R11.bits();
    }
}

impl TransitionFrameFlags {
    pub const SAVE_FP: Self = Self::SAVE_RBP;
    pub const SAVE_SP: Self = Self::SAVE_RSP;
    pub const RETURN_IS_GCREF: Self = Self::RAX_IS_GCREF;
    pub const RETURN_IS_BYREF: Self = Self::RAX_IS_BYREF;
}

/// Order in which flagged registers follow the fixed part of a
/// [`PInvokeTransitionFrame`].
pub const TRANSITION_FRAME_SAVE_ORDER: &[(TransitionFrameFlags, SavedSlot)] = &[
    (TransitionFrameFlags::SAVE_RBX, SavedSlot::Reg(Reg::Rbx)),
    (TransitionFrameFlags::SAVE_RSI, SavedSlot::Reg(Reg::Rsi)),
    (TransitionFrameFlags::SAVE_RDI, SavedSlot::Reg(Reg::Rdi)),
    (TransitionFrameFlags::SAVE_R12, SavedSlot::Reg(Reg::R12)),
    (TransitionFrameFlags::SAVE_R13, SavedSlot::Reg(Reg::R13)),
    (TransitionFrameFlags::SAVE_R14, SavedSlot::Reg(Reg::R14)),
    (TransitionFrameFlags::SAVE_R15, SavedSlot::Reg(Reg::R15)),
    (TransitionFrameFlags::SAVE_RSP, SavedSlot::Sp),
    (TransitionFrameFlags::SAVE_RAX, SavedSlot::Reg(Reg::Rax)),
    (TransitionFrameFlags::SAVE_RCX, SavedSlot::Reg(Reg::Rcx)),
    (TransitionFrameFlags::SAVE_RDX, SavedSlot::Reg(Reg::Rdx)),
    (TransitionFrameFlags::SAVE_R8, SavedSlot::Reg(Reg::R8)),
    (TransitionFrameFlags::SAVE_R9, SavedSlot::Reg(Reg::R9)),
    (TransitionFrameFlags::SAVE_R10, SavedSlot::Reg(Reg::R10)),
    (TransitionFrameFlags::SAVE_R11, SavedSlot::Reg(Reg::R11)),
];

/// Record written by generated code (or a hijack trampoline) when control
/// leaves managed code. The registers selected by `flags` follow it in
/// [`TRANSITION_FRAME_SAVE_ORDER`].
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

/// An operating system thread context, reduced to what the unwinder reads.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct NativeContext {
    pub rax: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rbx: usize,
    pub rsp: usize,
    pub rbp: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
    pub rip: usize,
}

impl NativeContext {
    pub fn ip(&self) -> usize {
        self.rip
    }

    pub fn sp(&self) -> usize {
        self.rsp
    }
}

pub(crate) unsafe fn seed_from_native_context(regs: &mut RegisterSet, ctx: NonNull<NativeContext>) {
    regs.set_location(Reg::Rax, field_ptr!(ctx, rax));
    regs.set_location(Reg::Rcx, field_ptr!(ctx, rcx));
    regs.set_location(Reg::Rdx, field_ptr!(ctx, rdx));
    regs.set_location(Reg::Rbx, field_ptr!(ctx, rbx));
    regs.set_location(Reg::Rbp, field_ptr!(ctx, rbp));
    regs.set_location(Reg::Rsi, field_ptr!(ctx, rsi));
    regs.set_location(Reg::Rdi, field_ptr!(ctx, rdi));
    regs.set_location(Reg::R8, field_ptr!(ctx, r8));
    regs.set_location(Reg::R9, field_ptr!(ctx, r9));
    regs.set_location(Reg::R10, field_ptr!(ctx, r10));
    regs.set_location(Reg::R11, field_ptr!(ctx, r11));
    regs.set_location(Reg::R12, field_ptr!(ctx, r12));
    regs.set_location(Reg::R13, field_ptr!(ctx, r13));
    regs.set_location(Reg::R14, field_ptr!(ctx, r14));
    regs.set_location(Reg::R15, field_ptr!(ctx, r15));
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use super::Fp128;

        pub type PreservedFloat = Fp128;
        pub const PRESERVED_FLOAT_COUNT: usize = 10;

        /// Callee-scratch argument homes the Windows ABI reserves below every
        /// call.
        pub const THROW_SITE_OUTGOING_SCRATCH: usize = 0x20;

        pub const FUNCLET_PRESERVED_REGS: &[Reg] = &[
            Reg::Rbp, Reg::Rdi, Reg::Rsi, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15,
        ];

        /// Register state saved by the throw helpers and by thread suspension.
        #[repr(C)]
        #[derive(Debug, Default, Clone)]
        pub struct PalLimitedContext {
            pub ip: usize,
            pub rsp: usize,
            pub rbp: usize,
            pub rdi: usize,
            pub rsi: usize,
            pub rax: usize,
            pub rbx: usize,
            pub r12: usize,
            pub r13: usize,
            pub r14: usize,
            pub r15: usize,
            pub xmm: [Fp128; PRESERVED_FLOAT_COUNT],
        }

        pub(crate) unsafe fn seed_from_limited_context(
            regs: &mut RegisterSet,
            ctx: NonNull<PalLimitedContext>,
        ) {
            unsafe { seed_preserved_from_limited_context(regs, ctx) };
            // SAFETY: the caller guarantees `ctx` is readable.
            regs.floats = unsafe { (*ctx.as_ptr()).xmm };
            regs.set_location(Reg::Rax, field_ptr!(ctx, rax));
            for reg in [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9, Reg::R10, Reg::R11] {
                regs.clear_location(reg);
            }
        }

        pub(crate) unsafe fn seed_preserved_from_limited_context(
            regs: &mut RegisterSet,
            ctx: NonNull<PalLimitedContext>,
        ) {
            regs.set_location(Reg::Rbp, field_ptr!(ctx, rbp));
            regs.set_location(Reg::Rdi, field_ptr!(ctx, rdi));
            regs.set_location(Reg::Rsi, field_ptr!(ctx, rsi));
            regs.set_location(Reg::Rbx, field_ptr!(ctx, rbx));
            regs.set_location(Reg::R12, field_ptr!(ctx, r12));
            regs.set_location(Reg::R13, field_ptr!(ctx, r13));
            regs.set_location(Reg::R14, field_ptr!(ctx, r14));
            regs.set_location(Reg::R15, field_ptr!(ctx, r15));
        }

        //                                      ChildSP+000 CallerSP-080 argument homes
        //                                      ChildSP+020 CallerSP-060 xmm0-xmm3
        //                                      ChildSP+060 CallerSP-020 return block
        //                                      ChildSP+070 CallerSP-010 padding
        //                                      ChildSP+078 CallerSP-008 return address
        pub(super) const UNIVERSAL_TRANSITION_FRAME: Option<&[FrameSlot]> = Some(&[
            FrameSlot::Skip(4),
            FrameSlot::Skip(8),
            FrameSlot::ConservativeLowerBound,
            FrameSlot::Skip(2),
            FrameSlot::Skip(1),
            FrameSlot::ReturnAddress,
        ]);

        const FUNCLET_SAVED_REGS_AND_RETURN: [FrameSlot; 9] = [
            FrameSlot::Reg(Reg::Rbp),
            FrameSlot::Reg(Reg::Rdi),
            FrameSlot::Reg(Reg::Rsi),
            FrameSlot::Reg(Reg::Rbx),
            FrameSlot::Reg(Reg::R12),
            FrameSlot::Reg(Reg::R13),
            FrameSlot::Reg(Reg::R14),
            FrameSlot::Reg(Reg::R15),
            FrameSlot::ReturnAddress,
        ];

        const fn funclet_frame(locals: usize) -> [FrameSlot; 21] {
            let mut slots = [FrameSlot::Skip(0); 21];
            slots[0] = FrameSlot::Skip(4);
            let mut i = 0;
            while i < PRESERVED_FLOAT_COUNT {
                slots[1 + i] = FrameSlot::Float;
                i += 1;
            }
            slots[11] = FrameSlot::Skip(locals);
            let mut j = 0;
            while j < FUNCLET_SAVED_REGS_AND_RETURN.len() {
                slots[12 + j] = FUNCLET_SAVED_REGS_AND_RETURN[j];
                j += 1;
            }
            slots
        }

        static CATCH_FUNCLET_FRAME: [FrameSlot; 21] = funclet_frame(3);
        static FINALLY_FUNCLET_FRAME: [FrameSlot; 21] = funclet_frame(1);
        static FILTER_FUNCLET_FRAME: [FrameSlot; 21] = funclet_frame(1);
    } else {
        pub type PreservedFloat = u64;
        pub const PRESERVED_FLOAT_COUNT: usize = 0;

        pub const THROW_SITE_OUTGOING_SCRATCH: usize = 0;

        pub const FUNCLET_PRESERVED_REGS: &[Reg] = &[
            Reg::Rbp, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15,
        ];

        /// Register state saved by the throw helpers and by thread suspension.
        #[repr(C)]
        #[derive(Debug, Default, Clone)]
        pub struct PalLimitedContext {
            pub ip: usize,
            pub rsp: usize,
            pub rbp: usize,
            pub rax: usize,
            pub rbx: usize,
            pub rdx: usize,
            pub r12: usize,
            pub r13: usize,
            pub r14: usize,
            pub r15: usize,
        }

        pub(crate) unsafe fn seed_from_limited_context(
            regs: &mut RegisterSet,
            ctx: NonNull<PalLimitedContext>,
        ) {
            unsafe { seed_preserved_from_limited_context(regs, ctx) };
            regs.set_location(Reg::Rax, field_ptr!(ctx, rax));
            regs.set_location(Reg::Rdx, field_ptr!(ctx, rdx));
            for reg in [
                Reg::Rcx, Reg::Rsi, Reg::Rdi, Reg::R8, Reg::R9, Reg::R10, Reg::R11,
            ] {
                regs.clear_location(reg);
            }
        }

        pub(crate) unsafe fn seed_preserved_from_limited_context(
            regs: &mut RegisterSet,
            ctx: NonNull<PalLimitedContext>,
        ) {
            regs.set_location(Reg::Rbp, field_ptr!(ctx, rbp));
            regs.set_location(Reg::Rbx, field_ptr!(ctx, rbx));
            regs.set_location(Reg::R12, field_ptr!(ctx, r12));
            regs.set_location(Reg::R13, field_ptr!(ctx, r13));
            regs.set_location(Reg::R14, field_ptr!(ctx, r14));
            regs.set_location(Reg::R15, field_ptr!(ctx, r15));
        }

        //                                      ChildSP+000 CallerSP-0D0 xmm0-xmm7
        //                                      ChildSP+080 CallerSP-050 return block
        //                                      ChildSP+090 CallerSP-040 rdi,rsi,rcx,rdx,r8,r9
        //                                      ChildSP+0C0 CallerSP-010 padding
        //                                      ChildSP+0C8 CallerSP-008 return address
        pub(super) const UNIVERSAL_TRANSITION_FRAME: Option<&[FrameSlot]> = Some(&[
            FrameSlot::Skip(16),
            FrameSlot::ConservativeLowerBound,
            FrameSlot::Skip(2),
            FrameSlot::Skip(6),
            FrameSlot::Skip(1),
            FrameSlot::ReturnAddress,
        ]);

        const fn funclet_frame(locals: usize) -> [FrameSlot; 8] {
            [
                FrameSlot::Skip(locals),
                FrameSlot::Reg(Reg::Rbp),
                FrameSlot::Reg(Reg::Rbx),
                FrameSlot::Reg(Reg::R12),
                FrameSlot::Reg(Reg::R13),
                FrameSlot::Reg(Reg::R14),
                FrameSlot::Reg(Reg::R15),
                FrameSlot::ReturnAddress,
            ]
        }

        // Six locals plus alignment for catch, three locals for finally, and
        // just the alignment word for filters.
        static CATCH_FUNCLET_FRAME: [FrameSlot; 8] = funclet_frame(7);
        static FINALLY_FUNCLET_FRAME: [FrameSlot; 8] = funclet_frame(3);
        static FILTER_FUNCLET_FRAME: [FrameSlot; 8] = funclet_frame(1);
    }
}

impl PalLimitedContext {
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn sp(&self) -> usize {
        self.rsp
    }

    pub fn fp(&self) -> usize {
        self.rbp
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.rsp = sp;
    }

    pub fn set_fp(&mut self, fp: usize) {
        self.rbp = fp;
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

pub(super) fn funclet_invoke_frame(kind: FuncletKind) -> Option<&'static [FrameSlot]> {
    Some(match kind {
        FuncletKind::Catch => &CATCH_FUNCLET_FRAME,
        FuncletKind::Finally => &FINALLY_FUNCLET_FRAME,
        FuncletKind::Filter => &FILTER_FUNCLET_FRAME,
    })
}
