//! Synthetic stacks.
//!
//! A [`StackBuilder`] lays out frames in a heap buffer exactly as compiled
//! code and the runtime's thunks would lay them out on a real stack, growing
//! downwards from the outermost frame. The result can be walked by the
//! unwinder with a [`FrameTableCodeManager`](crate::FrameTableCodeManager)
//! registered for the same [`FrameTable`].

use crate::table::{FrameTable, Method, MethodKind, TableError};
use core::ptr::NonNull;
use mrt_unwinder::arch::{
    self, FrameSlot, PInvokeTransitionFrame, SavedSlot, TRANSITION_FRAME_SAVE_ORDER,
};
use mrt_unwinder::{
    ExInfo, ExKind, FuncletKind, PalLimitedContext, Reg, ThunkTable, TransitionFrameFlags,
    TransitionFrameRef, UnwindError,
};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

const W: usize = size_of::<usize>();

/// Return address left behind by native code calling into managed code.
pub const NATIVE_RETURN_ADDRESS: usize = 0x7e00_0000;

/// Thunk return addresses used by synthetic stacks. They lie outside any
/// frame table.
pub fn standard_thunk_table() -> ThunkTable {
    ThunkTable {
        universal_transition_return: 0x7f00_0010,
        universal_transition_return_debug_step_tail_call: 0x7f00_0020,
        throw_ex2: 0x7f00_0110,
        throw_hw_ex2: 0x7f00_0120,
        rethrow2: 0x7f00_0130,
        call_catch_funclet2: 0x7f00_0210,
        call_finally_funclet2: 0x7f00_0220,
        call_filter_funclet2: 0x7f00_0230,
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Unwind(#[from] UnwindError),
    #[error("synthetic stack overflow")]
    StackOverflow,
    #[error("offset {offset:#x} lies outside method `{method}`")]
    OffsetOutOfRange { method: String, offset: usize },
    #[error("`{method}` is a {kind:?} method and cannot be pushed this way")]
    WrongKind { method: String, kind: MethodKind },
    #[error("no frame {0} to own a funclet")]
    UnknownOwner(usize),
}

/// A zeroed, word-aligned buffer standing in for a thread's stack.
pub struct SyntheticStack {
    base: NonNull<usize>,
    words: usize,
}

impl SyntheticStack {
    pub fn new(words: usize) -> SyntheticStack {
        let buf: Box<[usize]> = vec![0; words].into_boxed_slice();
        let base = NonNull::from(Box::leak(buf)).cast::<usize>();
        SyntheticStack { base, words }
    }

    /// Lowest address of the stack.
    pub fn low(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the highest address of the stack.
    pub fn high(&self) -> usize {
        self.low() + self.words * W
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.low() <= addr && addr < self.high()
    }

    fn slot(&self, addr: usize) -> *mut usize {
        assert!(
            self.contains(addr) && addr % W == 0,
            "{addr:#x} is not a stack slot"
        );
        addr as *mut usize
    }

    pub fn read(&self, addr: usize) -> usize {
        // SAFETY: `slot` checks the address lies inside the buffer.
        unsafe { *self.slot(addr) }
    }

    pub fn write(&self, addr: usize, value: usize) {
        // SAFETY: `slot` checks the address lies inside the buffer.
        unsafe { *self.slot(addr) = value }
    }
}

impl Drop for SyntheticStack {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
        // SAFETY: the buffer was leaked from a boxed slice of this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// A managed frame pushed by a [`StackBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    /// Start of the method the frame belongs to.
    pub method: usize,
    /// The frame's own frame pointer.
    pub fp: usize,
    /// Stack pointer once the frame's locals are allocated.
    pub sp: usize,
    /// Where the frame is executing, or will return to.
    pub pc: usize,
}

/// The funclet invoke thunk to call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeKind {
    Catch,
    Finally,
    Filter,
}

impl From<InvokeKind> for FuncletKind {
    fn from(kind: InvokeKind) -> FuncletKind {
        match kind {
            InvokeKind::Catch => FuncletKind::Catch,
            InvokeKind::Finally => FuncletKind::Finally,
            InvokeKind::Filter => FuncletKind::Filter,
        }
    }
}

/// One step of a serialized stack description, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StackEntry {
    /// Call a method, which then executes at `offset`.
    Call { method: String, offset: usize },
    /// Enter a funclet of the frame pushed `owner`-th.
    Funclet {
        method: String,
        offset: usize,
        owner: usize,
    },
    /// Call a funclet invoke thunk on behalf of the frame pushed `owner`-th.
    CallFunclet { invoke: InvokeKind, owner: usize },
    /// Call through the universal transition thunk.
    UniversalTransition,
    /// Leave managed code through a P/Invoke.
    Pinvoke,
    /// Throw `exception` from the current frame.
    Throw {
        exception: usize,
        #[serde(default, rename = "hardware-fault")]
        hardware_fault: bool,
    },
}

/// Builds a [`SyntheticStack`] one frame at a time.
pub struct StackBuilder<'t> {
    table: &'t FrameTable,
    thunks: ThunkTable,
    stack: SyntheticStack,
    sp: usize,
    fp: usize,
    pc: usize,
    native_transition: Option<NonNull<PInvokeTransitionFrame>>,
    ex_info_head: Option<NonNull<ExInfo>>,
    frames: Vec<FrameHandle>,
}

impl<'t> StackBuilder<'t> {
    pub fn new(table: &'t FrameTable, words: usize) -> StackBuilder<'t> {
        let stack = SyntheticStack::new(words);
        StackBuilder {
            table,
            thunks: standard_thunk_table(),
            sp: stack.high(),
            stack,
            fp: 0,
            pc: NATIVE_RETURN_ADDRESS,
            native_transition: None,
            ex_info_head: None,
            frames: Vec::new(),
        }
    }

    /// Build a whole stack from its description.
    pub fn build(
        table: &'t FrameTable,
        words: usize,
        entries: &[StackEntry],
    ) -> Result<StackBuilder<'t>, BuildError> {
        let mut builder = StackBuilder::new(table, words);
        for entry in entries {
            builder.apply(entry)?;
        }
        Ok(builder)
    }

    pub fn apply(&mut self, entry: &StackEntry) -> Result<(), BuildError> {
        match entry {
            StackEntry::Call { method, offset } => {
                self.call(method, *offset)?;
            }
            StackEntry::Funclet {
                method,
                offset,
                owner,
            } => {
                let owner = self.frame(*owner)?;
                self.funclet(method, *offset, owner)?;
            }
            StackEntry::CallFunclet { invoke, owner } => {
                let owner = self.frame(*owner)?;
                self.call_funclet((*invoke).into(), owner)?;
            }
            StackEntry::UniversalTransition => {
                self.universal_transition()?;
            }
            StackEntry::Pinvoke => {
                self.pinvoke()?;
            }
            StackEntry::Throw {
                exception,
                hardware_fault,
            } => {
                let kind = if *hardware_fault {
                    ExKind::HARDWARE_FAULT
                } else {
                    ExKind::THROW
                };
                self.throw(kind, *exception)?;
            }
        }
        Ok(())
    }

    fn frame(&self, index: usize) -> Result<FrameHandle, BuildError> {
        self.frames
            .get(index)
            .copied()
            .ok_or(BuildError::UnknownOwner(index))
    }

    fn alloc(&mut self, bytes: usize) -> Result<usize, BuildError> {
        let bytes = bytes.next_multiple_of(W);
        let sp = self
            .sp
            .checked_sub(bytes)
            .filter(|sp| *sp >= self.stack.low())
            .ok_or(BuildError::StackOverflow)?;
        self.sp = sp;
        Ok(sp)
    }

    fn push_frame(
        &mut self,
        method: &Method,
        offset: usize,
        special: Option<usize>,
    ) -> Result<FrameHandle, BuildError> {
        if method.start + offset >= method.end {
            return Err(BuildError::OffsetOutOfRange {
                method: method.name.clone(),
                offset,
            });
        }
        let fp = self.alloc(2 * W)?;
        self.stack.write(fp, self.fp);
        self.stack.write(fp + W, self.pc);
        self.alloc(method.frame_size)?;
        if let Some(value) = special {
            self.stack.write(fp - W, value);
        }

        self.fp = fp;
        self.pc = method.start + offset;
        let handle = FrameHandle {
            method: method.start,
            fp,
            sp: self.sp,
            pc: self.pc,
        };
        log::trace!("pushed `{}` {handle:x?}", method.name);
        self.frames.push(handle);
        Ok(handle)
    }

    /// Call `name`, which then executes at `offset` from its start.
    ///
    /// Reverse P/Invoke methods record the transition frame of the last
    /// [`StackBuilder::pinvoke`], or the top-of-stack marker.
    pub fn call(&mut self, name: &str, offset: usize) -> Result<FrameHandle, BuildError> {
        let table = self.table;
        let method = table.by_name(name)?;
        let special = match method.kind {
            MethodKind::Normal => None,
            MethodKind::ReversePinvoke => Some(
                self.native_transition
                    .take()
                    .map_or(TransitionFrameRef::TOP_OF_STACK, |f| f.as_ptr() as usize),
            ),
            MethodKind::Funclet => {
                return Err(BuildError::WrongKind {
                    method: method.name.clone(),
                    kind: method.kind,
                });
            }
        };
        self.push_frame(method, offset, special)
    }

    /// Enter funclet `name` of `owner`.
    pub fn funclet(
        &mut self,
        name: &str,
        offset: usize,
        owner: FrameHandle,
    ) -> Result<FrameHandle, BuildError> {
        let table = self.table;
        let method = table.by_name(name)?;
        if method.kind != MethodKind::Funclet {
            return Err(BuildError::WrongKind {
                method: method.name.clone(),
                kind: method.kind,
            });
        }
        self.push_frame(method, offset, Some(owner.fp))
    }

    /// Write a fixed thunk frame below the current stack pointer and return
    /// its base. Preserved registers spill as zero except the frame pointer.
    fn push_thunk_frame(&mut self, slots: &[FrameSlot]) -> Result<usize, BuildError> {
        let size = slots.iter().map(FrameSlot::size).sum();
        let base = self.alloc(size)?;
        let mut offset = 0;
        for slot in slots {
            match slot {
                FrameSlot::Reg(reg) if *reg == Reg::FP => self.stack.write(base + offset, self.fp),
                FrameSlot::ReturnAddress => self.stack.write(base + offset, self.pc),
                _ => {}
            }
            offset += slot.size();
        }
        Ok(base)
    }

    /// Call through the universal transition thunk. Returns the thunk's
    /// stack pointer.
    pub fn universal_transition(&mut self) -> Result<usize, BuildError> {
        let layout = arch::universal_transition_frame()?;
        let base = self.push_thunk_frame(layout.slots)?;
        self.pc = self.thunks.universal_transition_return;
        Ok(base)
    }

    /// Call a funclet invoke thunk on behalf of `owner`. The thunk loads the
    /// owner's preserved registers, so the funclet runs with the owner's
    /// frame pointer.
    pub fn call_funclet(&mut self, kind: FuncletKind, owner: FrameHandle) -> Result<usize, BuildError> {
        let layout = arch::funclet_invoke_frame(kind)?;
        let base = self.push_thunk_frame(layout.slots)?;
        self.pc = match kind {
            FuncletKind::Catch => self.thunks.call_catch_funclet2,
            FuncletKind::Finally => self.thunks.call_finally_funclet2,
            FuncletKind::Filter => self.thunks.call_filter_funclet2,
        };
        self.fp = owner.fp;
        Ok(base)
    }

    /// Write a transition frame below the current stack pointer.
    ///
    /// Every register `flags` marks as saved spills as zero, except the stack
    /// pointer (`sp`) and the return value register (`return_value`).
    pub fn push_transition_frame(
        &mut self,
        rip: usize,
        fp: usize,
        sp: usize,
        flags: TransitionFrameFlags,
        return_value: usize,
    ) -> Result<NonNull<PInvokeTransitionFrame>, BuildError> {
        let saved = TRANSITION_FRAME_SAVE_ORDER
            .iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .count();
        let base = self.alloc(size_of::<PInvokeTransitionFrame>() + saved * W)?;
        let frame = NonNull::new(base as *mut PInvokeTransitionFrame).ok_or(BuildError::StackOverflow)?;
        // SAFETY: the allocation covers the header and the save area.
        unsafe {
            let f = frame.as_ptr();
            (*f).rip = rip;
            (*f).frame_pointer = fp;
            (*f).thread = 0;
            (*f).flags = flags.bits();
        }

        let mut cursor = base + size_of::<PInvokeTransitionFrame>();
        for (flag, slot) in TRANSITION_FRAME_SAVE_ORDER {
            if !flags.contains(*flag) {
                continue;
            }
            let value = match slot {
                SavedSlot::Sp => sp,
                SavedSlot::Reg(reg) if *reg == Reg::RETURN_VALUE => return_value,
                SavedSlot::Reg(_) => 0,
            };
            self.stack.write(cursor, value);
            cursor += W;
        }
        Ok(frame)
    }

    /// Leave managed code from the current frame through a P/Invoke.
    ///
    /// The next reverse P/Invoke method called records the returned frame.
    pub fn pinvoke(&mut self) -> Result<NonNull<PInvokeTransitionFrame>, BuildError> {
        let (pc, fp, sp) = (self.pc, self.fp, self.sp);
        let frame = self.push_transition_frame(pc, fp, sp, TransitionFrameFlags::SAVE_SP, 0)?;
        // Room for the native callee's own frames.
        self.alloc(8 * W)?;
        self.pc = NATIVE_RETURN_ADDRESS;
        self.native_transition = Some(frame);
        Ok(frame)
    }

    /// Throw from the current frame: lay out the throw helper's frame with
    /// the thrower's context and a fresh first-pass exception record, and
    /// continue in the helper.
    ///
    /// For hardware faults the current PC is the faulting instruction.
    pub fn throw(&mut self, kind: ExKind, exception: usize) -> Result<NonNull<ExInfo>, BuildError> {
        let mut ctx = PalLimitedContext::default();
        ctx.set_ip(self.pc);
        ctx.set_sp(self.sp);
        ctx.set_fp(self.fp);

        let ctx_addr = self.alloc(size_of::<PalLimitedContext>())?;
        let ex_addr = self.alloc(arch::stack_size_of_exinfo())?;
        self.alloc(arch::THROW_SITE_OUTGOING_SCRATCH)?;
        debug_assert_eq!(self.sp + arch::throw_site_context_offset(), ctx_addr);

        let ctx_ptr = NonNull::new(ctx_addr as *mut PalLimitedContext).ok_or(BuildError::StackOverflow)?;
        let ex_ptr = NonNull::new(ex_addr as *mut ExInfo).ok_or(BuildError::StackOverflow)?;
        let mut info = ExInfo::new(ctx_ptr, exception, kind);
        info.prev = self.ex_info_head;
        // SAFETY: both allocations are large enough and word aligned.
        unsafe {
            ctx_ptr.as_ptr().write(ctx);
            ex_ptr.as_ptr().write(info);
        }
        self.ex_info_head = Some(ex_ptr);

        self.pc = if kind.contains(ExKind::HARDWARE_FAULT) {
            self.thunks.throw_hw_ex2
        } else {
            self.thunks.throw_ex2
        };
        Ok(ex_ptr)
    }

    /// The register context of the innermost frame, as if the thread were
    /// interrupted there.
    pub fn context(&self) -> PalLimitedContext {
        let mut ctx = PalLimitedContext::default();
        ctx.set_ip(self.pc);
        ctx.set_sp(self.sp);
        ctx.set_fp(self.fp);
        ctx
    }

    pub fn stack(&self) -> &SyntheticStack {
        &self.stack
    }

    pub fn table(&self) -> &'t FrameTable {
        self.table
    }

    pub fn thunks(&self) -> &ThunkTable {
        &self.thunks
    }

    /// Managed frames pushed so far, outermost first.
    pub fn frames(&self) -> &[FrameHandle] {
        &self.frames
    }

    pub fn ex_info_head(&self) -> Option<NonNull<ExInfo>> {
        self.ex_info_head
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn pc(&self) -> usize {
        self.pc
    }
}
