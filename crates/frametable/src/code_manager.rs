use crate::table::{FrameTable, Method, MethodKind, Root};
use core::ptr::NonNull;
use mrt_unwinder::{
    CodeManager, CodeRegistry, GcRefKind, GcRootSink, MethodInfo, Reg, RegisterSet, RootFlags,
    TransitionFrameRef, UnwindError, UnwindFlags,
};

const W: usize = size_of::<usize>();

/// Code manager for code compiled with a frame pointer chain.
///
/// Every frame is laid out the same way:
///
/// ```text
///   fp + 2W   caller's stack pointer
///   fp + W    return address
///   fp        caller's frame pointer
///   fp - W    establisher fp (funclets) or transition frame (reverse P/Invoke)
///   ...       locals
///   fp - frame_size = sp
/// ```
#[derive(Debug)]
pub struct FrameTableCodeManager {
    table: FrameTable,
}

impl FrameTableCodeManager {
    pub fn new(table: FrameTable) -> FrameTableCodeManager {
        FrameTableCodeManager { table }
    }

    /// Code managers live for the rest of the process once registered.
    pub fn leak(self) -> &'static FrameTableCodeManager {
        Box::leak(Box::new(self))
    }

    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    fn method(&self, info: &MethodInfo) -> Option<&Method> {
        self.table.method(info.opaque[0])
    }
}

// SAFETY: every location handed out is derived from the frame pointer chain of
// the frame described by the register set.
unsafe impl CodeManager for FrameTableCodeManager {
    fn find_method_info(&self, pc: usize) -> Option<MethodInfo> {
        let (index, method) = self.table.lookup(pc)?;
        Some(MethodInfo {
            start: method.start,
            opaque: [index, 0, 0, 0],
        })
    }

    unsafe fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        flags: UnwindFlags,
        regs: &mut RegisterSet,
    ) -> Result<Option<TransitionFrameRef>, UnwindError> {
        let pc = regs.ip();
        let method = self.method(info).ok_or(UnwindError::UnwindFailed { pc })?;
        let fp = unsafe { regs.fp() };
        let fp_slot = NonNull::new(fp as *mut usize).ok_or(UnwindError::UnwindFailed { pc })?;

        let mut previous = None;
        if method.kind == MethodKind::ReversePinvoke {
            // SAFETY: reverse P/Invoke frames keep the native caller's
            // transition frame right below the frame pointer.
            let raw = unsafe { *((fp - W) as *const usize) };
            let frame = TransitionFrameRef::from_raw(raw).ok_or(UnwindError::UnwindFailed { pc })?;
            if flags.contains(UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME) {
                return Ok(Some(frame));
            }
            previous = Some(frame);
        }

        // SAFETY: the return address sits right above the saved frame pointer.
        let return_address = unsafe { *((fp + W) as *const usize) };
        regs.set_location(Reg::FP, fp_slot);
        regs.set_ip(return_address);
        regs.set_sp(fp + 2 * W);
        Ok(previous)
    }

    fn is_funclet(&self, info: &MethodInfo) -> bool {
        self.method(info)
            .is_some_and(|m| m.kind == MethodKind::Funclet)
    }

    unsafe fn get_frame_pointer(&self, info: &MethodInfo, regs: &RegisterSet) -> usize {
        let fp = unsafe { regs.fp() };
        if self.is_funclet(info) && fp != 0 {
            // SAFETY: funclets keep their establisher frame below fp.
            unsafe { *((fp - W) as *const usize) }
        } else {
            fp
        }
    }

    unsafe fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        safe_point: usize,
        regs: &RegisterSet,
        sink: &mut dyn GcRootSink,
        is_active_frame: bool,
    ) {
        let Some(method) = self.method(info) else {
            return;
        };
        let Some(sp) = method.safe_point_at(safe_point) else {
            log::trace!(
                "no safe point at {safe_point:#x} in `{}` (active = {is_active_frame})",
                method.name
            );
            return;
        };
        let fp = unsafe { regs.fp() };
        for root in &sp.roots {
            match *root {
                Root::Slot {
                    fp_offset,
                    interior,
                } => {
                    let addr = fp.wrapping_add_signed(fp_offset);
                    if let Some(loc) = NonNull::new(addr as *mut usize) {
                        let flags = if interior {
                            RootFlags::INTERIOR
                        } else {
                            RootFlags::empty()
                        };
                        sink.report(loc, flags);
                    }
                }
                Root::Reg(reg) => {
                    if let Some(loc) = regs.location(reg) {
                        sink.report(loc, RootFlags::empty());
                    }
                }
            }
        }
    }

    unsafe fn get_return_address_hijack_info(
        &self,
        info: &MethodInfo,
        regs: &RegisterSet,
    ) -> Option<(NonNull<usize>, GcRefKind)> {
        let method = self.method(info)?;
        // Funclets return into a dispatch thunk, reverse P/Invoke methods
        // into native code. Neither is hijackable.
        if method.kind != MethodKind::Normal {
            return None;
        }
        let fp = unsafe { regs.fp() };
        if fp == 0 {
            return None;
        }
        let slot = NonNull::new((fp + W) as *mut usize)?;
        Some((slot, method.returns))
    }

    unsafe fn get_conservative_upper_bound_for_outgoing_args(
        &self,
        info: &MethodInfo,
        regs: &RegisterSet,
    ) -> usize {
        let outgoing = self.method(info).map_or(0, |m| m.outgoing_args);
        regs.sp() + outgoing
    }

    fn remap_hardware_fault_to_gc_safe_point(&self, info: &MethodInfo, pc: usize) -> usize {
        self.method(info)
            .and_then(|m| m.next_safe_point(pc).map(|sp| m.start + sp.offset))
            .unwrap_or(pc)
    }
}

/// A registry holding exactly one frame-table module.
#[derive(Debug, Clone, Copy)]
pub struct TableRegistry(pub &'static FrameTableCodeManager);

impl CodeRegistry for TableRegistry {
    fn is_managed(&self, pc: usize) -> bool {
        self.0.table.lookup(pc).is_some()
    }

    fn code_manager_for_address(&self, pc: usize) -> Option<&'static dyn CodeManager> {
        let cm: &'static dyn CodeManager = self.0;
        self.is_managed(pc).then_some(cm)
    }
}
