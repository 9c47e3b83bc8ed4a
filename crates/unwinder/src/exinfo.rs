use crate::{FrameIterState, PalLimitedContext};
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Value of [`ExInfo::idx_cur_clause`] when no handler clause is running.
pub const NO_CLAUSE: u32 = u32::MAX;

bitflags::bitflags! {
    /// Kind of an in-flight exception dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExKind: u8 {
        /// A software throw.
        const THROW = 0x1;
        /// A hardware fault converted into an exception.
        const HARDWARE_FAULT = 0x2;
        /// The dispatch was superseded by a newer exception.
        const SUPERSEDED = 0x8;
    }
}

/// One in-flight exception dispatch, allocated on the stack of the thread
/// that threw and linked to the dispatch it interrupted.
///
/// Records are ordered by address: every record sits below (is more recent
/// than) the one in `prev`.
#[repr(C)]
pub struct ExInfo {
    /// The enclosing, older dispatch.
    pub prev: Option<NonNull<ExInfo>>,
    /// Register state captured at the throw site.
    pub ex_context: NonNull<PalLimitedContext>,
    /// The exception object. Reported to the collector as a root.
    pub exception: usize,
    /// Kind of the dispatch.
    pub kind: ExKind,
    /// 1 while searching for a handler, 2 while running handlers.
    pub pass_number: u8,
    /// Clause whose handler funclet is running, or [`NO_CLAUSE`].
    pub idx_cur_clause: u32,
    /// State of the dispatcher's own stack frame iterator, used to resume the
    /// walk in the frame that owns the running funclet.
    pub frame_iter: FrameIterState,
    /// Stack pointer the debugger was last notified about.
    pub notify_debugger_sp: usize,
}

impl ExInfo {
    /// A first-pass record for an exception thrown with the register state in
    /// `ex_context`.
    pub fn new(ex_context: NonNull<PalLimitedContext>, exception: usize, kind: ExKind) -> ExInfo {
        ExInfo {
            prev: None,
            ex_context,
            exception,
            kind,
            pass_number: 1,
            idx_cur_clause: NO_CLAUSE,
            frame_iter: FrameIterState::default(),
            notify_debugger_sp: 0,
        }
    }

    /// Address of this record, used to order it against stack pointers.
    pub fn addr(this: NonNull<ExInfo>) -> usize {
        this.as_ptr() as usize
    }

    /// Whether a handler funclet of this dispatch is running.
    pub fn has_active_clause(&self) -> bool {
        self.idx_cur_clause != NO_CLAUSE
    }
}

impl core::fmt::Debug for ExInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExInfo")
            .field("prev", &self.prev)
            .field("ex_context", &self.ex_context)
            .field("exception", &format_args!("{:#x}", self.exception))
            .field("kind", &self.kind)
            .field("pass_number", &self.pass_number)
            .field("idx_cur_clause", &self.idx_cur_clause)
            .finish_non_exhaustive()
    }
}

/// Iterator over an exception-info chain, innermost first.
pub struct ExInfoIter<'a> {
    next: Option<NonNull<ExInfo>>,
    _marker: PhantomData<&'a ExInfo>,
}

impl<'a> ExInfoIter<'a> {
    /// Iterate the chain starting at `head`.
    ///
    /// # Safety
    ///
    /// Every record reachable from `head` must stay live for `'a`.
    pub unsafe fn new(head: Option<NonNull<ExInfo>>) -> ExInfoIter<'a> {
        ExInfoIter {
            next: head,
            _marker: PhantomData,
        }
    }
}

impl Iterator for ExInfoIter<'_> {
    type Item = NonNull<ExInfo>;

    fn next(&mut self) -> Option<NonNull<ExInfo>> {
        let cur = self.next?;
        // SAFETY: records are live for the iterator's lifetime.
        self.next = unsafe { (*cur.as_ptr()).prev };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_iterates_innermost_first() {
        let mut ctx = PalLimitedContext::default();
        let ctx = NonNull::from(&mut ctx);
        let mut outer = ExInfo::new(ctx, 0x10, ExKind::THROW);
        let mut inner = ExInfo::new(ctx, 0x20, ExKind::HARDWARE_FAULT);
        inner.prev = Some(NonNull::from(&mut outer));

        let head = NonNull::from(&mut inner);
        let exceptions: Vec<usize> = unsafe { ExInfoIter::new(Some(head)) }
            .map(|e| unsafe { e.as_ref().exception })
            .collect();
        assert_eq!(exceptions, [0x20, 0x10]);
    }

    #[test]
    fn new_records_start_in_first_pass() {
        let mut ctx = PalLimitedContext::default();
        let info = ExInfo::new(NonNull::from(&mut ctx), 0, ExKind::THROW);
        assert_eq!(info.pass_number, 1);
        assert!(!info.has_active_clause());
        assert!(!info.kind.contains(ExKind::SUPERSEDED));
    }
}
