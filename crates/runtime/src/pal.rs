//! The platform services the hijack protocol needs from the OS.

use mrt_unwinder::PalLimitedContext;
use thiserror::Error;

/// OS handle of a thread that can be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PalThreadHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PalError {
    #[error("thread handle {0:#x} is not valid")]
    InvalidHandle(usize),
    #[error("failed to suspend thread")]
    SuspendFailed,
    #[error("failed to read the thread's context")]
    ContextUnavailable,
}

/// Operating system hooks.
pub trait Pal {
    /// Stop `thread`, run `callback` on its register context and let it
    /// continue. Changes the callback makes to the context are not written
    /// back; the callback only ever patches the thread's stack.
    fn hijack(
        &self,
        thread: PalThreadHandle,
        callback: &mut dyn FnMut(&mut PalLimitedContext),
    ) -> Result<(), PalError>;
}
