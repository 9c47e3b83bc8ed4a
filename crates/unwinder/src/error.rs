use thiserror::Error;

/// A structural violation detected while unwinding.
///
/// Every variant means the walker's model of the stack no longer matches the
/// stack itself. None of them are recoverable: the public iterator surface
/// routes them to [`fail_fast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnwindError {
    /// The code manager could not unwind the current frame.
    #[error("code manager failed to unwind the frame at {pc:#x}")]
    UnwindFailed {
        /// Control PC of the frame being unwound.
        pc: usize,
    },

    /// An address believed to be managed has no code manager, or the code
    /// manager does not recognize it.
    #[error("no code manager for managed address {pc:#x}")]
    NoCodeManager {
        /// The address that could not be resolved.
        pc: usize,
    },

    /// A thunk was found where it cannot legally appear.
    #[error("unexpected assembly thunk: {0}")]
    UnexpectedThunk(&'static str),

    /// A thunk-reported conservative range broke its ordering rules.
    #[error("conservative stack range out of order: {0}")]
    ConservativeRange(&'static str),

    /// A skipped funclet parent does not share the leaf funclet's frame.
    #[error("funclet collapse target mismatch: expected fp {expected:#x}, found {found:#x}")]
    CollapseMismatch {
        /// Frame pointer of the already reported funclet.
        expected: usize,
        /// Frame pointer of the frame being skipped.
        found: usize,
    },

    /// A skipped funclet parent carried a conservative range, which would be
    /// dropped without being reported.
    #[error("funclet collapse would drop a conservative stack range")]
    CollapseDropsRange,

    /// An exception dispatch walk met a first-pass exception record.
    #[error("EH stack walk collided with a first-pass exception record")]
    FirstPassCollision,

    /// A walk expected an exception record at a collision point and there was
    /// none.
    #[error("stack walk collided with a missing exception record")]
    MissingExInfo,

    /// A walk tried to unwind out of a native frame.
    #[error("cannot unwind out of a native frame")]
    NativeFrame,

    /// A throw-site unwind did not land in managed code.
    #[error("unwind from throw site thunk landed outside managed code at {pc:#x}")]
    ThrowSiteNotManaged {
        /// The recovered instruction pointer.
        pc: usize,
    },

    /// A walk was requested for a thread that has no seed to walk from.
    #[error("thread is not suspended at a walkable point")]
    ThreadNotSuspended,

    /// The path is not implemented for this architecture.
    #[error("not yet implemented on this architecture: {0}")]
    NotYetImplemented(&'static str),
}

/// Logs a structural unwind violation and terminates the process.
#[cold]
pub fn fail_fast(err: UnwindError) -> ! {
    log::error!("fatal stack walk error: {err}");
    std::process::abort()
}
