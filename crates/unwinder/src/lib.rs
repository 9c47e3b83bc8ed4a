//! Stack-walking of ahead-of-time compiled managed code.
//!
//! The walk starts from one of a handful of seeds (a transition frame written
//! when a thread left managed code, a saved register context, or an OS
//! context) and proceeds one logical frame at a time. Ordinary frames are
//! unwound by the [`CodeManager`] that owns the code; the few hand-written
//! runtime thunks that sit between managed frames are recognized by
//! [`thunks::classify`] and unwound here using their fixed frame layouts from
//! [`arch`].
//!
//! While walking, the iterator follows the thread's chain of in-flight
//! exception dispatch records ([`ExInfo`]) so that a GC walk can thread
//! through the exception dispatch machinery transparently and so that frames
//! shared between a funclet and its parent are only reported once.
//!
//! This crate is agnostic to how threads are suspended or how roots are
//! consumed; those concerns live with the runtime and reach the walker
//! through the [`WalkableThread`], [`CodeRegistry`] and [`GcRootSink`]
//! traits.

#[macro_use]
pub mod arch;
mod code_manager;
mod error;
mod exinfo;
mod iterator;
mod regdisplay;
mod roots;
pub mod thunks;
mod transition;

pub use arch::{
    FuncletKind, NativeContext, PInvokeTransitionFrame, PalLimitedContext, Reg,
    TransitionFrameFlags,
};
pub use code_manager::{
    CodeManager, CodeRegistry, GcRefKind, MethodInfo, UnwindFlags, WalkableThread,
};
pub use error::{UnwindError, fail_fast};
pub use exinfo::{ExInfo, ExInfoIter, ExKind, NO_CLAUSE};
pub use iterator::{FrameIterState, StackFrameIterator, WalkFlags};
pub use regdisplay::RegisterSet;
pub use roots::{GcRootSink, RootFlags};
pub use thunks::{ReturnAddressCategory, ThunkTable};
pub use transition::{TransitionFrameRef, WalkSeed};
