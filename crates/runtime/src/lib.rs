//! Runtime support around the stack walker: the thread store and its
//! suspension protocol, return-address hijacking, GC root enumeration and
//! the exception dispatcher's stack-walk entry points.
//!
//! Threads are stopped cooperatively. A thread that is blocked in native
//! code, or parked at a poll point, has published a transition frame and can
//! be walked as is. A thread running managed code is briefly stopped through
//! the [`Pal`] and has the return address of its current frame redirected to
//! a trampoline, which parks it on the way out of that frame.

#![warn(unused_import_braces)]

mod config;
mod eh;
mod gc_roots;
mod hijack;
mod instance;
mod pal;
pub mod sync;
mod thread;
mod thread_store;

pub use crate::config::{
    ConfigError, ENV_CONSERVATIVE_STACK, ENV_RWLOCK_SPIN_COUNT, ENV_SUSPEND_BACKOFF_US,
    RuntimeConfig,
};
pub use crate::eh::{DispatchStep, sfi_init, sfi_next};
pub use crate::gc_roots::{gc_scan_roots, gc_scan_roots_worker};
pub use crate::hijack::SuspendedThread;
pub use crate::instance::{CodeModule, HijackTargets, ModuleList, RuntimeInstance};
pub use crate::pal::{Pal, PalError, PalThreadHandle};
pub use crate::thread::{Thread, ThreadStateFlags};
pub use crate::thread_store::{SuspendGuard, ThreadStore};
