//! Recognition of the runtime's hand-written assembly thunks.
//!
//! The walker needs to know when a return address points into one of a small
//! set of thunks whose frames cannot be unwound by any code manager. The
//! thunks are identified by the exact return addresses their calls leave on
//! the stack, which the runtime installs once at startup.

use crate::{CodeRegistry, FuncletKind};
use std::sync::OnceLock;
use thiserror::Error;

/// Return addresses of the well-known thunks. A zero entry never matches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThunkTable {
    /// Return point of the universal transition thunk.
    pub universal_transition_return: usize,
    /// Return point of the universal transition thunk's debug-step variant.
    pub universal_transition_return_debug_step_tail_call: usize,
    /// Return point of the software throw helper.
    pub throw_ex2: usize,
    /// Return point of the hardware exception throw helper.
    pub throw_hw_ex2: usize,
    /// Return point of the rethrow helper.
    pub rethrow2: usize,
    /// Return point of the catch funclet invoke thunk.
    pub call_catch_funclet2: usize,
    /// Return point of the finally funclet invoke thunk.
    pub call_finally_funclet2: usize,
    /// Return point of the filter funclet invoke thunk.
    pub call_filter_funclet2: usize,
}

/// Where a return address points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnAddressCategory {
    /// Ordinary managed code (or anything that is not a known thunk).
    InManagedCode,
    /// The universal transition thunk.
    InUniversalTransitionThunk,
    /// One of the throw helpers.
    InThrowSiteThunk,
    /// The catch or finally funclet invoke thunk.
    InFuncletInvokeThunk,
    /// The filter funclet invoke thunk.
    InFilterFuncletInvokeThunk,
}

/// The thunk table was already installed with different addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a different thunk table is already installed")]
pub struct AlreadyInstalled;

static THUNKS: OnceLock<ThunkTable> = OnceLock::new();

/// Install the process-wide thunk table.
///
/// Installing the same table again is a no-op.
pub fn install(table: ThunkTable) -> Result<(), AlreadyInstalled> {
    let installed = THUNKS.get_or_init(|| table);
    if *installed == table {
        log::debug!("thunk table installed: {table:x?}");
        Ok(())
    } else {
        Err(AlreadyInstalled)
    }
}

/// The installed thunk table, if any.
pub fn installed() -> Option<&'static ThunkTable> {
    THUNKS.get()
}

/// Classify an unadjusted return address against the installed table.
///
/// Before a table is installed every address is ordinary managed code.
pub fn classify(addr: usize) -> ReturnAddressCategory {
    match THUNKS.get() {
        Some(table) => table.classify(addr),
        None => ReturnAddressCategory::InManagedCode,
    }
}

impl ThunkTable {
    /// Classify an unadjusted return address against this table.
    pub fn classify(&self, addr: usize) -> ReturnAddressCategory {
        let is = |thunk: usize| thunk != 0 && thunk == addr;
        if is(self.universal_transition_return)
            || is(self.universal_transition_return_debug_step_tail_call)
        {
            ReturnAddressCategory::InUniversalTransitionThunk
        } else if is(self.throw_ex2) || is(self.throw_hw_ex2) || is(self.rethrow2) {
            ReturnAddressCategory::InThrowSiteThunk
        } else if is(self.call_catch_funclet2) || is(self.call_finally_funclet2) {
            ReturnAddressCategory::InFuncletInvokeThunk
        } else if is(self.call_filter_funclet2) {
            ReturnAddressCategory::InFilterFuncletInvokeThunk
        } else {
            ReturnAddressCategory::InManagedCode
        }
    }

    /// Which funclet invoke thunk `addr` returns into, if any.
    pub fn funclet_kind(&self, addr: usize) -> Option<FuncletKind> {
        if addr == 0 {
            None
        } else if addr == self.call_catch_funclet2 {
            Some(FuncletKind::Catch)
        } else if addr == self.call_finally_funclet2 {
            Some(FuncletKind::Finally)
        } else if addr == self.call_filter_funclet2 {
            Some(FuncletKind::Filter)
        } else {
            None
        }
    }
}

/// Which funclet invoke thunk `addr` returns into, if any.
pub fn funclet_kind(addr: usize) -> Option<FuncletKind> {
    THUNKS.get().and_then(|table| table.funclet_kind(addr))
}

/// Whether `category` is a thunk that never takes part in exception
/// dispatch. Sequences of these can be stacked on top of each other.
pub fn is_non_eh_thunk(category: ReturnAddressCategory) -> bool {
    matches!(category, ReturnAddressCategory::InUniversalTransitionThunk)
}

/// Whether `addr` is a return address a hijack may target.
///
/// Non-EH thunks call ordinary managed code. Throw helpers call managed code
/// that never returns, so a hijack placed there never fires but is harmless.
pub fn is_valid_return_address(addr: usize, registry: &dyn CodeRegistry) -> bool {
    let category = classify(addr);
    is_non_eh_thunk(category)
        || category == ReturnAddressCategory::InThrowSiteThunk
        || registry.is_managed(addr)
}
