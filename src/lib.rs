//! The `mrt` command line tools.
//!
//! The commands simulate stacks described by scenario files and show what
//! the runtime's walks make of them.

#![deny(missing_docs)]

pub mod commands;
#[expect(missing_docs, reason = "plain data mirrored from scenario files")]
pub mod scenario;
