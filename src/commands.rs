//! The module for the `mrt` CLI commands.

mod classify;
mod config;
mod walk;

pub use self::{classify::*, config::*, walk::*};
