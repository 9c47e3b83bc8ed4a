//! A code manager for frame-pointer-compiled code described by method tables.
//!
//! Method tables are plain data ([`MethodDesc`]) that can be written by hand
//! or loaded with serde, validated into a [`FrameTable`], and served to the
//! unwinder by a [`FrameTableCodeManager`]. The [`synthetic`] module lays out
//! stacks that follow the same frame conventions so that complete walks can
//! be run without a code generator.

mod code_manager;
pub mod synthetic;
mod table;

pub use code_manager::{FrameTableCodeManager, TableRegistry};
pub use synthetic::{
    BuildError, FrameHandle, InvokeKind, NATIVE_RETURN_ADDRESS, StackBuilder, StackEntry,
    SyntheticStack, standard_thunk_table,
};
pub use table::{
    FrameTable, Method, MethodDesc, MethodKind, ReturnKind, Root, SafePoint, SafePointDesc,
    TableError,
};
