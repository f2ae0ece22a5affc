// src/compile/mod.rs

//! Compilation of task invocations.
//!
//! A [`Call`] (task name + call-site vars) is lowered into a
//! [`CompiledTask`]: every template expanded against the layered scope,
//! `for:` loops unrolled, platform-filtered cmds dropped, the working
//! directory made absolute, and source globs expanded to file lists.
//!
//! - [`compiler`] owns the lowering itself.
//! - [`forloop`] expands `for:` specs into iterations.
//! - [`platform`] matches `platforms:` filters against the current machine.

pub mod compiler;
pub mod forloop;
pub mod platform;

pub use compiler::{
    Call, CompiledCall, CompiledCmd, CompiledOp, CompiledPrecondition, CompiledTask, Compiler,
};
pub use forloop::{iterations, LoopIteration};
pub use platform::{current_arch, current_os, matches_current};
