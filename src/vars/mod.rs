// src/vars/mod.rs

//! Variable environments and string interpolation.
//!
//! - [`scope`] holds the ordered, layered mapping from name to typed value
//!   used while compiling a task.
//! - [`template`] expands `${...}` interpolation expressions against a scope.

pub mod scope;
pub mod template;

pub use scope::{Scope, Value};
pub use template::{expand, expand_opt, expand_vec};
