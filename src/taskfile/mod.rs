// src/taskfile/mod.rs

//! Taskfile data model, loading and merging.
//!
//! Responsibilities:
//! - Define the YAML-backed data model (`model.rs`).
//! - Recursively load and merge a taskfile hierarchy, detecting include
//!   cycles and namespacing included tasks (`loader.rs`).
//! - Fetch and cache remote taskfiles (`remote.rs`).
//! - Parse root-level dotenv files (`dotenv.rs`).

pub mod dotenv;
pub mod loader;
pub mod model;
pub mod remote;

pub use loader::{
    load, resolve_relative, LoadOptions, LoadedTaskfile, Source, TaskDefinition,
    SUPPORTED_FILE_NAMES,
};
pub use model::{
    Cmd, CmdOp, Dep, ForSpec, Include, Method, OutputStyle, Platform, Precondition,
    RequiredVar, Requires, RunPolicy, Task, Taskfile, Var, Vars,
};
pub use remote::{RemoteCache, RemotePolicy};
