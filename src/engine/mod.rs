// src/engine/mod.rs

//! The task execution engine.
//!
//! This module ties together:
//! - compilation of calls into concrete plans
//! - the dedup registry backing `run: once` / `run: when_changed`
//! - parallel dependency scheduling with sibling cancellation
//! - the concurrency semaphore over the cmds phase
//! - deferred cleanup that survives failure and cancellation
//! - fingerprint persistence after successful runs

pub mod dedup;
pub mod executor;

pub use dedup::{DedupMap, SharedResult};
pub use executor::{Executor, ExecutorOptions, TempDirs};
