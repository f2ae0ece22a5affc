// src/engine/dedup.rs

//! Deduplication of task executions.
//!
//! Each fingerprint key maps to a completion cell. The first caller runs the
//! task body inside the cell's initializer; concurrent and later callers
//! await the same cell and observe the stored result. This is what makes
//! `run: once` and `run: when_changed` execute at most once per Executor
//! lifetime and key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::errors::TaskError;

/// Result stored in a completion cell. Errors are shared so every waiter can
/// observe the original failure.
pub type SharedResult = Result<(), Arc<TaskError>>;

/// Registry of completion cells, keyed by fingerprint key.
#[derive(Default)]
pub struct DedupMap {
    cells: Mutex<HashMap<String, Arc<OnceCell<SharedResult>>>>,
}

impl DedupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the completion cell for a key.
    pub fn cell(&self, key: &str) -> Arc<OnceCell<SharedResult>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}
