// src/fingerprint/mod.rs

//! Fingerprints: deciding whether a compiled task needs to run at all.
//!
//! - [`store`] persists one fingerprint file per task key under the cache
//!   root, with atomic writes that preserve mtimes when nothing changed.
//! - [`checker`] implements the checksum / timestamp / status up-to-date
//!   decisions.

pub mod checker;
pub mod store;

pub use checker::{
    checksum_of, expand_globs, is_up_to_date, newest_mtime, persist, timestamp_of, Fingerprint,
};
pub use store::{fingerprint_key, FingerprintStore};
