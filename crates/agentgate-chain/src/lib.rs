//! Append-only record store with chained SHA-256 fingerprints.
//!
//! The gateway keeps three of these chains (audit, memory, task lineage),
//! each with its own genesis. Records link through `prev_hash`, so any
//! in-place mutation of history is detectable by [`AppendLog::verify`].
//! Redaction is supported without breaking linkage: [`AppendLog::erase`]
//! replaces a record's content with a short digest marker while leaving
//! its `hash` and `prev_hash` untouched.

mod log;
mod record;

pub use log::{AppendLog, ChainError, ListFilter, VerifyReport};
pub use record::{canonical_json, digest, erased_marker, ChainRecord, GENESIS};
