//! Contract-visible error kinds.
//!
//! Most failures in this crate travel as `eyre::Report`s with path and
//! offset context attached at each layer. The kinds a caller may need to
//! branch on are raised as a `StoreError` root cause, reachable through
//! `Report::downcast_ref::<StoreError>()`. Plain I/O failures keep their
//! `std::io::Error` cause. A missing key is a normal result everywhere,
//! never an error.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file header's (t, key_size, value_type_code, element_size) does
    /// not match the tree configuration of this handle. The file belongs to
    /// a differently-typed tree; not recoverable.
    #[error("schema mismatch in '{path}': stored {field}={stored}, handle expects {expected}")]
    SchemaMismatch {
        path: PathBuf,
        field: &'static str,
        stored: u64,
        expected: u64,
    },

    /// A second open of a path that is already open in this process.
    #[error("volume '{0}' is already open in this process")]
    AlreadyOpen(PathBuf),

    /// A node record violated a structural invariant while being read.
    /// Fatal for the handle.
    #[error("corrupt node at offset {pos}: {reason}")]
    CorruptNode { pos: u64, reason: String },

    /// A node or entry offset pointed outside the written file during
    /// traversal. Indicates structural inconsistency, not bad user input.
    /// Fatal for the handle.
    #[error("corrupt offset {pos}: {reason}")]
    CorruptOffset { pos: u64, reason: String },

    /// A positional read referenced bytes past the end of the file.
    #[error("read of {len} bytes at offset {pos} is out of bounds (file size {size})")]
    OutOfBounds { pos: u64, len: usize, size: u64 },
}
