//! # barreldb: Single-File Persistent B-Tree
//!
//! barreldb is an embedded key-value store: one file, one B-tree, keys of
//! a fixed-width primitive type mapped to either fixed-width primitive
//! values or variable-length blob values (strings, byte vectors). The tree
//! lives entirely at file offsets: nodes reference their children and
//! their entries by absolute byte position, and every operation is a chain
//! of positional reads and writes over a memory-mapped file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use barreldb::Volume;
//!
//! let mut volume: Volume<i32, String> = Volume::open("./data.db", 5)?;
//! volume.set(1, "hello".to_string())?;
//! assert_eq!(volume.get(&1)?, Some("hello".to_string()));
//! assert!(volume.remove(&1)?);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Volume / SharedVolume (path registry)  │
//! ├─────────────────────────────────────────┤
//! │        BTree  (offset algorithm)        │
//! ├─────────────────────────────────────────┤
//! │      IoManager  (record layouts)        │
//! ├─────────────────────────────────────────┤
//! │   MappedFile  (positional block I/O)    │
//! ├─────────────────────────────────────────┤
//! │  Block windows  (4-KiB mmap, LRU 1000)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! offset 0    13-byte header: t, key_size, value_type_code,
//!             element_size, root_pos (-1 when the tree is empty)
//! offset 13   node and entry records, interleaved, append-only
//!             except for in-place rewrites
//! ```
//!
//! Records are never moved and dead bytes are never reclaimed during a
//! session; the file is truncated to its written size on close, and all
//! the way back to the header when the last key is removed. A clean close
//! followed by a reopen with the same (K, V, t) configuration reproduces
//! the same mapping; any other configuration is rejected.
//!
//! ## Guarantees and Non-Guarantees
//!
//! - All operations on one volume are serialized (`SharedVolume` readers
//!   may overlap each other, never a writer).
//! - The on-disk image is consistent only after a clean close. There is no
//!   journal: a crash mid-operation leaves whatever the operation had
//!   written so far.
//! - One volume per path per process, enforced; cross-process access is
//!   not coordinated at all.

pub mod btree;
pub mod codec;
pub mod error;
pub mod storage;
pub mod volume;

pub use btree::{BTree, Entry};
pub use codec::{FixedKey, Primitive, Value};
pub use error::StoreError;
pub use volume::{SharedVolume, Storage, Volume};
