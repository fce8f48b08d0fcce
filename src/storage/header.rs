//! The 13-byte file header.
//!
//! Written once when the first key is inserted; afterwards only the 8-byte
//! `root_pos` field is rewritten in place, either to track a root that
//! changed identity or to invalidate the root when the tree empties.
//!
//! ```text
//! offset  size  field
//!   0       2   t                (minimum degree)
//!   2       1   key_size
//!   3       1   value_type_code  (0 = plain, 1 = blob)
//!   4       1   element_size
//!   5       8   root_pos         (-1 = no root)
//! ```

use zerocopy::little_endian::{I64, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{FILE_HEADER_SIZE, INVALID_ROOT_POS};

/// Byte offset of the `root_pos` field within the header.
pub const ROOT_POS_OFFSET: u64 = 5;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreeHeader {
    t: U16,
    key_size: u8,
    value_type_code: u8,
    element_size: u8,
    root_pos: I64,
}

const _: () = assert!(std::mem::size_of::<TreeHeader>() == FILE_HEADER_SIZE as usize);

impl TreeHeader {
    pub fn new(t: u16, key_size: u8, value_type_code: u8, element_size: u8) -> Self {
        Self {
            t: U16::new(t),
            key_size,
            value_type_code,
            element_size,
            root_pos: I64::new(INVALID_ROOT_POS),
        }
    }

    pub fn t(&self) -> u16 {
        self.t.get()
    }

    pub fn key_size(&self) -> u8 {
        self.key_size
    }

    pub fn value_type_code(&self) -> u8 {
        self.value_type_code
    }

    pub fn element_size(&self) -> u8 {
        self.element_size
    }

    pub fn root_pos(&self) -> i64 {
        self.root_pos.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_13_bytes() {
        let header = TreeHeader::new(5, 4, 0, 4);
        assert_eq!(header.as_bytes().len(), 13);
    }

    #[test]
    fn new_header_has_no_root() {
        let header = TreeHeader::new(2, 8, 1, 1);
        assert_eq!(header.root_pos(), INVALID_ROOT_POS);
        assert_eq!(header.t(), 2);
        assert_eq!(header.key_size(), 8);
        assert_eq!(header.value_type_code(), 1);
        assert_eq!(header.element_size(), 1);
    }

    #[test]
    fn header_roundtrips_through_bytes() {
        let header = TreeHeader::new(17, 4, 0, 8);
        let parsed = TreeHeader::read_from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.t(), 17);
        assert_eq!(parsed.element_size(), 8);
    }
}
