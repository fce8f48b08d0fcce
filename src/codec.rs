//! Key and value codecs.
//!
//! A tree is statically typed by its key and value codecs, and the file
//! header records the codec parameters so a reopen with a different
//! configuration fails deterministically.
//!
//! Keys are fixed-width and totally ordered ([`FixedKey`]). Values come in
//! two statically-selected flavors ([`Value::TYPE_CODE`]):
//!
//! - **plain** (`0`): a fixed `ELEMENT_WIDTH`-byte little-endian image,
//!   written in place inside the entry record;
//! - **blob** (`1`): a `u32` length prefix followed by the payload, for
//!   strings and byte vectors whose size varies per entry.

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;

pub const VALUE_TYPE_PLAIN: u8 = 0;
pub const VALUE_TYPE_BLOB: u8 = 1;

/// Size of the `u32` length prefix in front of a blob payload.
pub const BLOB_LEN_SIZE: usize = 4;

/// A fixed-width scalar with a little-endian byte image.
pub trait Primitive: Copy {
    const WIDTH: usize;

    /// Encodes into `out`, which must be exactly `WIDTH` bytes.
    fn encode(self, out: &mut [u8]);

    /// Decodes from `buf`, which must be exactly `WIDTH` bytes.
    fn decode(buf: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {$(
        impl Primitive for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn decode(buf: &[u8]) -> Self {
                // INVARIANT: callers slice the buffer to exactly WIDTH bytes
                <$ty>::from_le_bytes(buf.try_into().expect("buffer sized by WIDTH"))
            }
        }
    )*};
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A tree key: fixed width, totally ordered. The width is recorded in the
/// file header as a single byte, which every primitive satisfies.
pub trait FixedKey: Primitive + Ord + std::fmt::Debug + Send {}

impl<T> FixedKey for T where T: Primitive + Ord + std::fmt::Debug + Send {}

/// A tree value. `TYPE_CODE` selects the on-disk flavor; `ELEMENT_WIDTH`
/// is the plain width, or the width of one container element for blobs.
pub trait Value: Sized + Clone + Send {
    const TYPE_CODE: u8;
    const ELEMENT_WIDTH: usize;

    fn to_bytes(&self) -> SmallVec<[u8; 16]>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Bytes this value occupies inside an entry record.
    fn stored_len(&self) -> u64 {
        if Self::TYPE_CODE == VALUE_TYPE_BLOB {
            (BLOB_LEN_SIZE + self.to_bytes().len()) as u64
        } else {
            Self::ELEMENT_WIDTH as u64
        }
    }
}

macro_rules! impl_plain_value {
    ($($ty:ty),* $(,)?) => {$(
        impl Value for $ty {
            const TYPE_CODE: u8 = VALUE_TYPE_PLAIN;
            const ELEMENT_WIDTH: usize = std::mem::size_of::<$ty>();

            fn to_bytes(&self) -> SmallVec<[u8; 16]> {
                SmallVec::from_slice(&self.to_le_bytes())
            }

            fn from_bytes(bytes: &[u8]) -> Result<Self> {
                ensure!(
                    bytes.len() == Self::ELEMENT_WIDTH,
                    "plain value needs {} bytes, {} were stored",
                    Self::ELEMENT_WIDTH,
                    bytes.len()
                );
                Ok(<$ty>::from_le_bytes(bytes.try_into()?))
            }
        }
    )*};
}

impl_plain_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Value for String {
    const TYPE_CODE: u8 = VALUE_TYPE_BLOB;
    const ELEMENT_WIDTH: usize = 1;

    fn to_bytes(&self) -> SmallVec<[u8; 16]> {
        SmallVec::from_slice(self.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).wrap_err("stored blob is not valid UTF-8")
    }
}

impl Value for Vec<u8> {
    const TYPE_CODE: u8 = VALUE_TYPE_BLOB;
    const ELEMENT_WIDTH: usize = 1;

    fn to_bytes(&self) -> SmallVec<[u8; 16]> {
        SmallVec::from_slice(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_width_fits_header_byte() {
        assert!(<i64 as Primitive>::WIDTH <= u8::MAX as usize);
        assert_eq!(<i32 as Primitive>::WIDTH, 4);
        assert_eq!(<u8 as Primitive>::WIDTH, 1);
    }

    #[test]
    fn plain_value_rejects_short_buffer() {
        let err = <i32 as Value>::from_bytes(&[1, 2]).unwrap_err();
        assert!(err.to_string().contains("plain value"));
    }

    #[test]
    fn stored_len_counts_blob_prefix() {
        assert_eq!(7i64.stored_len(), 8);
        assert_eq!("abc".to_string().stored_len(), 4 + 3);
        assert_eq!(vec![0u8; 10].stored_len(), 4 + 10);
    }

    #[test]
    fn negative_keys_order_below_positive() {
        let mut buf = [0u8; 4];
        (-5i32).encode(&mut buf);
        assert_eq!(<i32 as Primitive>::decode(&buf), -5);
        assert!(-5i32 < 3i32);
    }
}
