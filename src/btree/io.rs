//! On-disk layout authority.
//!
//! `IoManager` is the only place that knows how the header, node records
//! and entry records are laid out in bytes. Everything it does is
//! positional: the tree hands it explicit offsets and it delegates the raw
//! byte movement to [`MappedFile`].
//!
//! Structural validation lives here too: a node record whose `used_keys`
//! exceeds capacity is reported as a corrupt node, and a record offset
//! pointing outside the written file as a corrupt offset. Both are fatal
//! for the handle; neither can be caused by user input.

use std::marker::PhantomData;
use std::path::Path;

use eyre::{ensure, Report, Result, WrapErr};

use crate::codec::{FixedKey, Value, BLOB_LEN_SIZE, VALUE_TYPE_BLOB};
use crate::error::StoreError;
use crate::storage::{
    MappedFile, TreeHeader, FILE_HEADER_SIZE, INVALID_ROOT_POS, ROOT_POS_OFFSET,
};

use super::node::Node;
use super::Entry;

#[derive(Debug)]
pub struct IoManager<K, V> {
    file: MappedFile,
    t: u16,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K: FixedKey, V: Value> IoManager<K, V> {
    pub fn open<P: AsRef<Path>>(path: P, t: u16) -> Result<Self> {
        ensure!(t >= 2, "minimum degree must be at least 2, got {t}");
        let file = MappedFile::open(path, 0)?;
        Ok(Self {
            file,
            t,
            _kv: PhantomData,
        })
    }

    /// False until the header has been written for the first time.
    pub fn is_ready(&self) -> bool {
        !self.file.is_empty()
    }

    pub fn t(&self) -> u16 {
        self.t
    }

    pub fn node_size(&self) -> u64 {
        Node::size_on_disk(self.t)
    }

    /// Where the next appended record will land.
    pub fn file_end_pos(&self) -> u64 {
        self.file.end_pos()
    }

    /// Writes a fresh header carrying this handle's schema and no root.
    /// Returns the first position after the header.
    pub fn write_header(&self) -> Result<u64> {
        use zerocopy::IntoBytes;

        let header = TreeHeader::new(
            self.t,
            K::WIDTH as u8,
            V::TYPE_CODE,
            V::ELEMENT_WIDTH as u8,
        );
        self.file.write_at(0, header.as_bytes())?;
        Ok(FILE_HEADER_SIZE)
    }

    /// Reads the header and validates it against this handle's schema.
    /// Returns the stored root position (possibly the invalid sentinel).
    pub fn read_header(&self) -> Result<i64> {
        use zerocopy::FromBytes;

        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        self.file
            .read_at(0, &mut buf)
            .wrap_err("failed to read tree header")?;
        // INVARIANT: TreeHeader is unaligned and exactly FILE_HEADER_SIZE bytes
        let header = TreeHeader::read_from_bytes(&buf).expect("buffer sized to header");

        self.validate_schema_field("t", header.t() as u64, self.t as u64)?;
        self.validate_schema_field("key_size", header.key_size() as u64, K::WIDTH as u64)?;
        self.validate_schema_field(
            "value_type_code",
            header.value_type_code() as u64,
            V::TYPE_CODE as u64,
        )?;
        self.validate_schema_field(
            "element_size",
            header.element_size() as u64,
            V::ELEMENT_WIDTH as u64,
        )?;

        Ok(header.root_pos())
    }

    fn validate_schema_field(&self, field: &'static str, stored: u64, expected: u64) -> Result<()> {
        if stored != expected {
            return Err(Report::new(StoreError::SchemaMismatch {
                path: self.file.path().to_path_buf(),
                field,
                stored,
                expected,
            }));
        }
        Ok(())
    }

    /// Rewrites only the 8-byte root position field of the header.
    pub fn write_root_pos(&self, root_pos: u64) -> Result<()> {
        self.file
            .write_primitive(ROOT_POS_OFFSET, root_pos as i64)?;
        Ok(())
    }

    /// Records that the tree is empty and gives back every byte past the
    /// header: dead entries are never reclaimed individually, but an empty
    /// tree owes the filesystem nothing.
    pub fn invalidate_root(&self) -> Result<()> {
        self.file.write_primitive(ROOT_POS_OFFSET, INVALID_ROOT_POS)?;
        self.file.truncate(FILE_HEADER_SIZE)
    }

    /// Serializes the full node record at `node.pos`: flag, used count and
    /// both tables at full capacity. Returns the position after the record.
    pub fn write_node(&self, node: &Node) -> Result<u64> {
        let mut buf = Vec::with_capacity(self.node_size() as usize);
        buf.push(node.flag);
        buf.extend_from_slice(&node.used_keys.to_le_bytes());
        for &pos in &node.key_pos {
            buf.extend_from_slice(&pos.to_le_bytes());
        }
        for &pos in &node.child_pos {
            buf.extend_from_slice(&pos.to_le_bytes());
        }
        debug_assert_eq!(buf.len() as u64, self.node_size());

        self.file
            .write_at(node.pos, &buf)
            .wrap_err_with(|| format!("failed to write node record at {}", node.pos))
    }

    pub fn read_node(&self, pos: u64) -> Result<Node> {
        let size = self.node_size();
        if pos < FILE_HEADER_SIZE || pos + size > self.file.end_pos() {
            return Err(Report::new(StoreError::CorruptOffset {
                pos,
                reason: format!(
                    "node record of {size} bytes does not fit in file of {} bytes",
                    self.file.end_pos()
                ),
            }));
        }

        let mut buf = vec![0u8; size as usize];
        self.file
            .read_at(pos, &mut buf)
            .wrap_err_with(|| format!("failed to read node record at {pos}"))?;

        let mut node = Node::new(self.t, false);
        node.flag = buf[0];
        node.used_keys = u16::from_le_bytes([buf[1], buf[2]]);
        if node.used_keys as usize > node.max_keys() {
            return Err(Report::new(StoreError::CorruptNode {
                pos,
                reason: format!(
                    "used_keys {} exceeds capacity {}",
                    node.used_keys,
                    node.max_keys()
                ),
            }));
        }

        let mut at = 3;
        for slot in node.key_pos.iter_mut() {
            *slot = u64::from_le_bytes(buf[at..at + 8].try_into()?);
            at += 8;
        }
        for slot in node.child_pos.iter_mut() {
            *slot = u64::from_le_bytes(buf[at..at + 8].try_into()?);
            at += 8;
        }
        node.pos = pos;
        Ok(node)
    }

    /// Rewrites the 1-byte flag of the record at `pos` in place. Used to
    /// retire nodes (emptied root, sibling absorbed by a merge).
    pub fn write_flag(&self, flag: u8, pos: u64) -> Result<()> {
        self.file.write_primitive(pos, flag)?;
        Ok(())
    }

    /// Writes an entry record at `pos`: the key image followed by the
    /// plain value bytes or a length-prefixed blob. Returns the position
    /// after the record.
    pub fn write_entry(&self, entry: &Entry<K, V>, pos: u64) -> Result<u64> {
        let mut key_buf = [0u8; 8];
        entry.key.encode(&mut key_buf[..K::WIDTH]);
        let value_pos = self.file.write_at(pos, &key_buf[..K::WIDTH])?;

        let bytes = entry.value.to_bytes();
        if V::TYPE_CODE == VALUE_TYPE_BLOB {
            self.file.write_blob(value_pos, &bytes)
        } else {
            self.file.write_at(value_pos, &bytes)
        }
    }

    pub fn read_entry(&self, pos: u64) -> Result<Entry<K, V>> {
        let key = self.read_key(pos)?;
        let value_pos = pos + K::WIDTH as u64;

        let value = if V::TYPE_CODE == VALUE_TYPE_BLOB {
            let (payload, _) = self
                .file
                .read_blob(value_pos)
                .wrap_err_with(|| format!("failed to read blob value at {value_pos}"))?;
            V::from_bytes(&payload)?
        } else {
            let mut buf = vec![0u8; V::ELEMENT_WIDTH];
            self.file
                .read_at(value_pos, &mut buf)
                .wrap_err_with(|| format!("failed to read value at {value_pos}"))?;
            V::from_bytes(&buf)?
        };

        Ok(Entry { key, value })
    }

    pub fn read_key(&self, pos: u64) -> Result<K> {
        if pos < FILE_HEADER_SIZE || pos + K::WIDTH as u64 > self.file.end_pos() {
            return Err(Report::new(StoreError::CorruptOffset {
                pos,
                reason: format!(
                    "entry key of {} bytes does not fit in file of {} bytes",
                    K::WIDTH,
                    self.file.end_pos()
                ),
            }));
        }
        self.file.read_primitive(pos)
    }

    /// Bytes the value of the entry at `pos` occupies on disk. For blobs
    /// this reads the stored length prefix.
    pub fn stored_value_len(&self, entry_pos: u64) -> Result<u64> {
        if V::TYPE_CODE == VALUE_TYPE_BLOB {
            let len: u32 = self.file.read_primitive(entry_pos + K::WIDTH as u64)?;
            Ok((BLOB_LEN_SIZE + len as usize) as u64)
        } else {
            Ok(V::ELEMENT_WIDTH as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    type IntIo = IoManager<i32, i32>;

    fn open_io(t: u16) -> (tempfile::TempDir, IntIo) {
        let dir = tempdir().unwrap();
        let io = IoManager::open(dir.path().join("tree.db"), t).unwrap();
        (dir, io)
    }

    #[test]
    fn open_rejects_degenerate_degree() {
        let dir = tempdir().unwrap();
        let err = IntIo::open(dir.path().join("tree.db"), 1).unwrap_err();
        assert!(err.to_string().contains("minimum degree"));
    }

    #[test]
    fn header_roundtrips_and_starts_invalid() {
        let (_dir, io) = open_io(5);
        assert!(!io.is_ready());

        let body = io.write_header().unwrap();
        assert_eq!(body, FILE_HEADER_SIZE);
        assert!(io.is_ready());
        assert_eq!(io.read_header().unwrap(), INVALID_ROOT_POS);

        io.write_root_pos(FILE_HEADER_SIZE).unwrap();
        assert_eq!(io.read_header().unwrap(), FILE_HEADER_SIZE as i64);
    }

    #[test]
    fn schema_mismatch_is_detected_per_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");
        {
            let io = IntIo::open(&path, 4).unwrap();
            io.write_header().unwrap();
        }
        {
            let io = IntIo::open(&path, 5).unwrap();
            let err = io.read_header().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::SchemaMismatch { field: "t", .. })
            ));
        }
        {
            let io = IoManager::<i64, i32>::open(&path, 4).unwrap();
            let err = io.read_header().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::SchemaMismatch {
                    field: "key_size",
                    ..
                })
            ));
        }
        {
            let io = IoManager::<i32, String>::open(&path, 4).unwrap();
            let err = io.read_header().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::SchemaMismatch {
                    field: "value_type_code",
                    ..
                })
            ));
        }
    }

    #[test]
    fn node_record_roundtrips_at_full_capacity() {
        let (_dir, io) = open_io(2);
        io.write_header().unwrap();

        let mut node = Node::new(2, true);
        node.pos = FILE_HEADER_SIZE;
        node.used_keys = 2;
        node.key_pos[0] = 100;
        node.key_pos[1] = 200;
        let next = io.write_node(&node).unwrap();
        assert_eq!(next, FILE_HEADER_SIZE + io.node_size());

        let read = io.read_node(FILE_HEADER_SIZE).unwrap();
        assert!(read.is_leaf());
        assert_eq!(read.used_keys, 2);
        assert_eq!(read.key_pos[0], 100);
        assert_eq!(read.key_pos[1], 200);
        assert_eq!(read.pos, FILE_HEADER_SIZE);
    }

    #[test]
    fn oversized_used_keys_is_corrupt_node() {
        let (_dir, io) = open_io(2);
        io.write_header().unwrap();

        let mut node = Node::new(2, true);
        node.pos = FILE_HEADER_SIZE;
        io.write_node(&node).unwrap();
        // forge an impossible key count in place
        let forged: u16 = 9;
        io.file.write_at(node.pos + 1, &forged.to_le_bytes()).unwrap();

        let err = io.read_node(FILE_HEADER_SIZE).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptNode { .. })
        ));
    }

    #[test]
    fn node_offset_outside_file_is_corrupt_offset() {
        let (_dir, io) = open_io(2);
        io.write_header().unwrap();

        let err = io.read_node(10_000).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptOffset { .. })
        ));
    }

    #[test]
    fn plain_entry_roundtrips() {
        let (_dir, io) = open_io(2);
        io.write_header().unwrap();

        let entry = Entry { key: 7i32, value: 65i32 };
        let next = io.write_entry(&entry, 50).unwrap();
        assert_eq!(next, 50 + 4 + 4);

        let read = io.read_entry(50).unwrap();
        assert_eq!(read.key, 7);
        assert_eq!(read.value, 65);
        assert_eq!(io.stored_value_len(50).unwrap(), 4);
    }

    #[test]
    fn blob_entry_roundtrips_with_stored_length() {
        let dir = tempdir().unwrap();
        let io = IoManager::<i32, String>::open(dir.path().join("tree.db"), 3).unwrap();
        io.write_header().unwrap();

        let entry = Entry {
            key: 1i32,
            value: "A much longer value".to_string(),
        };
        io.write_entry(&entry, 40).unwrap();

        let read = io.read_entry(40).unwrap();
        assert_eq!(read.value, "A much longer value");
        assert_eq!(io.stored_value_len(40).unwrap(), 4 + 19);
    }
}
