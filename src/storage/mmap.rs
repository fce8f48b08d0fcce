//! # Memory-Mapped Positional File I/O
//!
//! This module implements [`MappedFile`], the substrate every byte of a
//! tree passes through. It owns the backing file, grows it on demand, and
//! services positional reads and writes through 4-KiB mapped block windows.
//!
//! ## Design
//!
//! The file is viewed as a sequence of [`BLOCK_SIZE`] blocks. A positional
//! operation resolves its offset to a block, obtains the window from the
//! LRU cache (mapping it on miss), and copies into or out of the mapping.
//! Operations that straddle a boundary are split across consecutive
//! windows, so callers can treat the file as flat bytes; node records and
//! blob payloads may land anywhere.
//!
//! ## Size Bookkeeping
//!
//! Two lengths are tracked:
//!
//! - `size`: the logical high-water mark of written bytes. Reads past it
//!   fail with `OutOfBounds`; the file is truncated back to it on close.
//! - `capacity`: the physical file length. Any write that would cross it
//!   doubles the capacity or raises it to the required end, whichever is
//!   larger, aligned up to a 4-KiB boundary.
//!
//! The asymmetry means a session leaves slack on disk while it runs and
//! gives it back on close. A truncate failure at close is logged and
//! swallowed: an oversized file is wasted space, not a correctness fault.
//!
//! ## Interior Mutability
//!
//! All state (file handle, window cache, sizes) lives behind one
//! `parking_lot::Mutex`, so logically-read-only operations can run under a
//! shared volume lock even though they may fault a window in. No other
//! lock exists below the volume boundary.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use eyre::{Report, Result, WrapErr};
use parking_lot::Mutex;
use tracing::warn;

use crate::codec::Primitive;
use crate::error::StoreError;

use super::block::BlockCache;
use super::{align_up, BLOCK_CACHE_CAPACITY, BLOCK_SIZE};

#[derive(Debug)]
struct FileState {
    file: std::fs::File,
    cache: BlockCache,
    /// High-water mark of written bytes; the truncation target at close.
    size: u64,
    /// Physical file length on disk, always >= size.
    capacity: u64,
}

impl FileState {
    fn ensure_capacity(&mut self, end: u64) -> Result<()> {
        if end <= self.capacity {
            return Ok(());
        }

        // A window mapped while the file ended mid-block saw a partial
        // page; drop it so the regrown range is faulted in fresh.
        if self.capacity % BLOCK_SIZE != 0 {
            self.cache.evict(self.capacity / BLOCK_SIZE);
        }

        let target = align_up(end.max(self.capacity * 2), BLOCK_SIZE);
        self.file
            .set_len(target)
            .wrap_err_with(|| format!("failed to grow file to {target} bytes"))?;
        self.capacity = target;
        Ok(())
    }

    fn write_span(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        self.ensure_capacity(end)?;

        let mut offset = pos;
        let mut rest = data;
        while !rest.is_empty() {
            let block_no = offset / BLOCK_SIZE;
            let in_block = (offset % BLOCK_SIZE) as usize;
            let chunk = rest.len().min(BLOCK_SIZE as usize - in_block);
            self.cache
                .block_mut(&self.file, block_no)?
                .copy_in(in_block, &rest[..chunk]);
            offset += chunk as u64;
            rest = &rest[chunk..];
        }

        self.size = self.size.max(end);
        Ok(())
    }

    fn read_span(&mut self, pos: u64, out: &mut [u8]) -> Result<()> {
        let end = pos + out.len() as u64;
        if end > self.size {
            return Err(Report::new(StoreError::OutOfBounds {
                pos,
                len: out.len(),
                size: self.size,
            }));
        }

        let mut offset = pos;
        let mut rest = out;
        while !rest.is_empty() {
            let block_no = offset / BLOCK_SIZE;
            let in_block = (offset % BLOCK_SIZE) as usize;
            let chunk = rest.len().min(BLOCK_SIZE as usize - in_block);
            let (head, tail) = rest.split_at_mut(chunk);
            self.cache
                .block_mut(&self.file, block_no)?
                .copy_out(in_block, head);
            offset += chunk as u64;
            rest = tail;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl MappedFile {
    /// Creates the file sized to `initial_bytes` if absent, otherwise opens
    /// it and adopts its length as the written size. No window is mapped
    /// until the first positional operation.
    pub fn open<P: AsRef<Path>>(path: P, initial_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        let mut len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        if len == 0 && initial_bytes > 0 {
            file.set_len(initial_bytes)
                .wrap_err_with(|| format!("failed to size new file to {initial_bytes} bytes"))?;
            len = initial_bytes;
        }

        Ok(Self {
            path,
            state: Mutex::new(FileState {
                file,
                cache: BlockCache::new(BLOCK_CACHE_CAPACITY),
                size: len,
                capacity: len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes raw bytes at `pos`, growing the file if needed. Returns the
    /// position just past the written run.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        state
            .write_span(pos, data)
            .wrap_err_with(|| format!("write of {} bytes at {pos} in '{}'", data.len(), self.path.display()))?;
        Ok(pos + data.len() as u64)
    }

    /// Reads exactly `out.len()` raw bytes at `pos`.
    pub fn read_at(&self, pos: u64, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .read_span(pos, out)
            .wrap_err_with(|| format!("read of {} bytes at {pos} in '{}'", out.len(), self.path.display()))
    }

    pub fn write_primitive<T: Primitive>(&self, pos: u64, value: T) -> Result<u64> {
        let mut buf = [0u8; 8];
        value.encode(&mut buf[..T::WIDTH]);
        self.write_at(pos, &buf[..T::WIDTH])
    }

    pub fn read_primitive<T: Primitive>(&self, pos: u64) -> Result<T> {
        let mut buf = [0u8; 8];
        self.read_at(pos, &mut buf[..T::WIDTH])?;
        Ok(T::decode(&buf[..T::WIDTH]))
    }

    /// Writes a `u32` length prefix followed by the payload. Returns the
    /// position just past the payload.
    pub fn write_blob(&self, pos: u64, payload: &[u8]) -> Result<u64> {
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.write_at(pos, &buf)
    }

    /// Reads a length-prefixed blob. Returns the payload and the position
    /// just past it.
    pub fn read_blob(&self, pos: u64) -> Result<(Vec<u8>, u64)> {
        let len: u32 = self.read_primitive(pos)?;
        let mut payload = vec![0u8; len as usize];
        self.read_at(pos + 4, &mut payload)?;
        Ok((payload, pos + 4 + len as u64))
    }

    /// The logical high-water mark: where the next append lands.
    pub fn end_pos(&self) -> u64 {
        self.state.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().size == 0
    }

    /// Abandons everything past `len` and shrinks the file to match. Used
    /// when the tree becomes empty and only the header remains live.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.cache.clear();
        state
            .file
            .set_len(len)
            .wrap_err_with(|| format!("failed to truncate '{}' to {len} bytes", self.path.display()))?;
        state.size = len;
        state.capacity = len;
        Ok(())
    }

    /// Gives the growth slack back to the filesystem: unmaps all windows
    /// and resizes the file down to the written size.
    pub fn shrink_to_fit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.cache.clear();
        let size = state.size;
        state
            .file
            .set_len(size)
            .wrap_err_with(|| format!("failed to shrink '{}' to {size} bytes", self.path.display()))?;
        state.capacity = size;
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.cache.clear();
        if let Err(err) = state.file.set_len(state.size) {
            warn!(
                path = %self.path.display(),
                size = state.size,
                %err,
                "failed to truncate file on close; leaving it oversized"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FILE_HEADER_SIZE;
    use tempfile::tempdir;

    fn open_temp(initial: u64) -> (tempfile::TempDir, MappedFile) {
        let dir = tempdir().unwrap();
        let file = MappedFile::open(dir.path().join("data.db"), initial).unwrap();
        (dir, file)
    }

    #[test]
    fn new_file_with_zero_initial_bytes_is_empty() {
        let (_dir, file) = open_temp(0);
        assert!(file.is_empty());
        assert_eq!(file.end_pos(), 0);
    }

    #[test]
    fn first_write_grows_to_one_aligned_block() {
        let (dir, file) = open_temp(0);
        file.write_primitive(0u64, 7u32).unwrap();

        assert_eq!(file.end_pos(), 4);
        let on_disk = std::fs::metadata(dir.path().join("data.db")).unwrap().len();
        assert_eq!(on_disk, BLOCK_SIZE);
    }

    #[test]
    fn primitives_roundtrip_at_arbitrary_offsets() {
        let (_dir, file) = open_temp(0);
        file.write_primitive(100, -42i64).unwrap();
        file.write_primitive(3, 7u16).unwrap();

        assert_eq!(file.read_primitive::<i64>(100).unwrap(), -42);
        assert_eq!(file.read_primitive::<u16>(3).unwrap(), 7);
    }

    #[test]
    fn writes_straddling_block_boundary_roundtrip() {
        let (_dir, file) = open_temp(0);
        let data: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        let pos = BLOCK_SIZE - 3;

        file.write_at(pos, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        file.read_at(pos, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn blob_roundtrips_with_length_prefix() {
        let (_dir, file) = open_temp(0);
        let next = file.write_blob(10, b"variable width").unwrap();
        assert_eq!(next, 10 + 4 + 14);

        let (payload, after) = file.read_blob(10).unwrap();
        assert_eq!(payload, b"variable width");
        assert_eq!(after, next);
    }

    #[test]
    fn read_past_written_size_is_out_of_bounds() {
        let (_dir, file) = open_temp(0);
        file.write_primitive(0u64, 1u8).unwrap();

        let err = file.read_primitive::<u32>(100).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn capacity_doubles_then_aligns() {
        let (dir, file) = open_temp(0);
        file.write_at(0, &[1u8; 100]).unwrap();
        file.write_at(BLOCK_SIZE, &[2u8; 100]).unwrap();

        let on_disk = std::fs::metadata(dir.path().join("data.db")).unwrap().len();
        assert_eq!(on_disk, 2 * BLOCK_SIZE);
    }

    #[test]
    fn truncate_resets_logical_and_physical_size() {
        let (dir, file) = open_temp(0);
        file.write_at(0, &[0u8; 2000]).unwrap();
        file.truncate(FILE_HEADER_SIZE).unwrap();

        assert_eq!(file.end_pos(), FILE_HEADER_SIZE);
        let on_disk = std::fs::metadata(dir.path().join("data.db")).unwrap().len();
        assert_eq!(on_disk, FILE_HEADER_SIZE);
    }

    #[test]
    fn shrink_to_fit_releases_growth_slack() {
        let (dir, file) = open_temp(0);
        file.write_at(0, &[3u8; 150]).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("data.db")).unwrap().len(), BLOCK_SIZE);

        file.shrink_to_fit().unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("data.db")).unwrap().len(), 150);

        // the file keeps working after the windows were dropped
        assert_eq!(file.read_primitive::<u8>(149).unwrap(), 3);
        file.write_at(150, &[4u8; 10]).unwrap();
        assert_eq!(file.read_primitive::<u8>(159).unwrap(), 4);
    }

    #[test]
    fn close_shrinks_file_to_written_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let file = MappedFile::open(&path, 0).unwrap();
            file.write_at(0, &[9u8; 77]).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), BLOCK_SIZE);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 77);
    }

    #[test]
    fn reopen_adopts_prior_size_and_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let file = MappedFile::open(&path, 0).unwrap();
            file.write_primitive(0u64, 123456789i64).unwrap();
        }
        let file = MappedFile::open(&path, 0).unwrap();
        assert_eq!(file.end_pos(), 8);
        assert_eq!(file.read_primitive::<i64>(0).unwrap(), 123456789);
    }

    #[test]
    fn regrowth_after_unaligned_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let file = MappedFile::open(&path, 0).unwrap();
            file.write_at(0, &[5u8; 13]).unwrap();
        }
        let file = MappedFile::open(&path, 0).unwrap();
        assert_eq!(file.read_primitive::<u8>(12).unwrap(), 5);

        file.write_at(13, &[6u8; 50]).unwrap();
        assert_eq!(file.read_primitive::<u8>(0).unwrap(), 5);
        assert_eq!(file.read_primitive::<u8>(62).unwrap(), 6);
    }
}
