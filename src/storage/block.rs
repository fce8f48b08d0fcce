//! Block windows and the window cache.
//!
//! A [`Block`] is a 4-KiB `MmapMut` view over one aligned slice of the
//! backing file. The [`BlockCache`] keeps at most [`BLOCK_CACHE_CAPACITY`]
//! windows mapped, evicting the least recently used; dropping a window
//! unmaps it, and the kernel writes back any dirty pages of the shared
//! mapping on its own schedule.

use std::fs::File;
use std::num::NonZeroUsize;

use eyre::{Result, WrapErr};
use lru::LruCache;
use memmap2::{MmapMut, MmapOptions};

use super::{BLOCK_CACHE_CAPACITY, BLOCK_SIZE};

#[derive(Debug)]
pub struct Block {
    mmap: MmapMut,
}

impl Block {
    /// Maps the window for `block_no`. The file must already be at least
    /// one byte long inside the block's page range.
    pub fn map(file: &File, block_no: u64) -> Result<Self> {
        let offset = block_no * BLOCK_SIZE;

        // SAFETY: MmapMut::map_mut is unsafe because the mapping can be
        // invalidated by external modification of the file. This is safe
        // because:
        // 1. The file is opened read+write by this process only (the volume
        //    registry rejects a second open of the same path)
        // 2. The file is never shrunk while windows are mapped; truncation
        //    clears the cache first
        // 3. All access goes through copy_in/copy_out, which slice within
        //    the fixed BLOCK_SIZE window
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(BLOCK_SIZE as usize)
                .map_mut(file)
                .wrap_err_with(|| format!("failed to map block {block_no} at offset {offset}"))?
        };

        Ok(Self { mmap })
    }

    pub fn copy_in(&mut self, at: usize, src: &[u8]) {
        self.mmap[at..at + src.len()].copy_from_slice(src);
    }

    pub fn copy_out(&self, at: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.mmap[at..at + dst.len()]);
    }
}

#[derive(Debug)]
pub struct BlockCache {
    blocks: LruCache<u64, Block>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(BLOCK_CACHE_CAPACITY).expect("default capacity is nonzero"));
        Self {
            blocks: LruCache::new(capacity),
        }
    }

    /// Returns the window for `block_no`, mapping it on miss. Mapping a new
    /// window may evict (unmap) the least recently used one.
    pub fn block_mut(&mut self, file: &File, block_no: u64) -> Result<&mut Block> {
        if !self.blocks.contains(&block_no) {
            let block = Block::map(file, block_no)?;
            self.blocks.push(block_no, block);
        }
        // INVARIANT: the window was just inserted or already resident
        Ok(self.blocks.get_mut(&block_no).expect("block just mapped"))
    }

    /// Drops one window if resident. Used before the file is regrown from
    /// an unaligned length, so the stale partial-page mapping is not reused.
    pub fn evict(&mut self, block_no: u64) {
        self.blocks.pop(&block_no);
    }

    /// Unmaps every window. Must run before the file is truncated.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
