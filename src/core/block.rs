//! Block abstractions for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. Blocks live in one of two tiers:
//! the primary (GPU) pool and the secondary (CPU swap) pool.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Storage tier a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockDevice {
    /// Primary tier, used for execution.
    Gpu,
    /// Secondary tier, used as swap space.
    Cpu,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// A fixed-size chunk of KV cache memory.
///
/// Each block stores KV states for `block_size` tokens. Blocks are the unit
/// of allocation in a [`BlockAllocator`](super::block_allocator::BlockAllocator),
/// which owns them in an arena indexed by `block_id`.
///
/// A block with `ref_count == 0` is free and its contents are garbage.
#[derive(Debug, Clone)]
pub struct Block {
    /// Physical index of this block within its tier.
    block_id: usize,
    /// Number of tokens this block can hold.
    block_size: usize,
    /// Tier the block lives on.
    device: BlockDevice,
    /// Number of block tables referencing this block.
    ref_count: usize,
}

impl Block {
    /// Create a new, free block.
    pub fn new(block_id: usize, block_size: usize, device: BlockDevice) -> Self {
        Self {
            block_id,
            block_size,
            device,
            ref_count: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the tier.
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Check whether the block is in the free pool.
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Increment reference count (when sharing with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleFree`] if the block is already free.
    pub fn decrement_ref(&mut self) -> Result<usize> {
        if self.ref_count == 0 {
            return Err(Error::DoubleFree {
                device: self.device,
                block_id: self.block_id,
            });
        }
        self.ref_count -= 1;
        Ok(self.ref_count)
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the pool of `device`
///
/// Tables hold indices only, never the blocks themselves, so the arena can be
/// validated independently of any table.
///
/// # Example
///
/// ```
/// use nano_serve::core::block::{BlockDevice, BlockTable};
///
/// let mut table = BlockTable::new(16, BlockDevice::Gpu);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Tier every block in this table lives on.
    device: BlockDevice,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize, device: BlockDevice) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
            device,
        }
    }

    /// Create a table from existing block IDs.
    pub fn from_block_ids(block_ids: Vec<usize>, block_size: usize, device: BlockDevice) -> Self {
        Self {
            block_ids,
            block_size,
            device,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the tier.
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the table.
    ///
    /// Called when the sequence grows and needs more blocks.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Physical ID of the trailing block.
    pub fn last_block_id(&self) -> Option<usize> {
        self.block_ids.last().copied()
    }

    /// Point every logical block mapped to `old` at `new`.
    ///
    /// A wrapped sliding-window table maps several logical blocks to one
    /// physical block, and all of them move together. Returns the number of
    /// entries rewritten.
    pub fn replace_block(&mut self, old: usize, new: usize) -> usize {
        let mut replaced = 0;
        for id in self.block_ids.iter_mut().filter(|id| **id == old) {
            *id = new;
            replaced += 1;
        }
        replaced
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Distinct physical block IDs, in first-seen order.
    ///
    /// A sliding-window table reuses blocks, so the same ID can appear more
    /// than once; each distinct block holds one reference for the table.
    pub fn unique_block_ids(&self) -> Vec<usize> {
        let mut seen = HashSet::with_capacity(self.block_ids.len());
        self.block_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_serve::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
