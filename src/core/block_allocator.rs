//! Per-tier block allocator.
//!
//! A `BlockAllocator` owns every block of one tier (GPU or CPU) in an arena
//! and hands out block ids from a free list, similar to how an operating
//! system manages physical memory pages.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) block allocation and deallocation
//! - **Reference counting**: Enables block sharing between forked sequences
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::block::BlockDevice;
//! use nano_serve::core::block_allocator::BlockAllocator;
//!
//! let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 1024, 16);
//!
//! // Allocate a block
//! let block_id = allocator.allocate().unwrap();
//!
//! // Use the block...
//!
//! // Free when done
//! assert!(allocator.free(block_id).unwrap());
//! ```

use std::collections::VecDeque;

use crate::core::block::{Block, BlockDevice};
use crate::error::{Error, Result};

/// Manages allocation and deallocation of the blocks of one tier.
///
/// The allocator maintains:
/// - An arena of every block, indexed by block id
/// - A free list holding exactly the blocks whose ref count is zero
#[derive(Debug)]
pub struct BlockAllocator {
    /// Tier this allocator serves.
    device: BlockDevice,
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs.
    free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockAllocator {
    /// Create an allocator with `num_blocks` free blocks.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_serve::core::block::BlockDevice;
    /// use nano_serve::core::block_allocator::BlockAllocator;
    ///
    /// let allocator = BlockAllocator::new(BlockDevice::Cpu, 64, 16);
    /// assert_eq!(allocator.num_free_blocks(), 64);
    /// ```
    pub fn new(device: BlockDevice, num_blocks: usize, block_size: usize) -> Self {
        Self {
            device,
            blocks: (0..num_blocks)
                .map(|id| Block::new(id, block_size, device))
                .collect(),
            free_list: (0..num_blocks).collect(),
            block_size,
        }
    }

    /// Get the tier.
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of blocks with at least one reference.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate a single block with a reference count of one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_serve::core::block::BlockDevice;
    /// use nano_serve::core::block_allocator::BlockAllocator;
    ///
    /// let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 2, 16);
    ///
    /// let _b1 = allocator.allocate().unwrap();
    /// let _b2 = allocator.allocate().unwrap();
    ///
    /// // Third allocation fails
    /// assert!(allocator.allocate().is_err());
    /// ```
    pub fn allocate(&mut self) -> Result<usize> {
        let block_id = self
            .free_list
            .pop_front()
            .ok_or(Error::OutOfBlocks(self.device))?;
        self.blocks[block_id].increment_ref();
        Ok(block_id)
    }

    /// Drop one reference to a block.
    ///
    /// # Returns
    ///
    /// `true` if the block went back to the free list, `false` if it still
    /// has references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleFree`] if the block is already free, or
    /// [`Error::BlockIndexOutOfBounds`] if the id is not part of this tier.
    pub fn free(&mut self, block_id: usize) -> Result<bool> {
        let remaining = self.block_mut(block_id)?.decrement_ref()?;
        if remaining == 0 {
            self.free_list.push_back(block_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Add one reference to an allocated block.
    ///
    /// Used when a forked sequence shares the block.
    ///
    /// # Returns
    ///
    /// The new reference count.
    pub fn increment_ref(&mut self, block_id: usize) -> Result<usize> {
        let device = self.device;
        let block = self.block_mut(block_id)?;
        if block.is_free() {
            return Err(Error::InvariantViolation(format!(
                "sharing free {device} block {block_id}"
            )));
        }
        block.increment_ref();
        Ok(block.ref_count())
    }

    /// Current reference count of a block (zero for free or unknown ids).
    pub fn ref_count(&self, block_id: usize) -> usize {
        self.blocks.get(block_id).map_or(0, Block::ref_count)
    }

    /// Iterate over every block of the tier.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Check that the free list holds exactly the zero-ref blocks.
    pub fn validate(&self) -> Result<()> {
        let zero_ref = self.blocks.iter().filter(|b| b.is_free()).count();
        if zero_ref != self.free_list.len() {
            return Err(Error::InvariantViolation(format!(
                "{} tier: {} zero-ref blocks but {} on the free list",
                self.device,
                zero_ref,
                self.free_list.len()
            )));
        }
        if let Some(&id) = self.free_list.iter().find(|&&id| !self.blocks[id].is_free()) {
            return Err(Error::InvariantViolation(format!(
                "{} block {} is on the free list with ref count {}",
                self.device,
                id,
                self.blocks[id].ref_count()
            )));
        }
        Ok(())
    }

    /// Reset the allocator to its initial state.
    ///
    /// All blocks are freed and returned to the free list.
    pub fn reset(&mut self) {
        let (device, block_size) = (self.device, self.block_size);
        for block in &mut self.blocks {
            *block = Block::new(block.block_id(), block_size, device);
        }
        self.free_list.clear();
        self.free_list.extend(0..self.blocks.len());
    }

    fn block_mut(&mut self, block_id: usize) -> Result<&mut Block> {
        let num_blocks = self.blocks.len();
        self.blocks
            .get_mut(block_id)
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: block_id,
                num_blocks,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_creation() {
        let allocator = BlockAllocator::new(BlockDevice::Gpu, 100, 16);
        assert_eq!(allocator.num_total_blocks(), 100);
        assert_eq!(allocator.block_size(), 16);
        assert_eq!(allocator.num_free_blocks(), 100);
        assert_eq!(allocator.num_used_blocks(), 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn test_allocate_and_free() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 10, 16);

        let block_id = allocator.allocate().unwrap();
        assert_eq!(allocator.num_free_blocks(), 9);
        assert_eq!(allocator.ref_count(block_id), 1);

        assert!(allocator.free(block_id).unwrap());
        assert_eq!(allocator.num_free_blocks(), 10);
        assert_eq!(allocator.ref_count(block_id), 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn test_out_of_blocks() {
        let mut allocator = BlockAllocator::new(BlockDevice::Cpu, 2, 16);

        allocator.allocate().unwrap();
        allocator.allocate().unwrap();

        assert!(matches!(
            allocator.allocate(),
            Err(Error::OutOfBlocks(BlockDevice::Cpu))
        ));
    }

    #[test]
    fn test_reference_counting() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 10, 16);
        let block_id = allocator.allocate().unwrap();

        assert_eq!(allocator.increment_ref(block_id).unwrap(), 2);
        assert_eq!(allocator.increment_ref(block_id).unwrap(), 3);

        assert!(!allocator.free(block_id).unwrap()); // 3 -> 2
        assert!(!allocator.free(block_id).unwrap()); // 2 -> 1
        assert_eq!(allocator.num_used_blocks(), 1);

        assert!(allocator.free(block_id).unwrap()); // 1 -> 0
        assert_eq!(allocator.num_free_blocks(), 10);
        allocator.validate().unwrap();
    }

    #[test]
    fn test_double_free_is_error() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 4, 16);
        let block_id = allocator.allocate().unwrap();
        allocator.free(block_id).unwrap();

        assert!(matches!(
            allocator.free(block_id),
            Err(Error::DoubleFree { .. })
        ));
        // The free list is untouched by the failed release
        assert_eq!(allocator.num_free_blocks(), 4);
        allocator.validate().unwrap();
    }

    #[test]
    fn test_share_free_block_is_error() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 4, 16);
        assert!(allocator.increment_ref(0).is_err());
        assert!(allocator.increment_ref(99).is_err());
    }

    #[test]
    fn test_can_allocate() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 5, 16);

        assert!(allocator.can_allocate(5));
        assert!(!allocator.can_allocate(6));

        for _ in 0..3 {
            allocator.allocate().unwrap();
        }
        assert!(allocator.can_allocate(2));
        assert!(!allocator.can_allocate(3));
    }

    #[test]
    fn test_reset() {
        let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 10, 16);
        let first = allocator.allocate().unwrap();
        allocator.increment_ref(first).unwrap();
        for _ in 0..4 {
            allocator.allocate().unwrap();
        }

        allocator.reset();

        assert_eq!(allocator.num_free_blocks(), 10);
        assert_eq!(allocator.ref_count(first), 0);
        allocator.validate().unwrap();
    }
}
