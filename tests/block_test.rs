//! Integration tests for Block, BlockTable and BlockAllocator.

use nano_serve::core::block::{compute_num_blocks, Block, BlockDevice, BlockTable};
use nano_serve::core::block_allocator::BlockAllocator;
use nano_serve::Error;

#[test]
fn test_block_creation() {
    let block = Block::new(42, 16, BlockDevice::Cpu);
    assert_eq!(block.block_id(), 42);
    assert_eq!(block.block_size(), 16);
    assert_eq!(block.device(), BlockDevice::Cpu);
    assert_eq!(block.ref_count(), 0);
    assert!(block.is_free());
}

#[test]
fn test_block_ref_counting() {
    let mut block = Block::new(0, 16, BlockDevice::Gpu);

    block.increment_ref();
    block.increment_ref();
    assert_eq!(block.ref_count(), 2);
    assert!(!block.is_free());

    assert_eq!(block.decrement_ref().unwrap(), 1);
    assert_eq!(block.decrement_ref().unwrap(), 0);

    // Should not go below 0
    assert!(matches!(
        block.decrement_ref(),
        Err(Error::DoubleFree { block_id: 0, .. })
    ));
}

#[test]
fn test_block_table_basic() {
    let mut table = BlockTable::new(16, BlockDevice::Gpu);
    assert!(table.is_empty());
    assert_eq!(table.num_blocks(), 0);
    assert_eq!(table.last_block_id(), None);

    table.append_block(5);
    table.append_block(12);

    assert_eq!(table.num_blocks(), 2);
    assert_eq!(table.get_block_id(0).unwrap(), 5);
    assert_eq!(table.get_block_id(1).unwrap(), 12);
    assert_eq!(table.last_block_id(), Some(12));
    assert!(matches!(
        table.get_block_id(2),
        Err(Error::BlockIndexOutOfBounds {
            logical_idx: 2,
            num_blocks: 2
        })
    ));
}

#[test]
fn test_replace_block_rewrites_every_alias() {
    let mut table = BlockTable::from_block_ids(vec![1, 2, 1, 2, 1], 4, BlockDevice::Gpu);
    assert_eq!(table.replace_block(1, 9), 3);
    assert_eq!(table.get_physical_block_ids(), &[9, 2, 9, 2, 9]);
    assert_eq!(table.unique_block_ids(), vec![9, 2]);

    let mut empty = BlockTable::new(4, BlockDevice::Gpu);
    assert_eq!(empty.replace_block(1, 3), 0);
}

#[test]
fn test_unique_block_ids_keeps_first_seen_order() {
    let table = BlockTable::from_block_ids(vec![4, 1, 4, 1, 4], 4, BlockDevice::Gpu);
    assert_eq!(table.unique_block_ids(), vec![4, 1]);
}

#[test]
fn test_compute_num_blocks() {
    assert_eq!(compute_num_blocks(0, 16), 0);
    assert_eq!(compute_num_blocks(1, 16), 1);
    assert_eq!(compute_num_blocks(16, 16), 1);
    assert_eq!(compute_num_blocks(17, 16), 2);
}

#[test]
fn test_allocator_hands_out_ids_in_order() {
    let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 3, 16);
    assert_eq!(allocator.allocate().unwrap(), 0);
    assert_eq!(allocator.allocate().unwrap(), 1);
    assert_eq!(allocator.allocate().unwrap(), 2);
    assert_eq!(allocator.num_free_blocks(), 0);
    assert!(matches!(
        allocator.allocate(),
        Err(Error::OutOfBlocks(BlockDevice::Gpu))
    ));
}

#[test]
fn test_allocator_shared_block_returns_on_last_free() {
    let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 2, 16);
    let block = allocator.allocate().unwrap();
    assert_eq!(allocator.increment_ref(block).unwrap(), 2);

    assert!(!allocator.free(block).unwrap());
    assert_eq!(allocator.num_free_blocks(), 1);
    assert!(allocator.free(block).unwrap());
    assert_eq!(allocator.num_free_blocks(), 2);

    assert!(matches!(
        allocator.free(block),
        Err(Error::DoubleFree { .. })
    ));
    allocator.validate().unwrap();
}

#[test]
fn test_allocator_rejects_sharing_free_block() {
    let mut allocator = BlockAllocator::new(BlockDevice::Cpu, 2, 16);
    assert!(matches!(
        allocator.increment_ref(1),
        Err(Error::InvariantViolation(_))
    ));
}
