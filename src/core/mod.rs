//! Core infrastructure for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged cache
//! - BlockAllocator for one tier's free list and ref counts
//! - BlockManager for block-table bookkeeping, fork and swap
//! - Sequence and SequenceGroup for request tracking

pub mod block;
pub mod block_allocator;
pub mod block_manager;
pub mod sequence;

pub use block::{BlockDevice, BlockTable};
pub use block_manager::{AllocStatus, BlockManager};
pub use sequence::{FinishReason, RequestId, Sequence, SequenceGroup, SequenceId, SequenceStatus};
