//! Paged cache block manager.
//!
//! The `BlockManager` owns both block tiers and every block table. It is the
//! capacity oracle the scheduler consults (`can_*` queries) and the actuator
//! that mutates cache layout (`allocate`, `append_slot`, `fork`, `swap_*`,
//! `free`).
//!
//! ```text
//!   seq 1 table: [ 3 ][ 7 ][ 9 ]          GPU arena
//!   seq 2 table: [ 3 ][ 7 ][ 4 ]   ──►    3: rc=2   7: rc=2
//!                  shared after fork      9: rc=1   4: rc=1
//! ```
//!
//! Forking shares every block; the first `append_slot` that would write into
//! a shared trailing block copies it (copy-on-write) and reports the
//! `(src, dst)` pair so the executor can replicate its contents.
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//! use nano_serve::config::SamplingConfig;
//! use nano_serve::core::block_manager::{AllocStatus, BlockManager};
//! use nano_serve::core::sequence::{Sequence, SequenceGroup};
//!
//! let mut manager = BlockManager::new(4, 8, 8, None);
//! let seq = Sequence::new(0, vec![1, 2, 3, 4, 5], 4);
//! let mut group = SequenceGroup::new("req-0", seq, SamplingConfig::default(), Instant::now());
//!
//! assert_eq!(manager.can_allocate(&group), AllocStatus::Ok);
//! manager.allocate(&mut group).unwrap();
//! assert_eq!(manager.num_free_gpu_blocks(), 6);
//!
//! manager.free(0).unwrap();
//! assert_eq!(manager.num_free_gpu_blocks(), 8);
//! ```

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, instrument, trace};

use crate::core::block::{compute_num_blocks, BlockDevice, BlockTable};
use crate::core::block_allocator::BlockAllocator;
use crate::core::sequence::{Sequence, SequenceGroup, SequenceId, SequenceStatus};
use crate::error::{Error, Result};

/// Outcome of an allocation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// Enough free blocks right now.
    Ok,
    /// Not enough free blocks now, but the tier is large enough.
    Later,
    /// The tier can never hold this request.
    Never,
}

/// Manages block tables for every sequence over a GPU and a CPU tier.
#[derive(Debug)]
pub struct BlockManager {
    block_size: usize,
    gpu_allocator: BlockAllocator,
    cpu_allocator: BlockAllocator,
    /// Sequence id -> block table.
    block_tables: HashMap<SequenceId, BlockTable>,
    /// Sliding window expressed in blocks.
    block_sliding_window: Option<usize>,
}

impl BlockManager {
    /// Create a block manager.
    ///
    /// `sliding_window` is in tokens; tables wrap after
    /// `ceil(sliding_window / block_size)` logical blocks.
    pub fn new(
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
        sliding_window: Option<usize>,
    ) -> Self {
        Self {
            block_size,
            gpu_allocator: BlockAllocator::new(BlockDevice::Gpu, num_gpu_blocks, block_size),
            cpu_allocator: BlockAllocator::new(BlockDevice::Cpu, num_cpu_blocks, block_size),
            block_tables: HashMap::new(),
            block_sliding_window: sliding_window
                .map(|window| compute_num_blocks(window, block_size)),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_gpu_blocks(&self) -> usize {
        self.gpu_allocator.num_free_blocks()
    }

    pub fn num_free_cpu_blocks(&self) -> usize {
        self.cpu_allocator.num_free_blocks()
    }

    pub fn num_total_gpu_blocks(&self) -> usize {
        self.gpu_allocator.num_total_blocks()
    }

    pub fn num_total_cpu_blocks(&self) -> usize {
        self.cpu_allocator.num_total_blocks()
    }

    /// Reference count of a physical block.
    pub fn ref_count(&self, device: BlockDevice, block_id: usize) -> usize {
        self.allocator(device).ref_count(block_id)
    }

    pub fn get_block_table(&self, seq_id: SequenceId) -> Option<&BlockTable> {
        self.block_tables.get(&seq_id)
    }

    /// Physical block ids of a sequence, in logical order.
    pub fn get_block_table_ids(&self, seq_id: SequenceId) -> Option<Vec<usize>> {
        self.block_tables
            .get(&seq_id)
            .map(|t| t.get_physical_block_ids().to_vec())
    }

    pub fn num_block_tables(&self) -> usize {
        self.block_tables.len()
    }

    // ========== Allocation ==========

    /// Check whether the waiting prompt of `seq_group` fits on the GPU tier.
    #[instrument(skip_all, fields(request_id = seq_group.request_id()))]
    pub fn can_allocate(&self, seq_group: &SequenceGroup) -> AllocStatus {
        let Some(seq) = seq_group.get_seqs(Some(SequenceStatus::Waiting)).first().copied() else {
            trace!("no waiting sequence to allocate");
            return AllocStatus::Ok;
        };
        let mut num_required = seq.num_logical_blocks();
        if let Some(window) = self.block_sliding_window {
            num_required = num_required.min(window);
        }

        if num_required > self.gpu_allocator.num_total_blocks() {
            AllocStatus::Never
        } else if self.gpu_allocator.can_allocate(num_required) {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Allocate blocks for the waiting sequences of `seq_group` and mark
    /// them running.
    ///
    /// All waiting sequences share one freshly allocated table.
    #[instrument(skip_all, fields(request_id = seq_group.request_id()))]
    pub fn allocate(&mut self, seq_group: &mut SequenceGroup) -> Result<()> {
        let waiting = seq_group.seq_ids(Some(SequenceStatus::Waiting));
        let Some(first) = seq_group.get_seqs(Some(SequenceStatus::Waiting)).first().copied()
        else {
            return Ok(());
        };
        if let Some(&seq_id) = waiting.iter().find(|id| self.block_tables.contains_key(id)) {
            return Err(Error::InvariantViolation(format!(
                "sequence {seq_id} already has a block table"
            )));
        }

        let num_logical = first.num_logical_blocks();
        let num_physical = self
            .block_sliding_window
            .map_or(num_logical, |window| num_logical.min(window));
        if !self.gpu_allocator.can_allocate(num_physical) {
            return Err(Error::OutOfBlocks(BlockDevice::Gpu));
        }

        let mut table = BlockTable::new(self.block_size, BlockDevice::Gpu);
        for logical_idx in 0..num_logical {
            let block_id = match self.block_sliding_window {
                Some(window) if logical_idx >= window => table.get_block_id(logical_idx % window)?,
                _ => self.gpu_allocator.allocate()?,
            };
            table.append_block(block_id);
        }

        // Every further sharer adds one reference per distinct block
        for _ in 1..waiting.len() {
            for block_id in table.unique_block_ids() {
                self.gpu_allocator.increment_ref(block_id)?;
            }
        }
        for seq in seq_group.get_seqs_mut(Some(SequenceStatus::Waiting)) {
            seq.set_running()?;
            self.block_tables.insert(seq.seq_id(), table.clone());
        }
        debug!(
            num_blocks = num_physical,
            num_seqs = waiting.len(),
            "allocated prompt blocks"
        );
        Ok(())
    }

    // ========== Decode slots ==========

    /// Blocks `seq` needs before its newest token has a slot (0 or 1).
    fn num_blocks_to_append(&self, seq: &Sequence) -> usize {
        let Some(table) = self.block_tables.get(&seq.seq_id()) else {
            return 1;
        };
        let last = if table.num_blocks() < seq.num_logical_blocks() {
            match self.block_sliding_window {
                Some(window) if table.num_blocks() >= window => {
                    table.get_physical_block_ids()[table.num_blocks() % window]
                }
                _ => return 1,
            }
        } else {
            match table.last_block_id() {
                Some(id) => id,
                None => return 0,
            }
        };
        usize::from(self.gpu_allocator.ref_count(last) > 1)
    }

    /// Check whether every running sequence of `seq_group` can get one more
    /// token slot, either in its last block or in a new one.
    pub fn can_append_slot(&self, seq_group: &SequenceGroup) -> bool {
        let needed: usize = seq_group
            .get_seqs(Some(SequenceStatus::Running))
            .into_iter()
            .map(|seq| self.num_blocks_to_append(seq))
            .sum();
        needed <= self.gpu_allocator.num_free_blocks()
    }

    /// Make room for the newest token of `seq`.
    ///
    /// Returns `Some((src, dst))` when the trailing block was shared and had
    /// to be copied before writing.
    #[instrument(skip_all, fields(seq_id = seq.seq_id()))]
    pub fn append_slot(&mut self, seq: &Sequence) -> Result<Option<(usize, usize)>> {
        let table = self
            .block_tables
            .get_mut(&seq.seq_id())
            .ok_or(Error::BlockTableNotFound(seq.seq_id()))?;

        if table.num_blocks() < seq.num_logical_blocks() {
            match self.block_sliding_window {
                Some(window) if table.num_blocks() >= window => {
                    let reused = table.get_block_id(table.num_blocks() % window)?;
                    table.append_block(reused);
                }
                _ => {
                    let block_id = self.gpu_allocator.allocate()?;
                    table.append_block(block_id);
                    return Ok(None);
                }
            }
        }

        let Some(last) = table.last_block_id() else {
            return Ok(None);
        };
        if self.gpu_allocator.ref_count(last) <= 1 {
            return Ok(None);
        }

        // Copy on write. Every window alias of the shared block moves to the
        // copy, so the table drops its one reference to the original.
        let new_block = self.gpu_allocator.allocate()?;
        table.replace_block(last, new_block);
        self.gpu_allocator.free(last)?;
        debug!(src = last, dst = new_block, "copy-on-write");
        Ok(Some((last, new_block)))
    }

    /// Share the parent's blocks with a child sequence.
    #[instrument(skip_all, fields(parent = parent.seq_id(), child = child.seq_id()))]
    pub fn fork(&mut self, parent: &Sequence, child: &Sequence) -> Result<()> {
        if self.block_tables.contains_key(&child.seq_id()) {
            return Err(Error::InvariantViolation(format!(
                "fork target {} already has a block table",
                child.seq_id()
            )));
        }
        let table = self
            .block_tables
            .get(&parent.seq_id())
            .ok_or(Error::BlockTableNotFound(parent.seq_id()))?
            .clone();
        let allocator = match table.device() {
            BlockDevice::Gpu => &mut self.gpu_allocator,
            BlockDevice::Cpu => &mut self.cpu_allocator,
        };
        for block_id in table.unique_block_ids() {
            allocator.increment_ref(block_id)?;
        }
        self.block_tables.insert(child.seq_id(), table);
        Ok(())
    }

    // ========== Swapping ==========

    /// Distinct physical blocks across the tables of `seqs`.
    fn distinct_blocks(&self, seqs: &[&Sequence]) -> HashSet<usize> {
        seqs.iter()
            .filter_map(|seq| self.block_tables.get(&seq.seq_id()))
            .flat_map(|table| table.get_physical_block_ids().iter().copied())
            .collect()
    }

    /// Check whether the swapped sequences of `seq_group` fit back on the
    /// GPU tier, with one spare slot each for the next token.
    #[instrument(skip_all, fields(request_id = seq_group.request_id()))]
    pub fn can_swap_in(&self, seq_group: &SequenceGroup) -> AllocStatus {
        let swapped = seq_group.get_seqs(Some(SequenceStatus::Swapped));
        let num_required = self.distinct_blocks(&swapped).len() + swapped.len();

        if num_required > self.gpu_allocator.num_total_blocks() {
            AllocStatus::Never
        } else if self.gpu_allocator.can_allocate(num_required) {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Move the swapped sequences of `seq_group` to the GPU tier and mark
    /// them running.
    ///
    /// Returns the CPU -> GPU block mapping.
    #[instrument(skip_all, fields(request_id = seq_group.request_id()))]
    pub fn swap_in(&mut self, seq_group: &mut SequenceGroup) -> Result<HashMap<usize, usize>> {
        let num_required = self
            .distinct_blocks(&seq_group.get_seqs(Some(SequenceStatus::Swapped)))
            .len();
        if !self.gpu_allocator.can_allocate(num_required) {
            return Err(Error::OutOfBlocks(BlockDevice::Gpu));
        }

        let mut mapping = HashMap::new();
        for seq in seq_group.get_seqs_mut(Some(SequenceStatus::Swapped)) {
            let table = self
                .block_tables
                .get(&seq.seq_id())
                .ok_or(Error::BlockTableNotFound(seq.seq_id()))?;
            let moved = move_table(
                table,
                &mut self.cpu_allocator,
                &mut self.gpu_allocator,
                &mut mapping,
            )?;
            self.block_tables.insert(seq.seq_id(), moved);
            seq.set_running()?;
        }
        debug!(num_blocks = mapping.len(), "swapped in");
        Ok(mapping)
    }

    /// Check whether the running sequences of `seq_group` fit on the CPU tier.
    pub fn can_swap_out(&self, seq_group: &SequenceGroup) -> bool {
        let running = seq_group.get_seqs(Some(SequenceStatus::Running));
        self.cpu_allocator
            .can_allocate(self.distinct_blocks(&running).len())
    }

    /// Move the running sequences of `seq_group` to the CPU tier and mark
    /// them swapped.
    ///
    /// Returns the GPU -> CPU block mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSwapSpace`] without touching any state if the
    /// CPU tier cannot hold the group.
    #[instrument(skip_all, fields(request_id = seq_group.request_id()))]
    pub fn swap_out(&mut self, seq_group: &mut SequenceGroup) -> Result<HashMap<usize, usize>> {
        let required = self
            .distinct_blocks(&seq_group.get_seqs(Some(SequenceStatus::Running)))
            .len();
        let available = self.cpu_allocator.num_free_blocks();
        if required > available {
            error!(required, available, "out of swap space");
            return Err(Error::OutOfSwapSpace {
                required,
                available,
            });
        }

        let mut mapping = HashMap::new();
        for seq in seq_group.get_seqs_mut(Some(SequenceStatus::Running)) {
            let table = self
                .block_tables
                .get(&seq.seq_id())
                .ok_or(Error::BlockTableNotFound(seq.seq_id()))?;
            let moved = move_table(
                table,
                &mut self.gpu_allocator,
                &mut self.cpu_allocator,
                &mut mapping,
            )?;
            self.block_tables.insert(seq.seq_id(), moved);
            seq.set_swapped()?;
        }
        debug!(num_blocks = mapping.len(), "swapped out");
        Ok(mapping)
    }

    // ========== Release ==========

    /// Drop a sequence's table and release one reference per distinct block.
    ///
    /// Sequences without a table (never allocated, or already freed) are a
    /// no-op.
    #[instrument(skip(self))]
    pub fn free(&mut self, seq_id: SequenceId) -> Result<()> {
        let Some(table) = self.block_tables.remove(&seq_id) else {
            return Ok(());
        };
        let allocator = match table.device() {
            BlockDevice::Gpu => &mut self.gpu_allocator,
            BlockDevice::Cpu => &mut self.cpu_allocator,
        };
        for block_id in table.unique_block_ids() {
            allocator.free(block_id)?;
        }
        trace!(num_blocks = table.num_blocks(), "freed block table");
        Ok(())
    }

    /// Free every table and return all blocks to their pools.
    pub fn reset(&mut self) {
        self.block_tables.clear();
        self.gpu_allocator.reset();
        self.cpu_allocator.reset();
    }

    /// Recompute the reference-count census from all block tables and
    /// compare it with both arenas.
    pub fn validate(&self) -> Result<()> {
        let mut census: HashMap<(BlockDevice, usize), usize> = HashMap::new();
        for table in self.block_tables.values() {
            for block_id in table.unique_block_ids() {
                *census.entry((table.device(), block_id)).or_default() += 1;
            }
        }

        for allocator in [&self.gpu_allocator, &self.cpu_allocator] {
            allocator.validate()?;
            for block in allocator.blocks() {
                let expected = census
                    .remove(&(allocator.device(), block.block_id()))
                    .unwrap_or(0);
                if block.ref_count() != expected {
                    return Err(Error::InvariantViolation(format!(
                        "{} block {} has ref count {} but {} tables reference it",
                        allocator.device(),
                        block.block_id(),
                        block.ref_count(),
                        expected
                    )));
                }
            }
        }

        if let Some(((device, block_id), _)) = census.into_iter().next() {
            return Err(Error::InvariantViolation(format!(
                "table references unknown {device} block {block_id}"
            )));
        }
        Ok(())
    }

    fn allocator(&self, device: BlockDevice) -> &BlockAllocator {
        match device {
            BlockDevice::Gpu => &self.gpu_allocator,
            BlockDevice::Cpu => &self.cpu_allocator,
        }
    }
}

/// Copy `table` onto the `dst` tier.
///
/// `mapping` is shared across the tables of one group so blocks shared
/// between sequences stay shared on the destination tier.
fn move_table(
    table: &BlockTable,
    src: &mut BlockAllocator,
    dst: &mut BlockAllocator,
    mapping: &mut HashMap<usize, usize>,
) -> Result<BlockTable> {
    for src_id in table.unique_block_ids() {
        match mapping.get(&src_id) {
            Some(&dst_id) => {
                dst.increment_ref(dst_id)?;
            }
            None => {
                mapping.insert(src_id, dst.allocate()?);
            }
        }
        src.free(src_id)?;
    }

    let block_ids = table
        .get_physical_block_ids()
        .iter()
        .map(|id| {
            mapping
                .get(id)
                .copied()
                .ok_or_else(|| Error::InvariantViolation(format!("unmapped block {id}")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(BlockTable::from_block_ids(
        block_ids,
        table.block_size(),
        dst.device(),
    ))
}
