//! Continuous batching scheduler.
//!
//! The scheduler owns every unfinished request and decides, once per
//! iteration, which of them run and which cache-block operations must happen
//! before they do.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_seq_group()                                   schedule()
//!        │                                                │
//!        ▼            prefill pass                        ▼
//!   ┌─────────┐  (swapped queue empty, budgets)    ┌─────────────┐
//!   │ Waiting │ ──────────────────────────────────►│   Running   │
//!   │  Queue  │                                    │    Queue    │
//!   └─────────┘ ◄───────── recompute ──────────────└─────────────┘
//!                                                     │      ▲
//!                                          swap out   │      │  swap in
//!                                                     ▼      │
//!                                                  ┌─────────────┐
//!                                                  │   Swapped   │
//!                                                  └─────────────┘
//! ```
//!
//! An iteration is either a prompt run (some group was admitted or ignored)
//! or a decode run (every running group advances by one token, preempting
//! from the back of the queue when the cache is full, then swapping groups
//! back in if nothing was preempted).
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//! use nano_serve::config::{CacheConfig, SamplingConfig, SchedulerConfig};
//! use nano_serve::core::sequence::{Sequence, SequenceGroup};
//! use nano_serve::scheduler::Scheduler;
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), &CacheConfig::default());
//!
//! let seq = Sequence::new(1, vec![1, 2, 3, 4], 16);
//! let group = SequenceGroup::new("req-1", seq, SamplingConfig::default(), Instant::now());
//! scheduler.add_seq_group(group).unwrap();
//!
//! // Schedule iteration
//! let (metadata, outputs) = scheduler.schedule().unwrap();
//! assert!(outputs.prompt_run);
//! assert_eq!(metadata.len(), 1);
//! assert_eq!(outputs.num_batched_tokens, 4);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{AdmissionMode, CacheConfig, PreemptionMode, SamplingConfig, SchedulerConfig};
use crate::core::block_manager::{AllocStatus, BlockManager};
use crate::core::sequence::{RequestId, SequenceGroup, SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::scheduler::policy::{policy_for, Policy};

/// Output of a scheduling step: the execution plan for one iteration.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Groups to run this iteration, in execution order.
    pub scheduled: Vec<RequestId>,
    /// `true` for a prompt (prefill) run, `false` for a decode run.
    pub prompt_run: bool,
    /// Tokens processed this iteration.
    pub num_batched_tokens: usize,
    /// CPU block -> GPU block copies to perform before execution.
    pub blocks_to_swap_in: HashMap<usize, usize>,
    /// GPU block -> CPU block copies to perform before execution.
    pub blocks_to_swap_out: HashMap<usize, usize>,
    /// Source GPU block -> copy-on-write destinations.
    pub blocks_to_copy: HashMap<usize, Vec<usize>>,
    /// Groups finalized as ignored (prompt can never fit).
    pub ignored_seq_groups: Vec<SequenceGroup>,
    /// Groups finalized as aborted by preemption or external release.
    pub aborted_seq_groups: Vec<SequenceGroup>,
    /// Ids of every group preempted or released this iteration.
    pub preempted: Vec<RequestId>,
}

impl SchedulerOutputs {
    /// Check if there is anything to execute.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }

    /// Swap-in and swap-out never share an iteration.
    fn check(&self) -> Result<()> {
        if !self.blocks_to_swap_in.is_empty() && !self.blocks_to_swap_out.is_empty() {
            return Err(Error::InvariantViolation(
                "plan swaps blocks both in and out".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-group input the executor needs to run one iteration.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata {
    pub request_id: RequestId,
    pub is_prompt: bool,
    /// Full token history of each running sequence.
    pub seq_data: HashMap<SequenceId, Vec<u32>>,
    pub sampling: SamplingConfig,
    /// Physical GPU block ids of each running sequence.
    pub block_tables: HashMap<SequenceId, Vec<usize>>,
}

/// Continuous batching scheduler.
///
/// Every unfinished group lives in exactly one of the waiting, running,
/// swapped or executing queues. The executing queue is only used with
/// external admission, between `schedule` and `complete_execution`.
#[derive(Debug)]
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block manager for the paged cache.
    block_manager: BlockManager,
    /// Ordering policy for running and swapped groups.
    policy: Box<dyn Policy>,
    waiting: VecDeque<SequenceGroup>,
    running: VecDeque<SequenceGroup>,
    swapped: VecDeque<SequenceGroup>,
    /// Dispatched groups not yet confirmed back (external admission).
    executing: VecDeque<SequenceGroup>,
    /// Ids of every group held in a queue.
    requests_in_queue: HashSet<RequestId>,
    /// Counter for arrival ordering.
    arrival_counter: u64,
}

impl Scheduler {
    /// Create a new scheduler with its own block manager.
    pub fn new(config: SchedulerConfig, cache: &CacheConfig) -> Self {
        Self {
            policy: policy_for(config.policy),
            config,
            block_manager: BlockManager::new(
                cache.block_size,
                cache.num_gpu_blocks,
                cache.num_cpu_blocks,
                cache.sliding_window,
            ),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            executing: VecDeque::new(),
            requests_in_queue: HashSet::new(),
            arrival_counter: 0,
        }
    }

    /// Enqueue a new group at the back of the waiting queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] if a group with the same id is
    /// still queued.
    pub fn add_seq_group(&mut self, mut seq_group: SequenceGroup) -> Result<()> {
        let request_id = seq_group.request_id().to_string();
        if self.requests_in_queue.contains(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        seq_group.set_arrival_order(self.arrival_counter);
        self.arrival_counter += 1;
        self.requests_in_queue.insert(request_id);
        self.waiting.push_back(seq_group);
        Ok(())
    }

    /// Cancel groups by id.
    ///
    /// Removes them from whichever queue holds them, finalizes unfinished
    /// sequences as aborted and releases their blocks. Unknown ids are
    /// ignored.
    pub fn abort_seq_group<I, S>(&mut self, request_ids: I) -> Result<Vec<SequenceGroup>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.finalize_groups(request_ids, SequenceStatus::FinishedAborted)
    }

    /// Finalize groups an external controller reports as done.
    ///
    /// Same as [`abort_seq_group`](Self::abort_seq_group), but sequences
    /// finish as stopped.
    pub fn release_seq_group<I, S>(&mut self, request_ids: I) -> Result<Vec<SequenceGroup>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.finalize_groups(request_ids, SequenceStatus::FinishedStopped)
    }

    fn finalize_groups<I, S>(
        &mut self,
        request_ids: I,
        status: SequenceStatus,
    ) -> Result<Vec<SequenceGroup>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: HashSet<String> = request_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .filter(|id| self.requests_in_queue.contains(id))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::with_capacity(ids.len());
        for queue in [
            &mut self.waiting,
            &mut self.running,
            &mut self.swapped,
            &mut self.executing,
        ] {
            let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(queue)
                .into_iter()
                .partition(|g| ids.contains(g.request_id()));
            *queue = kept;
            removed.extend(taken);
        }

        for group in &mut removed {
            group.finish_all(status)?;
            for seq_id in group.seq_ids(None) {
                self.block_manager.free(seq_id)?;
            }
            self.requests_in_queue.remove(group.request_id());
            debug!(request_id = group.request_id(), status = status.as_str(), "finalized");
        }
        Ok(removed)
    }

    /// Check if any group is still queued.
    pub fn has_unfinished_seqs(&self) -> bool {
        self.get_num_unfinished_seq_groups() > 0
    }

    /// Number of groups still queued.
    pub fn get_num_unfinished_seq_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len() + self.executing.len()
    }

    /// Schedule the next iteration.
    ///
    /// Returns the per-group executor inputs together with the plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSwapSpace`] when a mandated swap-out cannot
    /// fit on the CPU tier. The group being preempted is left untouched and
    /// the queues stay consistent, but the iteration produces no plan.
    pub fn schedule(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)> {
        let outputs = self.schedule_inner()?;
        outputs.check()?;

        let groups: HashMap<&str, &SequenceGroup> = self
            .running
            .iter()
            .chain(self.executing.iter())
            .map(|g| (g.request_id(), g))
            .collect();

        let metadata = outputs
            .scheduled
            .iter()
            .map(|id| {
                let group = groups
                    .get(id.as_str())
                    .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
                self.metadata_for(group, outputs.prompt_run)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((metadata, outputs))
    }

    fn metadata_for(&self, group: &SequenceGroup, is_prompt: bool) -> Result<SequenceGroupMetadata> {
        let mut seq_data = HashMap::new();
        let mut block_tables = HashMap::new();
        for seq in group.get_seqs(Some(SequenceStatus::Running)) {
            let table = self
                .block_manager
                .get_block_table_ids(seq.seq_id())
                .ok_or(Error::BlockTableNotFound(seq.seq_id()))?;
            seq_data.insert(seq.seq_id(), seq.all_token_ids());
            block_tables.insert(seq.seq_id(), table);
        }
        Ok(SequenceGroupMetadata {
            request_id: group.request_id().to_string(),
            is_prompt,
            seq_data,
            sampling: group.sampling().clone(),
            block_tables,
        })
    }

    fn schedule_inner(&mut self) -> Result<SchedulerOutputs> {
        let mut outputs = SchedulerOutputs::default();
        let now = Instant::now();

        // New prompts wait while anything is swapped out
        if self.swapped.is_empty() {
            self.schedule_prefill(&mut outputs)?;
            if !outputs.scheduled.is_empty() || !outputs.ignored_seq_groups.is_empty() {
                outputs.prompt_run = true;
                return Ok(outputs);
            }
        }

        self.schedule_decode(now, &mut outputs)?;
        Ok(outputs)
    }

    fn schedule_prefill(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        let prompt_limit = self.config.prompt_limit();
        let mut num_curr_seqs: usize = self
            .running
            .iter()
            .map(SequenceGroup::get_max_num_running_seqs)
            .sum();
        let mut num_batched_tokens = 0;

        while let Some(group) = self.waiting.front() {
            let num_prompt_tokens = group
                .get_seqs(Some(SequenceStatus::Waiting))
                .first()
                .map_or(0, |seq| seq.len());

            let ignore = if num_prompt_tokens > prompt_limit {
                warn!(
                    request_id = group.request_id(),
                    num_prompt_tokens, prompt_limit, "input prompt is too long"
                );
                true
            } else {
                match self.block_manager.can_allocate(group) {
                    AllocStatus::Later => break,
                    AllocStatus::Never => {
                        warn!(
                            request_id = group.request_id(),
                            num_prompt_tokens, "input prompt exceeds cache capacity"
                        );
                        true
                    }
                    AllocStatus::Ok => false,
                }
            };
            if ignore {
                if let Some(mut group) = self.waiting.pop_front() {
                    group.finish_all(SequenceStatus::FinishedIgnored)?;
                    self.requests_in_queue.remove(group.request_id());
                    outputs.ignored_seq_groups.push(group);
                }
                continue;
            }

            if num_batched_tokens + num_prompt_tokens > self.config.max_num_batched_tokens {
                break;
            }
            let num_new_seqs = group.get_max_num_running_seqs();
            if num_curr_seqs + num_new_seqs > self.config.max_num_seqs {
                break;
            }

            let Some(mut group) = self.waiting.pop_front() else {
                break;
            };
            if let Err(err) = self.block_manager.allocate(&mut group) {
                self.waiting.push_front(group);
                return Err(err);
            }
            num_batched_tokens += num_prompt_tokens;
            num_curr_seqs += num_new_seqs;
            outputs.scheduled.push(group.request_id().to_string());
            self.running.push_back(group);
        }
        outputs.num_batched_tokens = num_batched_tokens;

        // The external controller owns retry of whatever did not fit
        if self.config.admission == AdmissionMode::External && !self.waiting.is_empty() {
            let leftover: Vec<RequestId> = self
                .waiting
                .iter()
                .map(|g| g.request_id().to_string())
                .collect();
            info!(released = ?leftover, "releasing unadmitted requests to the controller");
            let released = self.abort_seq_group(&leftover)?;
            outputs.preempted.extend(leftover);
            outputs.aborted_seq_groups.extend(released);
        }
        Ok(())
    }

    fn schedule_decode(&mut self, now: Instant, outputs: &mut SchedulerOutputs) -> Result<()> {
        let mut running = self
            .policy
            .sort_by_priority(now, std::mem::take(&mut self.running));
        let mut kept: VecDeque<SequenceGroup> = VecDeque::with_capacity(running.len());
        let mut preempted_any = false;

        'groups: while let Some(group) = running.pop_front() {
            while !self.block_manager.can_append_slot(&group) {
                preempted_any = true;
                if let Some(victim) = running.pop_back() {
                    // Lowest priority goes first
                    if let Err((victim, err)) = self.preempt(victim, outputs) {
                        running.push_back(victim);
                        running.push_front(group);
                        self.restore_running(kept, running);
                        return Err(err);
                    }
                } else {
                    // Nothing left to evict but the group itself
                    if let Err((group, err)) = self.preempt(group, outputs) {
                        running.push_front(group);
                        self.restore_running(kept, running);
                        return Err(err);
                    }
                    continue 'groups;
                }
            }
            let appended = self.append_slots(&group, &mut outputs.blocks_to_copy);
            kept.push_back(group);
            if let Err(err) = appended {
                self.restore_running(kept, running);
                return Err(err);
            }
        }

        self.swapped = self
            .policy
            .sort_by_priority(now, std::mem::take(&mut self.swapped));
        if !preempted_any {
            if let Err(err) = self.schedule_swap_in(&mut kept, outputs) {
                self.restore_running(kept, VecDeque::new());
                return Err(err);
            }
        }

        outputs.num_batched_tokens = kept
            .iter()
            .map(|g| g.num_seqs(Some(SequenceStatus::Running)))
            .sum();
        outputs.scheduled = kept.iter().map(|g| g.request_id().to_string()).collect();

        match self.config.admission {
            AdmissionMode::Internal => self.running = kept,
            AdmissionMode::External => self.executing.extend(kept),
        }
        Ok(())
    }

    fn schedule_swap_in(
        &mut self,
        kept: &mut VecDeque<SequenceGroup>,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let mut num_curr_seqs: usize = kept
            .iter()
            .map(SequenceGroup::get_max_num_running_seqs)
            .sum();

        while let Some(group) = self.swapped.front() {
            if self.block_manager.can_swap_in(group) != AllocStatus::Ok {
                break;
            }
            let num_new_seqs = group.get_max_num_running_seqs();
            if num_curr_seqs + num_new_seqs > self.config.max_num_seqs {
                break;
            }

            let Some(mut group) = self.swapped.pop_front() else {
                break;
            };
            match self.block_manager.swap_in(&mut group) {
                Ok(mapping) => outputs.blocks_to_swap_in.extend(mapping),
                Err(err) => {
                    self.swapped.push_front(group);
                    return Err(err);
                }
            }
            let appended = self.append_slots(&group, &mut outputs.blocks_to_copy);
            debug!(request_id = group.request_id(), "swapped in");
            num_curr_seqs += num_new_seqs;
            kept.push_back(group);
            appended?;
        }
        Ok(())
    }

    fn restore_running(&mut self, kept: VecDeque<SequenceGroup>, rest: VecDeque<SequenceGroup>) {
        self.running = kept.into_iter().chain(rest).collect();
    }

    /// Reserve a slot for the newest token of every running sequence.
    fn append_slots(
        &mut self,
        group: &SequenceGroup,
        blocks_to_copy: &mut HashMap<usize, Vec<usize>>,
    ) -> Result<()> {
        for seq in group.get_seqs(Some(SequenceStatus::Running)) {
            if let Some((src, dst)) = self.block_manager.append_slot(seq)? {
                blocks_to_copy.entry(src).or_default().push(dst);
            }
        }
        Ok(())
    }

    /// Mode used to preempt `group`.
    ///
    /// Without a forced mode, single-sequence groups are recomputed and
    /// multi-sequence groups swapped. Recomputing would discard divergent
    /// forked histories, so a multi-sequence group is swapped even if
    /// recomputation is forced.
    fn preemption_mode_for(&self, group: &SequenceGroup) -> PreemptionMode {
        let multi = group.get_max_num_running_seqs() > 1;
        match self.config.forced_preemption_mode() {
            Some(PreemptionMode::Recompute) if multi => PreemptionMode::Swap,
            Some(mode) => mode,
            None if multi => PreemptionMode::Swap,
            None => PreemptionMode::Recompute,
        }
    }

    /// Preempt a running group and place it according to the chosen mode.
    ///
    /// On failure the group is handed back unmodified.
    fn preempt(
        &mut self,
        mut group: SequenceGroup,
        outputs: &mut SchedulerOutputs,
    ) -> std::result::Result<(), (SequenceGroup, Error)> {
        let mode = self.preemption_mode_for(&group);
        debug!(request_id = group.request_id(), ?mode, "preempting");

        let result = match mode {
            PreemptionMode::Swap => self
                .block_manager
                .swap_out(&mut group)
                .map(|mapping| outputs.blocks_to_swap_out.extend(mapping)),
            PreemptionMode::Recompute => self.release_blocks(&group).and_then(|()| {
                group
                    .get_seqs_mut(Some(SequenceStatus::Running))
                    .into_iter()
                    .try_for_each(|seq| seq.set_waiting())
            }),
            PreemptionMode::Abort => self
                .release_blocks(&group)
                .and_then(|()| group.finish_all(SequenceStatus::FinishedAborted)),
        };
        if let Err(err) = result {
            return Err((group, err));
        }

        outputs.preempted.push(group.request_id().to_string());
        match mode {
            PreemptionMode::Swap => self.swapped.push_back(group),
            // Back to the front so it is readmitted first
            PreemptionMode::Recompute => self.waiting.push_front(group),
            PreemptionMode::Abort => {
                self.requests_in_queue.remove(group.request_id());
                outputs.aborted_seq_groups.push(group);
            }
        }
        Ok(())
    }

    fn release_blocks(&mut self, group: &SequenceGroup) -> Result<()> {
        for seq_id in group.seq_ids(Some(SequenceStatus::Running)) {
            self.block_manager.free(seq_id)?;
        }
        Ok(())
    }

    /// Return dispatched groups to the front of the running queue.
    ///
    /// Used with external admission once the executor confirms the groups
    /// came back. Unknown ids are ignored.
    pub fn complete_execution<I, S>(&mut self, request_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: HashSet<String> = request_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        let (returned, still_executing): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.executing)
                .into_iter()
                .partition(|g| ids.contains(g.request_id()));
        self.executing = still_executing;

        let rest = std::mem::take(&mut self.running);
        self.running = returned.into_iter().chain(rest).collect();
    }

    /// Fork a running sequence within its group.
    ///
    /// The child shares every block with the parent until one of them
    /// writes past the shared portion.
    pub fn fork_seq(
        &mut self,
        request_id: &str,
        parent_seq_id: SequenceId,
        child_seq_id: SequenceId,
    ) -> Result<()> {
        let group = self
            .running
            .iter_mut()
            .chain(self.executing.iter_mut())
            .find(|g| g.request_id() == request_id)
            .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
        let parent = group
            .find(parent_seq_id)
            .ok_or(Error::SequenceNotFound(parent_seq_id))?;
        let child = parent.fork(child_seq_id);
        self.block_manager.fork(parent, &child)?;
        group.add(child);
        Ok(())
    }

    /// Release the blocks of a single sequence.
    pub fn free_seq(&mut self, seq_id: SequenceId) -> Result<()> {
        self.block_manager.free(seq_id)
    }

    /// Drop finished groups from the running queue.
    pub fn free_finished_seq_groups(&mut self) -> Result<Vec<SequenceGroup>> {
        let (finished, running): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(SequenceGroup::is_finished);
        self.running = running;

        for group in &finished {
            for seq_id in group.seq_ids(None) {
                self.block_manager.free(seq_id)?;
            }
            self.requests_in_queue.remove(group.request_id());
        }
        Ok(finished.into())
    }

    /// Look up a queued group by id.
    pub fn get_seq_group(&self, request_id: &str) -> Option<&SequenceGroup> {
        self.waiting
            .iter()
            .chain(&self.running)
            .chain(&self.swapped)
            .chain(&self.executing)
            .find(|g| g.request_id() == request_id)
    }

    /// Look up a queued group by id, mutably.
    pub fn get_seq_group_mut(&mut self, request_id: &str) -> Option<&mut SequenceGroup> {
        self.waiting
            .iter_mut()
            .chain(self.running.iter_mut())
            .chain(self.swapped.iter_mut())
            .chain(self.executing.iter_mut())
            .find(|g| g.request_id() == request_id)
    }

    /// Get number of waiting groups.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running groups.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Get number of swapped groups.
    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    /// Get number of dispatched groups awaiting `complete_execution`.
    pub fn num_executing(&self) -> usize {
        self.executing.len()
    }

    /// Ids of the waiting groups, front first.
    pub fn waiting_ids(&self) -> Vec<&str> {
        self.waiting.iter().map(SequenceGroup::request_id).collect()
    }

    /// Ids of the running groups, front first.
    pub fn running_ids(&self) -> Vec<&str> {
        self.running.iter().map(SequenceGroup::request_id).collect()
    }

    /// Ids of the swapped groups, front first.
    pub fn swapped_ids(&self) -> Vec<&str> {
        self.swapped.iter().map(SequenceGroup::request_id).collect()
    }

    /// Ids of every tracked group, in no particular order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests_in_queue.iter().cloned().collect()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get block manager reference.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Check queue partitioning, sequence statuses and the block census.
    pub fn validate(&self) -> Result<()> {
        let queues = [
            (&self.waiting, SequenceStatus::Waiting, "waiting"),
            (&self.running, SequenceStatus::Running, "running"),
            (&self.swapped, SequenceStatus::Swapped, "swapped"),
            (&self.executing, SequenceStatus::Running, "executing"),
        ];

        let mut seen = HashSet::new();
        for (queue, status, name) in queues {
            for group in queue {
                if !seen.insert(group.request_id()) {
                    return Err(Error::InvariantViolation(format!(
                        "request {} is queued twice",
                        group.request_id()
                    )));
                }
                if let Some(seq) = group
                    .seqs()
                    .iter()
                    .find(|s| !s.is_finished() && s.status() != status)
                {
                    return Err(Error::InvariantViolation(format!(
                        "sequence {} is {} in the {name} queue",
                        seq.seq_id(),
                        seq.status().as_str()
                    )));
                }
            }
        }
        if seen.len() != self.requests_in_queue.len()
            || seen.iter().any(|id| !self.requests_in_queue.contains(*id))
        {
            return Err(Error::InvariantViolation(
                "queued ids out of sync with the queues".to_string(),
            ));
        }
        self.block_manager.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sequence::Sequence;

    fn test_scheduler(max_batched: usize, gpu_blocks: usize) -> Scheduler {
        let config = SchedulerConfig {
            max_num_batched_tokens: max_batched,
            max_num_seqs: 8,
            max_model_len: max_batched,
            ..Default::default()
        };
        let cache = CacheConfig {
            block_size: 4,
            num_gpu_blocks: gpu_blocks,
            num_cpu_blocks: 8,
            sliding_window: None,
        };
        Scheduler::new(config, &cache)
    }

    fn group(id: &str, seq_id: SequenceId, prompt_len: usize) -> SequenceGroup {
        SequenceGroup::new(
            id,
            Sequence::new(seq_id, (0..prompt_len as u32).collect(), 4),
            SamplingConfig::default(),
            Instant::now(),
        )
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut scheduler = test_scheduler(64, 16);
        scheduler.add_seq_group(group("a", 0, 4)).unwrap();
        assert!(matches!(
            scheduler.add_seq_group(group("a", 1, 4)),
            Err(Error::DuplicateRequest(_))
        ));
        assert_eq!(scheduler.num_waiting(), 1);
    }

    #[test]
    fn test_prefill_then_decode() {
        let mut scheduler = test_scheduler(64, 16);
        scheduler.add_seq_group(group("a", 0, 4)).unwrap();

        let (_, out) = scheduler.schedule().unwrap();
        assert!(out.prompt_run);
        assert_eq!(out.scheduled, vec!["a"]);

        scheduler.get_seq_group_mut("a").unwrap().find_mut(0).unwrap().append_token(7);
        let (meta, out) = scheduler.schedule().unwrap();
        assert!(!out.prompt_run);
        assert_eq!(out.num_batched_tokens, 1);
        assert_eq!(meta[0].seq_data[&0], vec![0, 1, 2, 3, 7]);
        assert_eq!(meta[0].block_tables[&0].len(), 2);
        scheduler.validate().unwrap();
    }

    #[test]
    fn test_empty_schedule() {
        let mut scheduler = test_scheduler(64, 16);
        let (meta, out) = scheduler.schedule().unwrap();
        assert!(meta.is_empty());
        assert!(out.is_empty());
        assert!(!out.prompt_run);
    }

    #[test]
    fn test_preemption_mode_selection() {
        let scheduler = test_scheduler(64, 16);
        let mut g = group("a", 0, 4);
        assert_eq!(scheduler.preemption_mode_for(&g), PreemptionMode::Recompute);

        let child = g.seqs()[0].fork(1);
        g.add(child);
        assert_eq!(scheduler.preemption_mode_for(&g), PreemptionMode::Swap);
    }
}
