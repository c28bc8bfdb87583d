//! Property tests: random workloads keep the scheduler and block manager
//! consistent.

use std::time::Instant;

use nano_serve::config::{CacheConfig, PolicyKind, PreemptionMode, SamplingConfig, SchedulerConfig};
use nano_serve::core::sequence::{Sequence, SequenceGroup, SequenceStatus};
use nano_serve::scheduler::Scheduler;
use proptest::prelude::*;

const BLOCK_SIZE: usize = 4;
const MAX_MODEL_LEN: usize = 16;
const MAX_SEQS_PER_GROUP: usize = 3;
const MAX_REQUESTS: usize = 12;
const GPU_BLOCKS: usize = 16;
// Enough for every request at full length to sit on the CPU at once
const CPU_BLOCKS: usize = MAX_REQUESTS * MAX_SEQS_PER_GROUP * MAX_MODEL_LEN / BLOCK_SIZE;

#[derive(Debug, Clone)]
enum Op {
    Submit { prompt_len: u32, priority: i32 },
    Step,
    Abort(usize),
    Fork(usize),
    Finish(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..=12, 0i32..3).prop_map(|(prompt_len, priority)| Op::Submit { prompt_len, priority }),
        6 => Just(Op::Step),
        1 => any::<usize>().prop_map(Op::Abort),
        2 => any::<usize>().prop_map(Op::Fork),
        1 => any::<usize>().prop_map(Op::Finish),
    ]
}

struct Harness {
    scheduler: Scheduler,
    submitted: Vec<String>,
    next_seq_id: u64,
}

impl Harness {
    fn new(preemption_mode: Option<PreemptionMode>, policy: PolicyKind) -> Self {
        let config = SchedulerConfig {
            max_num_batched_tokens: 64,
            max_num_seqs: 48,
            max_model_len: MAX_MODEL_LEN,
            preemption_mode,
            policy,
            ..Default::default()
        };
        let cache = CacheConfig {
            block_size: BLOCK_SIZE,
            num_gpu_blocks: GPU_BLOCKS,
            num_cpu_blocks: CPU_BLOCKS,
            sliding_window: None,
        };
        Self {
            scheduler: Scheduler::new(config, &cache),
            submitted: Vec::new(),
            next_seq_id: 0,
        }
    }

    fn next_seq_id(&mut self) -> u64 {
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    fn running_id(&self, idx: usize) -> Option<String> {
        let ids = self.scheduler.running_ids();
        if ids.is_empty() {
            return None;
        }
        Some(ids[idx % ids.len()].to_string())
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        match *op {
            Op::Submit { prompt_len, priority } => {
                if self.submitted.len() < MAX_REQUESTS {
                    let request_id = format!("r{}", self.submitted.len());
                    let seq_id = self.next_seq_id();
                    let seq = Sequence::new(seq_id, (0..prompt_len).collect(), BLOCK_SIZE);
                    let group =
                        SequenceGroup::new(&request_id, seq, SamplingConfig::default(), Instant::now())
                            .with_priority(priority);
                    prop_assert!(self.scheduler.add_seq_group(group).is_ok());
                    self.submitted.push(request_id);
                }
            }
            Op::Step => self.step()?,
            Op::Abort(idx) => {
                if !self.submitted.is_empty() {
                    let request_id = self.submitted[idx % self.submitted.len()].clone();
                    prop_assert!(self.scheduler.abort_seq_group([request_id]).is_ok());
                }
            }
            Op::Fork(idx) => {
                let Some(request_id) = self.running_id(idx) else {
                    return Ok(());
                };
                let parent = {
                    let group = self.scheduler.get_seq_group(&request_id).unwrap();
                    if group.num_seqs(None) >= MAX_SEQS_PER_GROUP {
                        return Ok(());
                    }
                    group.seq_ids(Some(SequenceStatus::Running)).first().copied()
                };
                if let Some(parent) = parent {
                    let child = self.next_seq_id();
                    prop_assert!(self.scheduler.fork_seq(&request_id, parent, child).is_ok());
                }
            }
            Op::Finish(idx) => {
                let Some(request_id) = self.running_id(idx) else {
                    return Ok(());
                };
                let group = self.scheduler.get_seq_group_mut(&request_id).unwrap();
                let finished = group
                    .get_seqs_mut(Some(SequenceStatus::Running))
                    .into_iter()
                    .next()
                    .map(|seq| {
                        seq.set_finished(SequenceStatus::FinishedStopped).unwrap();
                        seq.seq_id()
                    });
                if let Some(seq_id) = finished {
                    prop_assert!(self.scheduler.free_seq(seq_id).is_ok());
                }
                prop_assert!(self.scheduler.free_finished_seq_groups().is_ok());
            }
        }
        prop_assert!(
            self.scheduler.validate().is_ok(),
            "{:?}",
            self.scheduler.validate()
        );
        Ok(())
    }

    /// Schedule one iteration and stand in for the executor.
    fn step(&mut self) -> Result<(), TestCaseError> {
        let (metadata, outputs) = match self.scheduler.schedule() {
            Ok(plan) => plan,
            Err(err) => return Err(TestCaseError::fail(format!("schedule failed: {err}"))),
        };

        prop_assert!(outputs.blocks_to_swap_in.is_empty() || outputs.blocks_to_swap_out.is_empty());
        prop_assert_eq!(metadata.len(), outputs.scheduled.len());
        if outputs.prompt_run {
            prop_assert!(outputs.num_batched_tokens <= 64);
            prop_assert!(outputs.blocks_to_swap_in.is_empty());
        }
        for m in &metadata {
            for (seq_id, tokens) in &m.seq_data {
                let table = &m.block_tables[seq_id];
                prop_assert_eq!(table.len(), tokens.len().div_ceil(BLOCK_SIZE));
            }
        }

        let mut finished = Vec::new();
        for request_id in &outputs.scheduled {
            let group = self.scheduler.get_seq_group_mut(request_id).unwrap();
            for seq in group.get_seqs_mut(Some(SequenceStatus::Running)) {
                seq.append_token(1);
                if seq.len() >= MAX_MODEL_LEN {
                    seq.set_finished(SequenceStatus::FinishedLengthCapped).unwrap();
                    finished.push(seq.seq_id());
                }
            }
        }
        for seq_id in finished {
            prop_assert!(self.scheduler.free_seq(seq_id).is_ok());
        }
        prop_assert!(self.scheduler.free_finished_seq_groups().is_ok());
        Ok(())
    }

    /// Step until every request finishes, then check nothing leaked.
    fn drain(&mut self) -> Result<(), TestCaseError> {
        for _ in 0..2000 {
            if !self.scheduler.has_unfinished_seqs() {
                break;
            }
            self.step()?;
            prop_assert!(self.scheduler.validate().is_ok());
        }
        prop_assert!(!self.scheduler.has_unfinished_seqs());

        let bm = self.scheduler.block_manager();
        prop_assert_eq!(bm.num_free_gpu_blocks(), GPU_BLOCKS);
        prop_assert_eq!(bm.num_free_cpu_blocks(), CPU_BLOCKS);
        prop_assert_eq!(bm.num_block_tables(), 0);
        Ok(())
    }
}

fn preemption_mode() -> impl Strategy<Value = Option<PreemptionMode>> {
    prop_oneof![
        Just(None),
        Just(Some(PreemptionMode::Swap)),
        Just(Some(PreemptionMode::Recompute)),
    ]
}

fn policy() -> impl Strategy<Value = PolicyKind> {
    prop_oneof![Just(PolicyKind::Fcfs), Just(PolicyKind::Priority)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_random_workload_stays_consistent(
        mode in preemption_mode(),
        policy in policy(),
        ops in prop::collection::vec(op(), 1..80),
    ) {
        let mut harness = Harness::new(mode, policy);
        for op in &ops {
            harness.apply(op)?;
        }
        harness.drain()?;
    }

    #[test]
    fn prop_swapped_groups_hold_no_gpu_blocks(
        ops in prop::collection::vec(op(), 1..80),
    ) {
        let mut harness = Harness::new(Some(PreemptionMode::Swap), PolicyKind::Fcfs);
        for op in &ops {
            harness.apply(op)?;
            let bm = harness.scheduler.block_manager();
            let gpu_in_use = GPU_BLOCKS - bm.num_free_gpu_blocks();
            let cpu_in_use = CPU_BLOCKS - bm.num_free_cpu_blocks();
            prop_assert_eq!(cpu_in_use == 0, harness.scheduler.num_swapped() == 0);
            prop_assert!(gpu_in_use <= GPU_BLOCKS);
        }
    }
}
