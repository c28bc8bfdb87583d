//! Sequence tracking for inference requests.
//!
//! A [`Sequence`] is one token stream under generation. A [`SequenceGroup`]
//! is a submitted request: one prompt, one or more sequences sharing it, and
//! the sampling configuration. The scheduler queues groups, the block manager
//! maps each sequence id to a block table.

use std::time::Instant;

use crate::config::SamplingConfig;
use crate::core::block::compute_num_blocks;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Caller-chosen identifier for a request (sequence group).
pub type RequestId = String;

/// Priority level for scheduling.
///
/// Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Status of a sequence in the scheduler.
///
/// ```text
/// Waiting ──► Running ──► Swapped ──► Running
///    │           │
///    │           ├──► FinishedStopped / FinishedLengthCapped / FinishedAborted
///    │           └──► Waiting (recompute)
///    └──► FinishedIgnored / FinishedAborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Blocks moved to the secondary tier (preempted).
    Swapped,
    /// Stop token generated or the executor reported completion.
    FinishedStopped,
    /// `max_tokens` or `max_model_len` reached.
    FinishedLengthCapped,
    /// Cancelled by the caller or preempted in abort mode.
    FinishedAborted,
    /// Prompt can never fit; never allocated.
    FinishedIgnored,
}

impl SequenceStatus {
    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::FinishedStopped
                | Self::FinishedLengthCapped
                | Self::FinishedAborted
                | Self::FinishedIgnored
        )
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::FinishedStopped => "FinishedStopped",
            Self::FinishedLengthCapped => "FinishedLengthCapped",
            Self::FinishedAborted => "FinishedAborted",
            Self::FinishedIgnored => "FinishedIgnored",
        }
    }

    /// Reason reported to the caller for a terminal status.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::FinishedStopped => Some(FinishReason::Stopped),
            Self::FinishedLengthCapped => Some(FinishReason::Length),
            Self::FinishedAborted => Some(FinishReason::Aborted),
            Self::FinishedIgnored => Some(FinishReason::Ignored),
            _ => None,
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// Stop token generated, or the executor ended generation.
    Stopped,
    /// Maximum token limit reached.
    Length,
    /// Aborted by user or system.
    Aborted,
    /// Prompt too long to ever be scheduled.
    Ignored,
}

impl FinishReason {
    /// Short name, as surfaced in outputs and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stop",
            Self::Length => "length",
            Self::Aborted => "abort",
            Self::Ignored => "ignored",
        }
    }
}

/// A single token stream under generation.
///
/// # Example
///
/// ```
/// use nano_serve::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4], 16);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.output_len(), 0);
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs.
    output_token_ids: Vec<u32>,
    /// Current status.
    status: SequenceStatus,
    /// Tokens per cache block.
    block_size: usize,
}

impl Sequence {
    /// Create a new waiting sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            status: SequenceStatus::Waiting,
            block_size,
        }
    }

    /// Copy this sequence's history under a new id, for a fork.
    pub fn fork(&self, child_id: SequenceId) -> Self {
        Self {
            seq_id: child_id,
            ..self.clone()
        }
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Check whether the sequence has no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks needed to cover the full token history.
    pub fn num_logical_blocks(&self) -> usize {
        compute_num_blocks(self.len(), self.block_size)
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(self.invalid_transition("Running")),
        }
    }

    /// Transition back to waiting (preempted by recomputation).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(self.invalid_transition("Waiting")),
        }
    }

    /// Transition to swapped state (preempted by swap-out).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(self.invalid_transition("Swapped")),
        }
    }

    /// Move to a terminal status.
    ///
    /// `FinishedIgnored` is only reachable from `Waiting`; a finished
    /// sequence stays finished.
    ///
    /// # Errors
    ///
    /// Returns error if `status` is not terminal or the transition is invalid.
    pub fn set_finished(&mut self, status: SequenceStatus) -> Result<()> {
        let allowed = status.is_finished()
            && !self.status.is_finished()
            && (status != SequenceStatus::FinishedIgnored
                || self.status == SequenceStatus::Waiting);
        if !allowed {
            return Err(self.invalid_transition(status.as_str()));
        }
        self.status = status;
        Ok(())
    }

    fn invalid_transition(&self, to: &'static str) -> Error {
        Error::InvalidStateTransition {
            from: self.status.as_str(),
            to,
        }
    }
}

/// A submitted request: a prompt, its sequences, and how to sample them.
///
/// Requests start with exactly one sequence; more appear only through an
/// explicit fork.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    request_id: RequestId,
    seqs: Vec<Sequence>,
    sampling: SamplingConfig,
    arrival_time: Instant,
    /// Submission counter, breaks arrival-time ties.
    arrival_order: u64,
    priority: Priority,
    /// Original prompt text, if the request came in as text.
    prompt: Option<String>,
}

impl SequenceGroup {
    /// Create a group around a single waiting sequence.
    pub fn new(
        request_id: impl Into<RequestId>,
        seq: Sequence,
        sampling: SamplingConfig,
        arrival_time: Instant,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            seqs: vec![seq],
            sampling,
            arrival_time,
            arrival_order: 0,
            priority: DEFAULT_PRIORITY,
            prompt: None,
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the original prompt text.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    pub(crate) fn set_arrival_order(&mut self, order: u64) {
        self.arrival_order = order;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Prompt tokens, shared by every sequence in the group.
    pub fn prompt_token_ids(&self) -> &[u32] {
        self.seqs
            .first()
            .map(Sequence::prompt_token_ids)
            .unwrap_or_default()
    }

    /// All sequences, in insertion order.
    pub fn seqs(&self) -> &[Sequence] {
        &self.seqs
    }

    /// Sequences with the given status, or all of them.
    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<&Sequence> {
        self.seqs
            .iter()
            .filter(|s| status.map_or(true, |st| s.status() == st))
            .collect()
    }

    /// Mutable sequences with the given status, or all of them.
    pub fn get_seqs_mut(&mut self, status: Option<SequenceStatus>) -> Vec<&mut Sequence> {
        self.seqs
            .iter_mut()
            .filter(|s| status.map_or(true, |st| s.status() == st))
            .collect()
    }

    /// Ids of the sequences with the given status, or all of them.
    pub fn seq_ids(&self, status: Option<SequenceStatus>) -> Vec<SequenceId> {
        self.get_seqs(status).iter().map(|s| s.seq_id()).collect()
    }

    pub fn num_seqs(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.seqs.iter().filter(|s| !s.is_finished()).count()
    }

    /// Upper bound on sequences this group runs concurrently.
    pub fn get_max_num_running_seqs(&self) -> usize {
        self.num_unfinished_seqs()
    }

    pub fn find(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id() == seq_id)
    }

    pub fn find_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Add a sequence (a fork of an existing one).
    pub fn add(&mut self, seq: Sequence) {
        self.seqs.push(seq);
    }

    /// Finalize every unfinished sequence with `status`.
    pub fn finish_all(&mut self, status: SequenceStatus) -> Result<()> {
        for seq in self.seqs.iter_mut().filter(|s| !s.is_finished()) {
            seq.set_finished(status)?;
        }
        Ok(())
    }

    /// A group is finished once all of its sequences are.
    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(Sequence::is_finished)
    }

    /// Finish reason of the first sequence, once the group is finished.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        if !self.is_finished() {
            return None;
        }
        self.seqs.first().and_then(|s| s.status().finish_reason())
    }
}
