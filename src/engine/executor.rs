//! Compute collaborator seam.
//!
//! The engine hands each iteration's plan to a [`ModelExecutor`] and gets
//! back the next token of every scheduled sequence. Executors may run the
//! model in-process or forward the request to remote workers; the engine
//! only awaits the result.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};
use crate::scheduler::{SchedulerOutputs, SequenceGroupMetadata};

/// Everything an executor needs to run one iteration.
#[derive(Debug, Clone, Default)]
pub struct ExecuteModelRequest {
    pub seq_group_metadata_list: Vec<SequenceGroupMetadata>,
    pub blocks_to_swap_in: HashMap<usize, usize>,
    pub blocks_to_swap_out: HashMap<usize, usize>,
    pub blocks_to_copy: HashMap<usize, Vec<usize>>,
}

impl ExecuteModelRequest {
    /// Build a request from a schedule.
    pub fn new(
        seq_group_metadata_list: Vec<SequenceGroupMetadata>,
        outputs: &SchedulerOutputs,
    ) -> Self {
        Self {
            seq_group_metadata_list,
            blocks_to_swap_in: outputs.blocks_to_swap_in.clone(),
            blocks_to_swap_out: outputs.blocks_to_swap_out.clone(),
            blocks_to_copy: outputs.blocks_to_copy.clone(),
        }
    }
}

/// Result for one sequence of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOutput {
    pub seq_id: SequenceId,
    /// Newly generated tokens, usually exactly one.
    pub token_ids: Vec<u32>,
    /// The executor ended generation for this sequence.
    pub finished: bool,
}

/// Runs the model over a scheduled batch.
#[async_trait]
pub trait ModelExecutor: Send {
    /// Execute one iteration and return one output per running sequence.
    async fn execute_model(&mut self, request: ExecuteModelRequest) -> Result<Vec<SequenceOutput>>;
}

#[async_trait]
impl<E: ModelExecutor + ?Sized> ModelExecutor for Box<E> {
    async fn execute_model(&mut self, request: ExecuteModelRequest) -> Result<Vec<SequenceOutput>> {
        (**self).execute_model(request).await
    }
}

/// Turns prompt text into token ids.
pub trait Tokenize: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// One token per UTF-8 byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl Tokenize for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        if text.is_empty() {
            return Err(Error::Tokenization("empty prompt".to_string()));
        }
        Ok(text.bytes().map(u32::from).collect())
    }
}

/// Executor that samples random tokens.
///
/// Deterministic for a given seed; used by the CLI driver and tests.
#[derive(Debug)]
pub struct SyntheticExecutor {
    rng: StdRng,
    vocab_size: u32,
    /// Chance that a sequence ends on any given step.
    finish_probability: f64,
    /// Simulated execution time per iteration.
    step_delay: Option<Duration>,
    num_steps: u64,
}

impl SyntheticExecutor {
    pub fn new(seed: u64, vocab_size: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            vocab_size: vocab_size.max(1),
            finish_probability: 0.0,
            step_delay: None,
            num_steps: 0,
        }
    }

    pub fn with_finish_probability(mut self, p: f64) -> Self {
        self.finish_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Iterations executed so far.
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }
}

#[async_trait]
impl ModelExecutor for SyntheticExecutor {
    async fn execute_model(&mut self, request: ExecuteModelRequest) -> Result<Vec<SequenceOutput>> {
        if let Some(delay) = self.step_delay {
            tokio::time::sleep(delay).await;
        }
        self.num_steps += 1;

        let mut outputs = Vec::new();
        for metadata in &request.seq_group_metadata_list {
            let mut seq_ids: Vec<_> = metadata.seq_data.keys().copied().collect();
            seq_ids.sort_unstable();
            for seq_id in seq_ids {
                outputs.push(SequenceOutput {
                    seq_id,
                    token_ids: vec![self.rng.gen_range(0..self.vocab_size)],
                    finished: self.rng.gen_bool(self.finish_probability),
                });
            }
        }
        Ok(outputs)
    }
}
