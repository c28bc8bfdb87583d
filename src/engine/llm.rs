//! Serving engine.
//!
//! The LLMEngine runs one iteration of continuous batching per `step()`:
//! - Scheduler decides what runs and which blocks move
//! - Executor produces the next token of every scheduled sequence
//! - Output processing appends tokens, applies stop conditions and frees
//!   finished sequences
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LLMEngine                              │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!           add_request()    │    step()
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Tokenize │       │    │  Scheduler   │
//!         │  prompt  │       │    │   schedule   │
//!         └──────────┘       │    └──────────────┘
//!                │           │           │
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Scheduler│       │    │   Executor   │
//!         │   add    │       │    │ execute_model│
//!         └──────────┘       │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │ Stop checks, │
//!                            │    │ free blocks  │
//!                            │    └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::executor::{ExecuteModelRequest, ModelExecutor, SequenceOutput, Tokenize};
use crate::config::{AdmissionMode, EngineConfig, SamplingConfig};
use crate::core::sequence::{
    FinishReason, Priority, RequestId, Sequence, SequenceGroup, SequenceId, SequenceStatus,
    DEFAULT_PRIORITY,
};
use crate::error::{Error, Result};
use crate::scheduler::{Scheduler, SchedulerOutputs};

/// Prompt input: raw text or pre-tokenized ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    TokenIds(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(token_ids: Vec<u32>) -> Self {
        Self::TokenIds(token_ids)
    }
}

/// One sequence's progress inside a [`GenerationOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutput {
    pub seq_id: SequenceId,
    /// All tokens generated so far.
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
}

/// Incremental result for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Unique request ID.
    pub request_id: RequestId,
    /// Input prompt text, if the request came in as text.
    pub prompt: Option<String>,
    pub prompt_token_ids: Vec<u32>,
    /// One entry per sequence of the request.
    pub outputs: Vec<CompletionOutput>,
    /// Reason for finishing, once every sequence is done.
    pub finish_reason: Option<FinishReason>,
}

impl GenerationOutput {
    /// Snapshot of a group's current state.
    pub fn from_seq_group(group: &SequenceGroup) -> Self {
        Self {
            request_id: group.request_id().to_string(),
            prompt: group.prompt().map(str::to_string),
            prompt_token_ids: group.prompt_token_ids().to_vec(),
            outputs: group
                .seqs()
                .iter()
                .map(|seq| CompletionOutput {
                    seq_id: seq.seq_id(),
                    token_ids: seq.output_token_ids().to_vec(),
                    finish_reason: seq.status().finish_reason(),
                })
                .collect(),
            finish_reason: group.finish_reason(),
        }
    }

    /// Terminal output for a request cancelled before the engine saw it.
    pub fn aborted(request_id: impl Into<RequestId>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: None,
            prompt_token_ids: Vec::new(),
            outputs: Vec::new(),
            finish_reason: Some(FinishReason::Aborted),
        }
    }

    /// Check whether this is the request's last output.
    pub fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Tokens generated so far by the first sequence.
    pub fn output_token_ids(&self) -> &[u32] {
        self.outputs
            .first()
            .map(|o| o.token_ids.as_slice())
            .unwrap_or_default()
    }
}

/// Request for generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Caller-chosen request ID.
    pub request_id: RequestId,
    /// Prompt text or token ids.
    pub prompt: Prompt,
    /// Sampling configuration for this request.
    pub sampling_config: SamplingConfig,
    /// Priority (higher = more important).
    pub priority: Priority,
    /// Arrival time; defaults to when the engine receives the request.
    pub arrival_time: Option<Instant>,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(request_id: impl Into<RequestId>, prompt: impl Into<Prompt>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            sampling_config: SamplingConfig::default(),
            priority: DEFAULT_PRIORITY,
            arrival_time: None,
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling_config.max_tokens = max_tokens;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling_config.temperature = temperature;
        self
    }

    /// Set top-k sampling parameter.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.sampling_config.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling parameter.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling_config.top_p = top_p;
        self
    }

    /// Set the token ids that end generation.
    pub fn stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.sampling_config.stop_token_ids = stop_token_ids;
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the arrival time.
    pub fn arrival_time(mut self, arrival_time: Instant) -> Self {
        self.arrival_time = Some(arrival_time);
        self
    }
}

/// Serving engine.
///
/// Owns the scheduler (and through it the block manager) and drives the
/// executor once per [`step`](Self::step).
pub struct LLMEngine<E> {
    config: EngineConfig,
    /// Request scheduler.
    scheduler: Scheduler,
    executor: E,
    /// Needed only for text prompts.
    tokenizer: Option<Arc<dyn Tokenize>>,
    /// Counter for sequence IDs.
    seq_counter: SequenceId,
}

impl<E: ModelExecutor> LLMEngine<E> {
    /// Create a new engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is inconsistent.
    pub fn new(config: EngineConfig, executor: E) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: Scheduler::new(config.scheduler.clone(), &config.cache),
            config,
            executor,
            tokenizer: None,
            seq_counter: 0,
        })
    }

    /// Attach a tokenizer for text prompts.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenize>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Add a generation request to the waiting queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] if the id is still in flight, or
    /// [`Error::Tokenization`] if the prompt is empty or is text with no
    /// tokenizer attached.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<()> {
        let (text, prompt_token_ids) = match request.prompt {
            Prompt::TokenIds(ids) => (None, ids),
            Prompt::Text(text) => {
                let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
                    Error::Tokenization("text prompt without a tokenizer".to_string())
                })?;
                let ids = tokenizer.encode(&text)?;
                (Some(text), ids)
            }
        };
        if prompt_token_ids.is_empty() {
            return Err(Error::Tokenization("empty prompt".to_string()));
        }

        if self.config.log_requests {
            let limit = self.config.max_log_len.unwrap_or(usize::MAX);
            let shown_text: Option<String> = text.as_ref().map(|t| t.chars().take(limit).collect());
            let shown_ids = &prompt_token_ids[..prompt_token_ids.len().min(limit)];
            info!(
                request_id = %request.request_id,
                prompt = ?shown_text,
                prompt_token_ids = ?shown_ids,
                sampling = ?request.sampling_config,
                "received request"
            );
        }

        let seq_id = self.seq_counter;
        self.seq_counter += 1;
        let seq = Sequence::new(seq_id, prompt_token_ids, self.config.cache.block_size);
        let mut group = SequenceGroup::new(
            request.request_id,
            seq,
            request.sampling_config,
            request.arrival_time.unwrap_or_else(Instant::now),
        )
        .with_priority(request.priority);
        if let Some(text) = text {
            group = group.with_prompt(text);
        }
        self.scheduler.add_seq_group(group)
    }

    /// Cancel requests by id. Unknown or finished ids are ignored.
    ///
    /// Returns a terminal output for every request actually cancelled.
    pub fn abort_request<I, S>(&mut self, request_ids: I) -> Result<Vec<GenerationOutput>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let aborted = self.scheduler.abort_seq_group(request_ids)?;
        for group in &aborted {
            info!(request_id = group.request_id(), "aborted request");
        }
        Ok(aborted.iter().map(GenerationOutput::from_seq_group).collect())
    }

    /// Run one iteration.
    ///
    /// Returns an output for every request scheduled, ignored or aborted in
    /// this iteration.
    pub async fn step(&mut self) -> Result<Vec<GenerationOutput>> {
        let (metadata, scheduler_outputs) = self.scheduler.schedule()?;
        let mut outputs = Vec::new();

        if !scheduler_outputs.is_empty() {
            let request = ExecuteModelRequest::new(metadata, &scheduler_outputs);
            let result = self.executor.execute_model(request).await;
            if self.config.scheduler.admission == AdmissionMode::External {
                self.scheduler
                    .complete_execution(&scheduler_outputs.scheduled);
            }
            outputs = self.process_model_outputs(&scheduler_outputs, result?)?;
        }

        outputs.extend(
            scheduler_outputs
                .ignored_seq_groups
                .iter()
                .chain(&scheduler_outputs.aborted_seq_groups)
                .map(GenerationOutput::from_seq_group),
        );
        for output in outputs.iter().filter(|o| o.finished()) {
            info!(
                request_id = %output.request_id,
                reason = output.finish_reason.map(|r| r.as_str()),
                "finished request"
            );
        }

        self.scheduler.free_finished_seq_groups()?;
        Ok(outputs)
    }

    fn process_model_outputs(
        &mut self,
        scheduler_outputs: &SchedulerOutputs,
        seq_outputs: Vec<SequenceOutput>,
    ) -> Result<Vec<GenerationOutput>> {
        let max_model_len = self.config.scheduler.max_model_len;
        let mut by_seq: HashMap<SequenceId, SequenceOutput> =
            seq_outputs.into_iter().map(|o| (o.seq_id, o)).collect();
        let mut outputs = Vec::with_capacity(scheduler_outputs.scheduled.len());

        for request_id in &scheduler_outputs.scheduled {
            let group = self
                .scheduler
                .get_seq_group_mut(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.clone()))?;
            let sampling = group.sampling().clone();

            let mut finished_seqs = Vec::new();
            for seq in group.get_seqs_mut(Some(SequenceStatus::Running)) {
                let output = by_seq.remove(&seq.seq_id()).ok_or_else(|| {
                    Error::Execution(format!("no output for sequence {}", seq.seq_id()))
                })?;
                if let Some(status) = append_and_check(seq, output, &sampling, max_model_len) {
                    seq.set_finished(status)?;
                    finished_seqs.push(seq.seq_id());
                }
            }
            outputs.push(GenerationOutput::from_seq_group(group));

            for seq_id in finished_seqs {
                self.scheduler.free_seq(seq_id)?;
            }
        }
        Ok(outputs)
    }

    /// Step until no request is left, returning every finished output.
    pub async fn generate(&mut self) -> Result<Vec<GenerationOutput>> {
        let mut finished = Vec::new();
        while self.has_unfinished_requests() {
            finished.extend(self.step().await?.into_iter().filter(|o| o.finished()));
        }
        Ok(finished)
    }

    /// Check if any request is still queued or running.
    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_seqs()
    }

    /// Get the number of unfinished requests.
    pub fn get_num_unfinished_requests(&self) -> usize {
        self.scheduler.get_num_unfinished_seq_groups()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get reference to the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get mutable reference to the scheduler.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

/// Append the executor's tokens and return the terminal status, if reached.
fn append_and_check(
    seq: &mut Sequence,
    output: SequenceOutput,
    sampling: &SamplingConfig,
    max_model_len: usize,
) -> Option<SequenceStatus> {
    for token_id in output.token_ids {
        seq.append_token(token_id);
        if sampling.stop_token_ids.contains(&token_id) {
            return Some(SequenceStatus::FinishedStopped);
        }
        if seq.output_len() >= sampling.max_tokens || seq.len() >= max_model_len {
            return Some(SequenceStatus::FinishedLengthCapped);
        }
    }
    output.finished.then_some(SequenceStatus::FinishedStopped)
}
