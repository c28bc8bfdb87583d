//! Configuration types for nano-serve.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};

/// How a running group is evicted when the cache runs out of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Move the group's blocks to the secondary tier and resume later.
    Swap,
    /// Drop the group's blocks and re-run its prefill later.
    Recompute,
    /// Finalize the group as aborted; the caller owns retry.
    Abort,
}

/// Ordering policy applied to the running and swapped queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// First-come-first-served by arrival time.
    #[default]
    Fcfs,
    /// Explicit request priority (higher first), then arrival time.
    Priority,
}

/// Who owns admission control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// The scheduler decides admission and retries preempted work itself.
    #[default]
    Internal,
    /// An external controller owns admission and retry (disaggregated setup).
    External,
}

/// Paged cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    /// Number of primary-tier (GPU) blocks.
    pub num_gpu_blocks: usize,
    /// Number of secondary-tier (CPU swap) blocks.
    pub num_cpu_blocks: usize,
    /// Attention sliding window in tokens, if the model uses one.
    pub sliding_window: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_gpu_blocks: 1024,
            num_cpu_blocks: 512,
            sliding_window: None,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tokens processed in a single iteration.
    pub max_num_batched_tokens: usize,
    /// Maximum number of sequences processed in a single iteration.
    pub max_num_seqs: usize,
    /// Maximum length of a sequence (prompt plus generated tokens).
    pub max_model_len: usize,
    /// Forced preemption mode; `None` picks per group.
    pub preemption_mode: Option<PreemptionMode>,
    /// Priority policy for the running and swapped queues.
    pub policy: PolicyKind,
    /// Admission ownership.
    pub admission: AdmissionMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2560,
            max_num_seqs: 256,
            max_model_len: 2048,
            preemption_mode: None,
            policy: PolicyKind::Fcfs,
            admission: AdmissionMode::Internal,
        }
    }
}

impl SchedulerConfig {
    /// Longest prompt that can ever be admitted.
    pub fn prompt_limit(&self) -> usize {
        self.max_model_len.min(self.max_num_batched_tokens)
    }

    /// Preemption mode forced by configuration, if any.
    ///
    /// External admission always aborts since the controller owns retry.
    pub fn forced_preemption_mode(&self) -> Option<PreemptionMode> {
        match self.admission {
            AdmissionMode::External => Some(PreemptionMode::Abort),
            AdmissionMode::Internal => self.preemption_mode,
        }
    }
}

/// Sampling configuration.
///
/// Passed through to the compute collaborator; the engine itself only
/// enforces `max_tokens` and `stop_token_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Token ids that end generation.
    pub stop_token_ids: Vec<u32>,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
            ignore_eos: false,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Log every received request.
    pub log_requests: bool,
    /// Truncate logged prompts to this many characters / tokens.
    pub max_log_len: Option<usize>,
    /// Start the background loop on the first request.
    pub start_engine_loop: bool,
}

impl EngineConfig {
    /// Load and validate a JSON engine configuration.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let sched = &self.scheduler;
        if self.cache.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        if self.cache.num_gpu_blocks == 0 {
            return Err(Error::Config("num_gpu_blocks must be positive".to_string()));
        }
        if sched.max_num_seqs == 0 || sched.max_model_len == 0 {
            return Err(Error::Config(
                "max_num_seqs and max_model_len must be positive".to_string(),
            ));
        }
        if sched.max_num_batched_tokens < sched.max_num_seqs {
            return Err(Error::Config(format!(
                "max_num_batched_tokens ({}) must be greater than or equal to max_num_seqs ({})",
                sched.max_num_batched_tokens, sched.max_num_seqs
            )));
        }
        if let Some(window) = self.cache.sliding_window {
            if window == 0 {
                return Err(Error::Config("sliding_window must be positive".to_string()));
            }
        }
        Ok(())
    }
}
