//! nano-serve: admission, continuous batching and paged KV cache management
//! for LLM serving.
//!
//! This crate implements the serving core that sits in front of the model:
//! - Paged cache blocks with copy-on-write fork and swap to a CPU tier
//! - Iteration-level scheduling with preemption by swap, recompute or abort
//! - An async request lifecycle with streaming outputs and cancellation
//!
//! The model itself is behind the [`ModelExecutor`] trait.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{
    AdmissionMode, CacheConfig, EngineConfig, PolicyKind, PreemptionMode, SamplingConfig,
    SchedulerConfig,
};
pub use engine::{
    AsyncEngine, AsyncStream, GenerationOutput, GenerationRequest, LLMEngine, ModelExecutor,
    Prompt, SyntheticExecutor,
};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerOutputs};
