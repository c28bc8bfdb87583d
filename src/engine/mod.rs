//! Inference engine.
//!
//! This module contains:
//! - LLMEngine for running one scheduling iteration at a time
//! - AsyncEngine for serving concurrent requests from a background loop
//! - The executor seam the engine dispatches each iteration to

pub mod async_engine;
pub mod executor;
pub mod llm;

pub use async_engine::{AsyncEngine, AsyncStream, RequestTracker};
pub use executor::{
    ByteTokenizer, ExecuteModelRequest, ModelExecutor, SequenceOutput, SyntheticExecutor, Tokenize,
};
pub use llm::{CompletionOutput, GenerationOutput, GenerationRequest, LLMEngine, Prompt};
