//! Error types for nano-serve.

use thiserror::Error;

use crate::core::block::BlockDevice;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available on the tier.
    #[error("out of {0} cache blocks")]
    OutOfBlocks(BlockDevice),

    /// Swap space exhausted while a swap-out was mandated.
    ///
    /// Fatal to the scheduling iteration: no partial mutation happened.
    #[error("out of swap space: {required} blocks required, {available} available")]
    OutOfSwapSpace { required: usize, available: usize },

    /// Sequence not found.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Request (sequence group) not found in any scheduler queue.
    #[error("request {0} not found")]
    RequestNotFound(String),

    /// No block table registered for the sequence.
    #[error("no block table for sequence {0}")]
    BlockTableNotFound(u64),

    /// Logical block index is past the end of a block table.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} blocks allocated)")]
    BlockIndexOutOfBounds { logical_idx: usize, num_blocks: usize },

    /// A block was released more times than it was referenced.
    #[error("double free of {device} block {block_id}")]
    DoubleFree { device: BlockDevice, block_id: usize },

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Internal bookkeeping no longer adds up.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A request with the same id is already tracked.
    #[error("request {0} already exists")]
    DuplicateRequest(String),

    /// The background loop is not running (never started or died).
    #[error("engine loop is not running: {0}")]
    EngineDead(String),

    /// `start_background_loop` was called while the loop is alive.
    #[error("background loop is already running")]
    LoopAlreadyRunning,

    /// The compute collaborator failed.
    #[error("execution error: {0}")]
    Execution(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
