//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Admission of waiting requests under token and sequence budgets
//! - Continuous batching (iteration-level scheduling)
//! - Preemption by swap, recomputation or abort

pub mod batch;
pub mod policy;

pub use batch::{Scheduler, SchedulerOutputs, SequenceGroupMetadata};
pub use policy::{policy_for, Fcfs, Policy, PriorityFirst};
