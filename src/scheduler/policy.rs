//! Ordering policies for the running and swapped queues.
//!
//! The scheduler sorts its queues with a [`Policy`] before each decode pass.
//! The front of the sorted queue is served first; preemption victims are
//! taken from the back.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Instant;

use crate::config::PolicyKind;
use crate::core::sequence::SequenceGroup;

/// Decides which sequence groups are served first.
pub trait Policy: Send + Sync + std::fmt::Debug {
    /// `Ordering::Less` means `a` is served before `b`.
    fn compare(&self, now: Instant, a: &SequenceGroup, b: &SequenceGroup) -> Ordering;

    /// Stable sort of `seq_groups`, highest priority first.
    fn sort_by_priority(
        &self,
        now: Instant,
        seq_groups: VecDeque<SequenceGroup>,
    ) -> VecDeque<SequenceGroup> {
        let mut groups: Vec<_> = seq_groups.into();
        groups.sort_by(|a, b| self.compare(now, a, b));
        groups.into()
    }
}

/// First-come-first-served: earliest arrival first, ties broken by
/// submission order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fcfs;

impl Policy for Fcfs {
    fn compare(&self, now: Instant, a: &SequenceGroup, b: &SequenceGroup) -> Ordering {
        // Longest wait first
        let wait_a = now.saturating_duration_since(a.arrival_time());
        let wait_b = now.saturating_duration_since(b.arrival_time());
        wait_b
            .cmp(&wait_a)
            .then_with(|| a.arrival_order().cmp(&b.arrival_order()))
    }
}

/// Explicit request priority (higher first), then FCFS.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityFirst;

impl Policy for PriorityFirst {
    fn compare(&self, now: Instant, a: &SequenceGroup, b: &SequenceGroup) -> Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| Fcfs.compare(now, a, b))
    }
}

/// Build the policy selected by configuration.
pub fn policy_for(kind: PolicyKind) -> Box<dyn Policy> {
    match kind {
        PolicyKind::Fcfs => Box::new(Fcfs),
        PolicyKind::Priority => Box::new(PriorityFirst),
    }
}
