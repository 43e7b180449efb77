//! Lifecycle of an in-flight coordinator operation.
//!
//! # Read
//!
//! ```text
//! Started → TierConsult ──┬── Hit ── (PromotionScheduled) ──┬─→ Completed
//!                         └── Miss ─────────────────────────┘
//!                   └──────────────→ Failed
//! ```
//!
//! # Write and delete
//!
//! ```text
//! Started → Validating → WritingThrough ── (WriteBackQueued) ──┬─→ Completed
//!               └──────────────┴──────────────────┴────────────┴─→ Failed
//! ```

use std::fmt;

use bridge_core::{BridgeError, BridgeResult, Key};

/// A state in one of the operation lifecycles.
pub trait OpState: Copy + Eq + fmt::Debug + fmt::Display {
    fn can_transition_to(self, next: Self) -> bool;
    fn is_terminal(self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadState {
    Started,
    TierConsult,
    Hit,
    Miss,
    PromotionScheduled,
    Completed,
    Failed,
}

impl ReadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadState::Started => "started",
            ReadState::TierConsult => "tier_consult",
            ReadState::Hit => "hit",
            ReadState::Miss => "miss",
            ReadState::PromotionScheduled => "promotion_scheduled",
            ReadState::Completed => "completed",
            ReadState::Failed => "failed",
        }
    }
}

impl OpState for ReadState {
    fn can_transition_to(self, next: Self) -> bool {
        use ReadState::*;
        matches!(
            (self, next),
            (Started, TierConsult)
                | (TierConsult, Hit)
                | (TierConsult, Miss)
                | (TierConsult, Failed)
                | (Hit, PromotionScheduled)
                | (Hit, Completed)
                | (Miss, PromotionScheduled)
                | (Miss, Completed)
                | (PromotionScheduled, Completed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, ReadState::Completed | ReadState::Failed)
    }
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteState {
    Started,
    Validating,
    WritingThrough,
    WriteBackQueued,
    Completed,
    Failed,
}

impl WriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteState::Started => "started",
            WriteState::Validating => "validating",
            WriteState::WritingThrough => "writing_through",
            WriteState::WriteBackQueued => "write_back_queued",
            WriteState::Completed => "completed",
            WriteState::Failed => "failed",
        }
    }
}

impl OpState for WriteState {
    fn can_transition_to(self, next: Self) -> bool {
        use WriteState::*;
        matches!(
            (self, next),
            (Started, Validating)
                | (Validating, WritingThrough)
                | (Validating, Failed)
                | (WritingThrough, WriteBackQueued)
                | (WritingThrough, Completed)
                | (WritingThrough, Failed)
                | (WriteBackQueued, Completed)
                | (WriteBackQueued, Failed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, WriteState::Completed | WriteState::Failed)
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one operation through its lifecycle and traces each step.
#[derive(Debug)]
pub struct OpTracker<S: OpState> {
    op: &'static str,
    key: Key,
    state: S,
}

impl<S: OpState> OpTracker<S> {
    pub fn new(op: &'static str, key: &Key, initial: S) -> Self {
        Self {
            op,
            key: key.clone(),
            state: initial,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: S) -> BridgeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::failure(format!(
                "illegal {} transition {} -> {} for {}",
                self.op, self.state, next, self.key
            )));
        }
        tracing::trace!(op = self.op, key = %self.key, from = %self.state, to = %next, "Op transition");
        self.state = next;
        Ok(())
    }

    /// Mark the operation failed unless it already finished.
    pub fn fail(&mut self, failed: S) {
        if !self.state.is_terminal() && self.state.can_transition_to(failed) {
            self.state = failed;
        }
    }
}
