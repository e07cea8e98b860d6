//! Error kinds produced by the planner and step executor.
//!
//! Every fallible core operation returns `Result<T, CoreError>`. The
//! variants mirror the five error kinds a collective engine can surface:
//! allocation failure, transient back-pressure (always recovered
//! internally and never expected to reach a caller, but representable so
//! that internal plumbing can use `?`), bad user input, algorithm refusal,
//! and broken protocol invariants.

use crate::wire::{AlgoId, CollectiveKind};

/// Errors produced by the planner, plan cache, and step executor.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An allocation (op pool, phase array, staging buffer) failed.
    ///
    /// The op that triggered the allocation is discarded; the group
    /// remains usable.
    #[error("allocation failed while building {kind:?}: {what}")]
    NoMemory {
        /// Collective kind being planned or executed when the allocation failed.
        kind: CollectiveKind,
        /// What was being allocated (phase array, op pool, staging buffer, ...).
        what: &'static str,
    },

    /// Transient transport back-pressure (`NO_RESOURCE`).
    ///
    /// This variant exists for internal bookkeeping (a send attempt that
    /// must be retried via the resend list); it is recovered automatically
    /// by [`crate::executor::progress`] and is never expected to escape to
    /// a caller of [`crate::engine::Engine::trigger`].
    #[error("transport back-pressure on endpoint {endpoint_index} (step {step_index})")]
    NoResource {
        /// Index into the phase's endpoint list that reported back-pressure.
        endpoint_index: usize,
        /// Step index within the plan.
        step_index: u8,
    },

    /// A user-supplied argument was invalid; returned before any transport
    /// call is made.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The requested algorithm refuses this `(args, topology)` combination.
    ///
    /// Surfaces to the caller only when the feasibility fallback chain is
    /// exhausted without reaching a usable algorithm.
    #[error("algorithm {algo:?} unsupported for {kind:?}: {reason}")]
    Unsupported {
        /// Collective kind the algorithm was requested for.
        kind: CollectiveKind,
        /// Algorithm that refused.
        algo: AlgoId,
        /// Human-readable reason, usually the name of the failed feasibility check.
        reason: &'static str,
    },

    /// A protocol invariant was broken, e.g. a staged message landed on a
    /// slot in an impossible state. The triggering op's completion callback
    /// is invoked with this error; the group itself stays usable for
    /// subsequent ops (but not for the poisoned op's buffers).
    #[error("fatal protocol violation: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
