//! Plans: immutable, phase-sequenced descriptions of how a collective is
//! carried out, plus the cache that lets a group reuse one across
//! invocations.

pub mod builder;
pub mod bruck;
pub mod feasibility;
pub mod plummer;
pub mod rabenseifner;
pub mod recursive;
pub mod ring;
pub mod select;
pub mod throttled_scatter;
pub mod trees;

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::group::Rank;
use crate::transport::Thresholds;
use crate::wire::{AlgoId, CollectiveKind};

/// The role a phase plays in the step executor, carried as a tag rather
/// than through dynamic dispatch: the executor switches on `Method`
/// directly, keeping the phase array one flat, cache-friendly `Vec`
/// instead of a vec of trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Send once; no completion wait beyond send.
    SendTerminal,
    /// Receive only; completes when all expected packets arrive.
    RecvTerminal,
    /// Receive one fragment, forward to all children.
    BcastWaypoint,
    /// Receive from all children, then send aggregated data to parent.
    GatherWaypoint,
    /// Send a distinct slice to each child.
    ScatterTerminal,
    /// Receive full buffer from parent, scatter slices to children.
    ScatterWaypoint,
    /// Receive from each child, reduce into local buffer.
    ReduceTerminal,
    /// Receive + reduce from children, then send result up.
    ReduceWaypoint,
    /// Symmetric exchange with one peer, then reduce.
    ReduceRecursive,
    /// Recursive-halving: each step halves the active span.
    ReduceScatterRecursive,
    /// Mirror of recursive-halving: each step doubles the active span.
    AllgatherRecursive,
    /// Bruck-style allgather: per-step power-of-two distances.
    AllgatherBruck,
    /// Bruck-style alltoall.
    AlltoallBruck,
    /// Ring reduce-scatter: p-1 rotations.
    ReduceScatterRing,
    /// Ring allgather: p-1 rotations.
    AllgatherRing,
    /// Symmetric send+recv to one peer (binary-block allgather primitive).
    Exchange,
    /// Variable-length all-to-all, direct (Ladd).
    AlltoallvLadd,
    /// Variable-length all-to-all, hierarchical (Plummer).
    AlltoallvPlummer,
}

/// Endpoint counts for one phase: a phase may send to a different peer
/// set than it receives from (e.g. a scatter waypoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpCounts {
    /// Total distinct endpoints touched by this phase.
    pub total: usize,
    /// Endpoints this phase sends to.
    pub send: usize,
    /// Endpoints this phase receives from.
    pub recv: usize,
}

/// Which live-offset computation a phase defers to trigger time, per the
/// "phase view" design note: Rabenseifner and Plummer need the *current*
/// element count to place blocks, so rather than carry a function
/// pointer, the phase carries this tag and the executor re-derives
/// offsets from the op's live [`crate::args::CollectiveArgs`] before the
/// phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhaseKind {
    /// Recompute `(start_block, num_blocks, peer_start_block, peer_block)`
    /// for a Rabenseifner phase from the live element count.
    Rabenseifner,
    /// Recompute per-stage counts/displacements for a Plummer phase.
    Plummer,
}

/// Algorithm-specific fields that do not belong on every phase. Mirrors
/// the original source's `extra` union, as a plain struct since Rust has
/// no representation cost reason to union these (the alternative, an enum
/// per method family, would require the executor to match twice).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseExtra {
    /// Index of the block this phase operates on.
    pub block_index: usize,
    /// Number of blocks this phase covers.
    pub block_count: usize,
    /// Total blocks in the algorithm's decomposition.
    pub total_blocks: usize,
    /// First block this phase expects to receive.
    pub recv_start_block: usize,
    /// First block the peer is expected to send from.
    pub peer_start_block: usize,
    /// Whether this phase covers a partial (non-uniform) block.
    pub is_partial: bool,
    /// Whether this phase's transfer length varies per invocation
    /// (alltoallv).
    pub is_variable_len: bool,
    /// Bruck-style packed rank distance for this step, if applicable.
    pub packed_rank: Option<usize>,
}

/// One executable unit of a plan.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Monotonically increasing index within the plan.
    pub step_index: u8,
    /// Which executor role this phase plays.
    pub method: Method,
    /// Resolved peer member indices (not yet bound to transport endpoints
    /// — that binding happens at [`builder`] time via `Transport::connect`).
    pub peers: SmallVec<[usize; 8]>,
    /// Endpoint counts for this phase.
    pub ep_counts: EpCounts,
    /// Per-endpoint send cutover thresholds.
    pub send_thresh: Thresholds,
    /// Per-endpoint receive cutover thresholds.
    pub recv_thresh: Thresholds,
    /// Whether a non-commutative-safe swap is needed before reducing.
    pub is_swap: bool,
    /// Algorithm-specific extra fields.
    pub extra: PhaseExtra,
    /// Deferred per-trigger offset recomputation, if any.
    pub init_phase: Option<InitPhaseKind>,
    /// Per-peer `(byte_offset, byte_length)` into the step's payload, one
    /// entry per send peer (`peers[0..ep_counts.send)`, same order), for
    /// phases whose method sets `StepFlags.length_per_request`. Empty for
    /// every phase where every peer gets the same slice of `payload` —
    /// the step executor falls back to the whole payload in that case.
    pub per_peer_send_bytes: SmallVec<[(usize, usize); 8]>,
}

impl Phase {
    /// Builds a phase with no algorithm-specific extras and no deferred
    /// offset recomputation; callers override fields as needed.
    pub fn new(step_index: u8, method: Method, thresh: Thresholds) -> Self {
        Phase {
            step_index,
            method,
            peers: SmallVec::new(),
            ep_counts: EpCounts::default(),
            send_thresh: thresh,
            recv_thresh: thresh,
            is_swap: false,
            extra: PhaseExtra::default(),
            init_phase: None,
            per_peer_send_bytes: SmallVec::new(),
        }
    }
}

/// An immutable, fully-resolved description of how one collective
/// invocation is carried out. Reusable across invocations whose
/// `(kind, algo, root, dtype_is_contig)` match, except for alltoallv
/// (per-invocation counts differ — see [`CollectiveKind::is_cacheable`]).
#[derive(Debug, Clone)]
pub struct Plan {
    /// Which collective this plan executes.
    pub kind: CollectiveKind,
    /// The algorithm chosen for this plan.
    pub algo: AlgoId,
    /// The phase sequence.
    pub phases: Vec<Phase>,
    /// Number of distinct endpoints touched across all phases.
    pub endpoint_count: usize,
}

impl Plan {
    /// Number of phases (equivalently, steps) in the plan.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Number of steps; identical to `phase_count` (one step per phase).
    pub fn step_count(&self) -> u8 {
        self.phases.len() as u8
    }
}

/// Key identifying a cacheable plan within one group: collective kind,
/// algorithm, optional root, and whether the datatype is contiguous (a
/// non-contiguous datatype forces different staging phases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Collective kind.
    pub kind: CollectiveKind,
    /// Chosen algorithm.
    pub algo: AlgoId,
    /// Root rank, for rooted collectives.
    pub root: Option<Rank>,
    /// Whether the invocation's datatype packs contiguously.
    pub dtype_contig: bool,
}

/// Per-group memoization of built plans. Alltoallv is never inserted
/// (`CollectiveKind::is_cacheable` is false for it), so every alltoallv
/// trigger rebuilds its plan from the invocation's own counts.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: HashMap<PlanKey, Arc<Plan>>,
}

impl PlanCache {
    /// An empty cache.
    pub fn new() -> Self {
        PlanCache::default()
    }

    /// Looks up a cached plan.
    pub fn get(&self, key: &PlanKey) -> Option<Arc<Plan>> {
        self.plans.get(key).cloned()
    }

    /// Inserts a freshly built plan, unless its kind is not cacheable, in
    /// which case the insert is a no-op and the plan is only ever used
    /// for this one invocation.
    pub fn insert(&mut self, key: PlanKey, plan: Arc<Plan>) {
        if key.kind.is_cacheable() {
            self.plans.insert(key, plan);
        }
    }

    /// Drops every cached plan, as happens on group destroy.
    pub fn clear(&mut self) {
        self.plans.clear();
    }

    /// Number of plans currently cached.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the cache holds no plans.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
