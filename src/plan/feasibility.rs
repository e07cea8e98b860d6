//! Feasibility checks and the fallback fixed point.
//!
//! Each algorithm id carries a list of checks; a check that fires
//! replaces the algorithm id with a deterministic fallback target. The
//! replacement loop runs until no check fires (a fixed point), mirroring
//! `builtin_algo_check.c`'s `chkfb_*` fallback arrays — the check names
//! and the principle of a fixed fallback edge per `(algo, check)` are
//! reproduced; the specific HPC-site tuning thresholds are not.

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::group::Group;
use crate::wire::AlgoId;

/// One feasibility condition that can disqualify an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    /// No builder is registered for this `(kind, algo)` pair.
    AlgoMissing,
    /// The datatype is non-contiguous.
    NonContigDtype,
    /// The reduction operator is not commutative.
    NonCommutative,
    /// Node-aware processing is not supported for this topology.
    NapUnsupported,
    /// Rabenseifner requires at least two ranks and a power-of-two-friendly split.
    RabenseifnerUnsupported,
    /// Node-aware Rabenseifner requires at least two nodes.
    NodeAwareRabenseifnerUnsupported,
    /// Socket-aware Rabenseifner requires at least two sockets per node.
    SocketAwareRabenseifnerUnsupported,
    /// The bootstrap collaborator reported no binding (no node/socket affinity).
    BindToNone,
    /// Nodes don't host an equal number of processes.
    PpnUnbalanced,
    /// Ranks on the same node are not contiguous in rank order.
    NodeRanksNoncontiguous,
    /// Sockets don't host an equal number of processes.
    PpsUnbalanced,
    /// Ranks on the same socket are not contiguous in rank order.
    SocketRanksNoncontiguous,
    /// The datatype's extent exceeds the configured large-datatype threshold.
    DtypeExceedsThreshold,
    /// The message needs phase segmentation the algorithm doesn't implement.
    PhaseSegmentationRequired,
    /// In-network-collective offload is unavailable.
    IncUnavailable,
    /// `MPI_IN_PLACE` is not supported by this algorithm.
    InPlaceUnsupported,
}

/// Evaluates every check relevant to `algo` against the live group,
/// args, and config, returning the first one that fires (checks are
/// evaluated in a fixed order, matching the deterministic ordering
/// `builtin_algo_check.c` relies on for a stable fixed point).
pub fn first_failing_check(algo: AlgoId, group: &Group, args: &CollectiveArgs<'_>, config: &Config) -> Option<Check> {
    let balance = group.balance();
    if balance.ppn_unbalance {
        return Some(Check::PpnUnbalanced);
    }
    if balance.nrank_uncontinue {
        return Some(Check::NodeRanksNoncontiguous);
    }
    if balance.pps_unbalance {
        return Some(Check::PpsUnbalanced);
    }
    if balance.srank_uncontinue {
        return Some(Check::SocketRanksNoncontiguous);
    }
    if !matches!(args, CollectiveArgs::Barrier) {
        let dtype = args.datatype();
        if !dtype.is_contiguous() {
            return Some(Check::NonContigDtype);
        }
        if dtype.extent() > config.large_datatype_threshold {
            return Some(Check::DtypeExceedsThreshold);
        }
    }
    if let CollectiveArgs::Reduce { op, .. } | CollectiveArgs::Allreduce { op, .. } = args {
        if !op.is_commutative() {
            if matches!(
                algo,
                AlgoId::Allreduce(crate::wire::AllreduceAlgo::Rabenseifner)
                    | AlgoId::Allreduce(crate::wire::AllreduceAlgo::NodeAwareRecursiveAndBmtree)
                    | AlgoId::Allreduce(crate::wire::AllreduceAlgo::Ring)
            ) {
                return Some(Check::NonCommutative);
            }
        }
    }
    match algo {
        AlgoId::Allreduce(crate::wire::AllreduceAlgo::Rabenseifner) if group.size() < 2 => {
            Some(Check::RabenseifnerUnsupported)
        }
        AlgoId::Allreduce(crate::wire::AllreduceAlgo::NodeAwareRecursiveAndBmtree) if group.node_cnt() < 2 => {
            Some(Check::NodeAwareRabenseifnerUnsupported)
        }
        _ => None,
    }
}

/// One `(algo, check)` -> `algo` fallback edge.
pub type FallbackEdge = ((AlgoId, Check), AlgoId);

/// A fixed fallback table: for each `(algo, check)` pair that can fire,
/// names the algorithm id to replace it with.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    edges: std::collections::HashMap<(AlgoId, Check), AlgoId>,
}

impl FallbackTable {
    /// Builds the table with this crate's default fallback edges.
    pub fn with_defaults() -> Self {
        use crate::wire::{AllreduceAlgo, BcastAlgo, GatherAlgo};
        let mut edges = std::collections::HashMap::new();
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::Rabenseifner), Check::RabenseifnerUnsupported),
            AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
        );
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::Rabenseifner), Check::NonCommutative),
            AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
        );
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::NodeAwareRecursiveAndBmtree), Check::NodeAwareRabenseifnerUnsupported),
            AlgoId::Allreduce(AllreduceAlgo::Rabenseifner),
        );
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::NodeAwareRecursiveAndBmtree), Check::NonCommutative),
            AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
        );
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::Ring), Check::NonCommutative),
            AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
        );
        edges.insert(
            (AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling), Check::PpnUnbalanced),
            AlgoId::Allreduce(AllreduceAlgo::BinomialTree),
        );
        edges.insert(
            (AlgoId::Bcast(BcastAlgo::Bruck), Check::DtypeExceedsThreshold),
            AlgoId::Bcast(BcastAlgo::KnomialTree),
        );
        edges.insert(
            (AlgoId::Gather(GatherAlgo::Ring), Check::PpnUnbalanced),
            AlgoId::Gather(GatherAlgo::RecursiveDoubling),
        );
        edges.insert(
            (AlgoId::Gather(GatherAlgo::RecursiveDoubling), Check::NodeRanksNoncontiguous),
            AlgoId::Gather(GatherAlgo::Linear),
        );
        FallbackTable { edges }
    }

    /// Looks up the fallback target for a fired check, if this table
    /// has an edge for it.
    pub fn get(&self, algo: AlgoId, check: Check) -> Option<AlgoId> {
        self.edges.get(&(algo, check)).copied()
    }

    /// Inserts or overwrites a fallback edge.
    pub fn insert(&mut self, algo: AlgoId, check: Check, fallback: AlgoId) {
        self.edges.insert((algo, check), fallback);
    }
}

/// Maximum number of fallback hops before giving up, guarding against a
/// cyclic table (invariant 5: the loop must terminate).
const MAX_FALLBACK_HOPS: usize = 16;

/// Repeatedly applies `first_failing_check` and the fallback table until
/// either no check fires (fixed point reached) or the hop budget is
/// exhausted, in which case the last algorithm id tried is returned
/// together with the check that could not be resolved.
pub fn run_to_fixed_point(
    mut algo: AlgoId,
    group: &Group,
    args: &CollectiveArgs<'_>,
    config: &Config,
    table: &FallbackTable,
) -> Result<AlgoId, (AlgoId, Check)> {
    for _ in 0..MAX_FALLBACK_HOPS {
        match first_failing_check(algo, group, args, config) {
            None => return Ok(algo),
            Some(check) => match table.get(algo, check) {
                Some(next) => algo = next,
                None => return Err((algo, check)),
            },
        }
    }
    Err((algo, Check::AlgoMissing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AllreduceAlgo;

    #[test]
    fn rabenseifner_falls_back_to_recursive_doubling_for_odd_sizes() {
        let table = FallbackTable::with_defaults();
        assert_eq!(
            table.get(AlgoId::Allreduce(AllreduceAlgo::Rabenseifner), Check::RabenseifnerUnsupported),
            Some(AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling))
        );
    }

    #[test]
    fn unresolvable_check_reports_the_stuck_pair() {
        let table = FallbackTable::default();
        let err = table.get(AlgoId::Allreduce(AllreduceAlgo::Rabenseifner), Check::NonContigDtype);
        assert!(err.is_none());
    }
}
