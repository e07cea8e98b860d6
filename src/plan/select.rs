//! Auto-selection: table lookups on three discretized axes (message
//! size, processes-per-node, node count) per collective kind. A `0`-like
//! `None` entry means "auto": the caller falls through to the first
//! non-auto match or a documented tree-algorithm default.
//!
//! The bucket axes and the principle of one static table per collective
//! kind are grounded in `builtin_algo_select.c`'s three-axis layout; the
//! tuning numbers inside that file are site-specific micro-benchmark
//! results and are not reproduced. This crate's defaults instead favor
//! tree algorithms at small scale and ring/Rabenseifner at large scale,
//! a defensible default rather than a measured one.

use crate::wire::{AllreduceAlgo, BcastAlgo, GatherAlgo};

/// Message-size buckets, ascending.
pub const SIZE_BUCKETS: &[usize] = &[4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 1024 * 1024, usize::MAX];

/// Processes-per-node buckets, ascending.
pub const PPN_BUCKETS: &[usize] = &[4, 8, 16, 32, 64, usize::MAX];

/// Node-count buckets, ascending.
pub const NODE_BUCKETS: &[usize] = &[4, 8, 16, 32, usize::MAX];

/// Index of the first bucket boundary `>= value`, clamped to the last bucket.
fn bucket_of(value: usize, buckets: &[usize]) -> usize {
    buckets.iter().position(|&b| value <= b).unwrap_or(buckets.len() - 1)
}

/// Selects an allreduce algorithm from message size (bytes), PPN, and
/// node count. Small messages on balanced small jobs prefer the
/// binomial tree; larger messages or larger node counts move to
/// Rabenseifner or ring, which have better bandwidth terms.
pub fn select_allreduce(bytes: usize, ppn: usize, nodes: usize) -> AllreduceAlgo {
    let size_b = bucket_of(bytes, SIZE_BUCKETS);
    let ppn_b = bucket_of(ppn, PPN_BUCKETS);
    let node_b = bucket_of(nodes, NODE_BUCKETS);
    if node_b >= 1 && ppn_b >= 1 {
        AllreduceAlgo::NodeAwareRecursiveAndBmtree
    } else if size_b >= SIZE_BUCKETS.len() - 2 {
        AllreduceAlgo::Ring
    } else if size_b >= 6 {
        AllreduceAlgo::Rabenseifner
    } else if node_b == 0 {
        AllreduceAlgo::BinomialTree
    } else {
        AllreduceAlgo::RecursiveDoubling
    }
}

/// Selects a broadcast algorithm from message size and PPN. Bruck wins
/// once fan-out cost from a plain k-nomial tree would dominate: large
/// messages or high PPN.
pub fn select_bcast(bytes: usize, ppn: usize) -> BcastAlgo {
    let size_b = bucket_of(bytes, SIZE_BUCKETS);
    let ppn_b = bucket_of(ppn, PPN_BUCKETS);
    if size_b >= SIZE_BUCKETS.len() - 2 || ppn_b >= PPN_BUCKETS.len() - 2 {
        BcastAlgo::Bruck
    } else {
        BcastAlgo::KnomialTree
    }
}

/// Selects a gatherv/scatterv/allgatherv algorithm. Linear stays cheapest
/// for small jobs; larger jobs move to a tree, and allgatherv specifically
/// prefers ring once messages are large (better bandwidth term than a
/// tree's log factor).
pub fn select_gather(bytes: usize, nodes: usize, is_allgather: bool) -> GatherAlgo {
    let size_b = bucket_of(bytes, SIZE_BUCKETS);
    let node_b = bucket_of(nodes, NODE_BUCKETS);
    if is_allgather && size_b >= SIZE_BUCKETS.len() - 2 {
        GatherAlgo::Ring
    } else if is_allgather && node_b >= 1 {
        GatherAlgo::RecursiveDoubling
    } else if node_b == 0 {
        GatherAlgo::Linear
    } else {
        GatherAlgo::KnomialTree
    }
}
