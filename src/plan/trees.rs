//! Binomial / k-nomial tree construction and the non-commutative swap
//! position.
//!
//! The parent/child scan below mirrors the iterative `tree_mask` walk in
//! `ucg_builtin_kmtree_build`: ranks are rotated so the root sits at index
//! 0, then walked mask-by-mask (`mask *= degree` each round) to find the
//! first base-`degree` digit that is non-zero — that digit's value times
//! `mask` locates the parent. Every level at which a rank's rotated index
//! is still a multiple of `mask` makes it an ancestor at that level, so
//! its children are `rotated_rank + mask * i` for `i` in `1..degree`.

use smallvec::SmallVec;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, Plan};
use crate::wire::{AlgoId, AllreduceAlgo, BarrierAlgo, BcastAlgo, CollectiveKind, GatherAlgo};

/// One rank's position in a k-nomial tree: its parent (absent at the
/// root) and its direct children, all given as member indices (already
/// un-rotated back into the group's natural order).
#[derive(Debug, Clone, Default)]
pub struct KTreeNode {
    /// Parent member index, or `None` at the root.
    pub parent: Option<usize>,
    /// Direct children, in the order the tree assigns them.
    pub children: SmallVec<[usize; 8]>,
}

impl KTreeNode {
    /// Leaf/root/waypoint role, derived from child/parent counts exactly
    /// as base spec §4.2.1 describes: `(up_cnt, down_cnt)` of `(1,0)` is a
    /// leaf, `(0,>0)` is the root, `(1,>0)` is a waypoint.
    pub fn role(&self) -> TreeRole {
        match (self.parent.is_some(), self.children.is_empty()) {
            (true, true) => TreeRole::Leaf,
            (false, false) => TreeRole::Root,
            (true, false) => TreeRole::Waypoint,
            (false, true) => TreeRole::Root, // single-member group
        }
    }
}

/// A rank's role within a constructed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeRole {
    /// One parent, no children.
    Leaf,
    /// No parent: the collective's root.
    Root,
    /// One parent and at least one child: relays in both directions.
    Waypoint,
}

/// Builds a k-nomial tree over `size` members rooted at `root`, returning
/// `rank`'s position in it.
///
/// `right_most` selects between the right-most tree (used for fan-in /
/// reduce-shaped collectives, children enumerated in descending digit
/// order) and the left-most tree (fan-out / broadcast-shaped, children in
/// ascending digit order) — both trees share the same parent/child
/// topology, differing only in the order children are visited, which
/// matters for load-balancing wide trees but not for correctness.
pub fn build_knomial(rank: usize, root: usize, size: usize, degree: u32, right_most: bool) -> KTreeNode {
    assert!(size > 0 && rank < size && root < size);
    let degree = (degree as usize).max(2);
    let rotate = |r: usize| (r + size - root) % size;
    let unrotate = |r: usize| (r + root) % size;

    let my = rotate(rank);
    let mut node = KTreeNode::default();
    let mut mask = 1usize;
    while mask < size {
        let step = mask * degree;
        if my % step != 0 {
            let digit = (my / mask) % degree;
            let parent_rotated = my - digit * mask;
            node.parent = Some(unrotate(parent_rotated));
            break;
        }
        mask *= degree;
    }

    // Every level at which `my` is still a multiple of `mask` makes this
    // rank an ancestor at that level; collect children there.
    let mut mask = 1usize;
    let mut children = SmallVec::<[usize; 8]>::new();
    while mask < size {
        if my % (mask * degree) == 0 {
            for digit in 1..degree {
                let child_rotated = my + mask * digit;
                if child_rotated < size {
                    children.push(unrotate(child_rotated));
                }
            }
        } else {
            break;
        }
        mask *= degree;
    }
    if right_most {
        children.reverse();
    }
    node.children = children;
    node
}

/// Computes whether this rank's incoming data must be swapped with its
/// local contribution before reducing, preserving rank order for a
/// non-commutative operator.
///
/// Grounded in `ucg_get_tree_buffer_pos`: a waypoint's children arrive out
/// of rank order relative to the waypoint's own partial result, so a swap
/// is needed whenever the child subtree being merged sits, in rotated rank
/// space, *before* the waypoint performing the merge.
pub fn swap_position(rank: usize, child: usize, root: usize, size: usize) -> bool {
    let rotate = |r: usize| (r + size - root) % size;
    rotate(child) < rotate(rank)
}

/// Builds the fan-in half of a tree collective (gather/reduce-shaped):
/// leaves send once to their parent, waypoints receive from every child
/// then forward to their own parent, and the root only receives.
pub(crate) fn fanin_phase(
    node: &KTreeNode,
    step_index: u8,
    thresh: crate::transport::Thresholds,
    leaf_method: Method,
    root_method: Method,
    waypoint_method: Method,
    my_member: usize,
    root_member: usize,
    size: usize,
    non_commutative: bool,
) -> Phase {
    // `execute_step` sends to `peers[0..ep_counts.send)`, so the send
    // target(s) must come first regardless of role.
    let mut peers = SmallVec::<[usize; 8]>::new();
    let (method, send, recv) = match node.role() {
        TreeRole::Leaf => {
            peers.push(node.parent.expect("leaf has a parent"));
            (leaf_method, 1, 0)
        }
        TreeRole::Root => {
            peers.extend(node.children.iter().copied());
            (root_method, 0, node.children.len())
        }
        TreeRole::Waypoint => {
            peers.push(node.parent.expect("waypoint has a parent"));
            peers.extend(node.children.iter().copied());
            (waypoint_method, 1, node.children.len())
        }
    };
    let mut phase = Phase::new(step_index, method, thresh);
    phase.is_swap = non_commutative
        && node
            .children
            .iter()
            .any(|&child| swap_position(my_member, child, root_member, size));
    phase.peers = peers;
    phase.ep_counts = EpCounts {
        total: phase.peers.len(),
        send,
        recv,
    };
    phase
}

/// Builds the fan-out half of a tree collective (broadcast/scatter-shaped):
/// the root sends to its children with no prior receive, waypoints receive
/// from their parent then relay to their own children, leaves only receive.
pub(crate) fn fanout_phase(
    node: &KTreeNode,
    step_index: u8,
    thresh: crate::transport::Thresholds,
    leaf_method: Method,
    root_method: Method,
    waypoint_method: Method,
) -> Phase {
    // Same convention as `fanin_phase`: send targets occupy `peers[0..send)`.
    let mut peers = SmallVec::<[usize; 8]>::new();
    let (method, send, recv) = match node.role() {
        TreeRole::Leaf => {
            peers.push(node.parent.expect("leaf has a parent"));
            (leaf_method, 0, 1)
        }
        TreeRole::Root => {
            peers.extend(node.children.iter().copied());
            (root_method, node.children.len(), 0)
        }
        TreeRole::Waypoint => {
            peers.extend(node.children.iter().copied());
            peers.push(node.parent.expect("waypoint has a parent"));
            (waypoint_method, node.children.len(), 1)
        }
    };
    let mut phase = Phase::new(step_index, method, thresh);
    phase.peers = peers;
    phase.ep_counts = EpCounts {
        total: phase.peers.len(),
        send,
        recv,
    };
    phase
}

fn degree_for(config: &Config, inter: bool, fanout: bool) -> u32 {
    match (inter, fanout) {
        (true, true) => config.bmtree_degree.inter_fanout,
        (true, false) => config.bmtree_degree.inter_fanin,
        (false, true) => config.bmtree_degree.intra_fanout,
        (false, false) => config.bmtree_degree.intra_fanin,
    }
}

struct BarrierTreeBuilder {
    degree_override: Option<u32>,
}

impl PlanBuilder for BarrierTreeBuilder {
    fn build(
        &self,
        group: &Group,
        _args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let size = group.size();
        let my = group.my_index();
        let root = 0usize;
        let degree = self.degree_override.unwrap_or_else(|| degree_for(config, true, true));
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;

        let fanin = build_knomial(my, root, size, degree, true);
        let fanout = build_knomial(my, root, size, degree, false);

        let phases = vec![
            fanin_phase(
                &fanin,
                0,
                thresh,
                Method::SendTerminal,
                Method::RecvTerminal,
                Method::GatherWaypoint,
                my,
                root,
                size,
                false,
            ),
            fanout_phase(
                &fanout,
                1,
                thresh,
                Method::RecvTerminal,
                Method::BcastWaypoint,
                Method::BcastWaypoint,
            ),
        ];
        Ok(Plan {
            kind: CollectiveKind::Barrier,
            algo: AlgoId::Barrier(if self.degree_override.is_some() {
                BarrierAlgo::Binomial
            } else {
                BarrierAlgo::Knomial
            }),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

struct BcastTreeBuilder;

impl PlanBuilder for BcastTreeBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let root = match args.root() {
            Some(r) => group
                .members()
                .iter()
                .position(|&m| m == r)
                .ok_or_else(|| CoreError::InvalidParam("bcast root not a group member".into()))?,
            None => return Err(CoreError::InvalidParam("bcast requires a root".into())),
        };
        let size = group.size();
        let my = group.my_index();
        let degree = degree_for(config, true, true);
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let tree = build_knomial(my, root, size, degree, false);
        let phase = fanout_phase(
            &tree,
            0,
            thresh,
            Method::RecvTerminal,
            Method::BcastWaypoint,
            Method::BcastWaypoint,
        );
        Ok(Plan {
            kind: CollectiveKind::Bcast,
            algo: AlgoId::Bcast(BcastAlgo::KnomialTree),
            endpoint_count: size.saturating_sub(1),
            phases: vec![phase],
        })
    }
}

struct ReduceTreeBuilder;

impl PlanBuilder for ReduceTreeBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let (root, op) = match args {
            CollectiveArgs::Reduce { root, op, .. } => (*root, *op),
            _ => return Err(CoreError::InvalidParam("expected reduce args".into())),
        };
        let root_idx = group
            .members()
            .iter()
            .position(|&m| m == root)
            .ok_or_else(|| CoreError::InvalidParam("reduce root not a group member".into()))?;
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let tree = build_knomial(my, root_idx, size, 2, true);
        let phase = fanin_phase(
            &tree,
            0,
            thresh,
            Method::SendTerminal,
            Method::ReduceTerminal,
            Method::ReduceWaypoint,
            my,
            root_idx,
            size,
            !op.is_commutative(),
        );
        Ok(Plan {
            kind: CollectiveKind::Reduce,
            algo: AlgoId::Allreduce(AllreduceAlgo::BinomialTree),
            endpoint_count: size.saturating_sub(1),
            phases: vec![phase],
        })
    }
}

struct GatherLinearBuilder {
    scatter: bool,
}

impl PlanBuilder for GatherLinearBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let root = args
            .root()
            .and_then(|r| group.members().iter().position(|&m| m == r))
            .ok_or_else(|| CoreError::InvalidParam("gatherv/scatterv requires a root".into()))?;
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let mut peers = SmallVec::<[usize; 8]>::new();
        let (method, send, recv) = if my == root {
            for idx in 0..size {
                if idx != root {
                    peers.push(idx);
                }
            }
            let n = peers.len();
            if self.scatter {
                (Method::ScatterTerminal, n, 0)
            } else {
                (Method::GatherWaypoint, 0, n)
            }
        } else {
            peers.push(root);
            if self.scatter {
                (Method::RecvTerminal, 0, 1)
            } else {
                (Method::SendTerminal, 1, 0)
            }
        };
        let mut phase = Phase::new(0, method, thresh);
        phase.peers = peers;
        phase.ep_counts = EpCounts {
            total: phase.peers.len(),
            send,
            recv,
        };
        // Only the root's ScatterTerminal phase sends a distinct slice per
        // peer; every other role in this builder sends or receives exactly
        // one message, so there is nothing to scope per peer.
        if self.scatter && my == root {
            if let CollectiveArgs::Scatterv { send_partition, dtype, .. } = args {
                let elem = dtype.extent();
                phase.per_peer_send_bytes = phase
                    .peers
                    .iter()
                    .map(|&idx| (send_partition.displs[idx] * elem, send_partition.counts[idx] * elem))
                    .collect();
            }
        }
        Ok(Plan {
            kind: if self.scatter {
                CollectiveKind::Scatterv
            } else {
                CollectiveKind::Gatherv
            },
            algo: AlgoId::Gather(GatherAlgo::Linear),
            endpoint_count: size.saturating_sub(1),
            phases: vec![phase],
        })
    }
}

/// Registers every algorithm grounded directly in k-nomial/binomial tree
/// construction: barrier (binomial and k-nomial), broadcast (k-nomial
/// tree), small-message reduce (binomial tree), and linear gather/scatter.
pub fn register(table: &mut BuilderTable) {
    table.register(
        CollectiveKind::Barrier,
        AlgoId::Barrier(BarrierAlgo::Binomial),
        Box::new(BarrierTreeBuilder { degree_override: Some(2) }),
    );
    table.register(
        CollectiveKind::Barrier,
        AlgoId::Barrier(BarrierAlgo::Knomial),
        Box::new(BarrierTreeBuilder { degree_override: None }),
    );
    table.register(
        CollectiveKind::Bcast,
        AlgoId::Bcast(BcastAlgo::KnomialTree),
        Box::new(BcastTreeBuilder),
    );
    table.register(
        CollectiveKind::Reduce,
        AlgoId::Allreduce(AllreduceAlgo::BinomialTree),
        Box::new(ReduceTreeBuilder),
    );
    table.register(
        CollectiveKind::Gatherv,
        AlgoId::Gather(GatherAlgo::Linear),
        Box::new(GatherLinearBuilder { scatter: false }),
    );
    table.register(
        CollectiveKind::Scatterv,
        AlgoId::Gather(GatherAlgo::Linear),
        Box::new(GatherLinearBuilder { scatter: true }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_tree_over_eight_ranks() {
        // degree=2, root=0: classic binomial tree.
        let root_node = build_knomial(0, 0, 8, 2, false);
        assert_eq!(root_node.parent, None);
        assert_eq!(root_node.role(), TreeRole::Root);
        assert!(root_node.children.contains(&1));
        assert!(root_node.children.contains(&2));
        assert!(root_node.children.contains(&4));

        let leaf = build_knomial(7, 0, 8, 2, false);
        assert_eq!(leaf.role(), TreeRole::Leaf);
        assert!(leaf.parent.is_some());
    }

    #[test]
    fn every_non_root_rank_has_exactly_one_parent() {
        for rank in 0..13 {
            let node = build_knomial(rank, 3, 13, 3, false);
            if rank == 3 {
                assert!(node.parent.is_none());
            } else {
                assert!(node.parent.is_some());
            }
        }
    }

    #[test]
    fn tree_covers_every_rank_exactly_once() {
        let size = 11;
        let root = 2;
        let mut seen = vec![false; size];
        seen[root] = true;
        let mut frontier = vec![root];
        while let Some(r) = frontier.pop() {
            let node = build_knomial(r, root, size, 4, false);
            for &c in &node.children {
                assert!(!seen[c], "rank {c} reached twice");
                seen[c] = true;
                frontier.push(c);
            }
        }
        assert!(seen.iter().all(|&s| s), "every rank must be reachable from root");
    }

    #[test]
    fn right_most_reverses_child_order_only() {
        let left = build_knomial(0, 0, 16, 4, false);
        let right = build_knomial(0, 0, 16, 4, true);
        let mut left_sorted: Vec<_> = left.children.iter().copied().collect();
        let mut right_sorted: Vec<_> = right.children.iter().copied().collect();
        left_sorted.sort_unstable();
        right_sorted.sort_unstable();
        assert_eq!(left_sorted, right_sorted);
        assert_ne!(left.children.to_vec(), right.children.to_vec());
    }

    #[test]
    fn swap_position_orders_by_rotated_rank() {
        assert!(swap_position(4, 1, 0, 8));
        assert!(!swap_position(1, 4, 0, 8));
        assert!(!swap_position(3, 3, 0, 8));
    }
}
