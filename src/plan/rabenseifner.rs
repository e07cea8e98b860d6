//! Rabenseifner's allreduce: reduce-scatter by recursive halving followed
//! by allgather by recursive doubling, over binary blocks of the element
//! count.
//!
//! Block offsets depend on the live element count, which a cached plan
//! does not know in advance (the same plan may be reused across
//! invocations with different counts), so every phase here is marked
//! [`InitPhaseKind::Rabenseifner`]: the step executor recomputes
//! `(block_index, block_count, total_blocks)` into absolute byte ranges
//! from the op's live args immediately before the phase runs, per the
//! "phase view" design note. Non-power-of-two group sizes reuse the same
//! proxy/extra relay this crate's classic recursive doubling uses (base
//! §4.2.3's "successive set bits of p" grouping, generalized the same
//! way as [`crate::plan::recursive`]).

use smallvec::smallvec;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::recursive::{classify, core_steps, untranslate, RdRole};
use crate::plan::trees::{fanin_phase, fanout_phase, build_knomial};
use crate::plan::{EpCounts, InitPhaseKind, Method, Phase, PhaseExtra, Plan};
use crate::transport::Thresholds;
use crate::wire::{AllreduceAlgo, AlgoId, CollectiveKind};

fn pow2_core(size: usize) -> usize {
    if size.is_power_of_two() {
        size
    } else {
        size.next_power_of_two() / 2
    }
}

fn relay_phase(step_index: u8, method: Method, peer: usize, send: usize, recv: usize, thresh: Thresholds) -> Phase {
    let mut phase = Phase::new(step_index, method, thresh);
    phase.peers = smallvec![peer];
    phase.ep_counts = EpCounts { total: 1, send, recv };
    phase
}

fn core_phase(step_index: u8, method: Method, peer: usize, block_index: usize, block_count: usize, total_blocks: usize, thresh: Thresholds) -> Phase {
    let mut phase = Phase::new(step_index, method, thresh);
    phase.peers = smallvec![peer];
    phase.ep_counts = EpCounts { total: 1, send: 1, recv: 1 };
    phase.extra = PhaseExtra {
        block_index,
        block_count,
        total_blocks,
        ..PhaseExtra::default()
    };
    phase.init_phase = Some(InitPhaseKind::Rabenseifner);
    phase
}

/// Builds the binary-block reduce-scatter-then-allgather phase sequence
/// for one rank, reusing the classic recursive-doubling classification
/// for the relay/core split.
fn build_core_phases(my: usize, size: usize, thresh: Thresholds) -> Vec<Phase> {
    let pow2 = pow2_core(size);
    let n = core_steps(size);
    let mut phases = Vec::new();
    let mut idx = 0u8;
    match classify(my, size) {
        RdRole::Extra { proxy } => {
            phases.push(relay_phase(idx, Method::SendTerminal, proxy, 1, 0, thresh));
            idx += 1;
            phases.push(relay_phase(idx, Method::ReduceTerminal, proxy, 0, 1, thresh));
        }
        RdRole::Proxy { extra, new_rank } => {
            phases.push(relay_phase(idx, Method::ReduceTerminal, extra, 0, 1, thresh));
            idx += 1;
            for s in 0..n {
                let dist = 1usize << (n - 1 - s);
                let peer = untranslate(new_rank ^ dist, size);
                let block_count = pow2 >> (s + 1);
                phases.push(core_phase(idx, Method::ReduceScatterRecursive, peer, 0, block_count.max(1), pow2, thresh));
                idx += 1;
            }
            for s in 0..n {
                let dist = 1usize << s;
                let peer = untranslate(new_rank ^ dist, size);
                let block_count = pow2 >> (n - s - 1);
                phases.push(core_phase(idx, Method::AllgatherRecursive, peer, 0, block_count.max(1), pow2, thresh));
                idx += 1;
            }
            phases.push(relay_phase(idx, Method::SendTerminal, extra, 1, 0, thresh));
        }
        RdRole::Base { new_rank } => {
            for s in 0..n {
                let dist = 1usize << (n - 1 - s);
                let peer = untranslate(new_rank ^ dist, size);
                let block_count = pow2 >> (s + 1);
                phases.push(core_phase(idx, Method::ReduceScatterRecursive, peer, 0, block_count.max(1), pow2, thresh));
                idx += 1;
            }
            for s in 0..n {
                let dist = 1usize << s;
                let peer = untranslate(new_rank ^ dist, size);
                let block_count = pow2 >> (n - s - 1);
                phases.push(core_phase(idx, Method::AllgatherRecursive, peer, 0, block_count.max(1), pow2, thresh));
                idx += 1;
            }
        }
    }
    phases
}

struct RabenseifnerBuilder;

impl PlanBuilder for RabenseifnerBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let op = match args {
            CollectiveArgs::Allreduce { op, .. } => *op,
            _ => return Err(CoreError::InvalidParam("expected allreduce args".into())),
        };
        if !op.is_commutative() {
            return Err(CoreError::Unsupported {
                kind: CollectiveKind::Allreduce,
                algo: AlgoId::Allreduce(AllreduceAlgo::Rabenseifner),
                reason: "non-commutative",
            });
        }
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        if size < 2 {
            return Err(CoreError::Unsupported {
                kind: CollectiveKind::Allreduce,
                algo: AlgoId::Allreduce(AllreduceAlgo::Rabenseifner),
                reason: "needs at least 2 ranks",
            });
        }
        let phases = build_core_phases(my, size, thresh);
        Ok(Plan {
            kind: CollectiveKind::Allreduce,
            algo: AlgoId::Allreduce(AllreduceAlgo::Rabenseifner),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

struct NodeAwareBuilder;

impl PlanBuilder for NodeAwareBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let op = match args {
            CollectiveArgs::Allreduce { op, .. } => *op,
            _ => return Err(CoreError::InvalidParam("expected allreduce args".into())),
        };
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let node_leaders = group.node_leaders();
        let my_node_leader = group.local_members().first().copied().unwrap_or(my);
        // Intra-node members are renumbered 0..n for the tree helper.
        let local = group.local_members();
        let local_pos = local.iter().position(|&m| m == my).expect("my rank is local to itself");
        let leader_pos = local.iter().position(|&m| m == my_node_leader).unwrap_or(0);

        let mut phases = Vec::new();
        let intra_tree = build_knomial(local_pos, leader_pos, local.len(), config.bmtree_degree.intra_fanin, true);
        let intra_tree = remap_tree(intra_tree, local);
        phases.push(fanin_phase(
            &intra_tree,
            0,
            thresh,
            Method::SendTerminal,
            Method::ReduceTerminal,
            Method::ReduceWaypoint,
            my,
            my_node_leader,
            group.size(),
            !op.is_commutative(),
        ));

        if my == my_node_leader {
            let leader_idx = node_leaders.iter().position(|&m| m == my).expect("leader is its own node's leader");
            let core = build_core_phases(leader_idx, node_leaders.len(), thresh);
            for (i, mut phase) in core.into_iter().enumerate() {
                phase.step_index = (1 + i) as u8;
                phase.peers = phase.peers.iter().map(|&p| node_leaders[p]).collect();
                phases.push(phase);
            }
        }

        let next_step = phases.len() as u8;
        let fanout_tree = build_knomial(local_pos, leader_pos, local.len(), config.bmtree_degree.intra_fanout, false);
        let fanout_tree = remap_tree(fanout_tree, local);
        phases.push(fanout_phase(
            &fanout_tree,
            next_step,
            thresh,
            Method::RecvTerminal,
            Method::BcastWaypoint,
            Method::BcastWaypoint,
        ));

        Ok(Plan {
            kind: CollectiveKind::Allreduce,
            algo: AlgoId::Allreduce(AllreduceAlgo::NodeAwareRecursiveAndBmtree),
            endpoint_count: group.size().saturating_sub(1),
            phases,
        })
    }
}

fn remap_tree(tree: crate::plan::trees::KTreeNode, local: &[usize]) -> crate::plan::trees::KTreeNode {
    crate::plan::trees::KTreeNode {
        parent: tree.parent.map(|p| local[p]),
        children: tree.children.iter().map(|&c| local[c]).collect(),
    }
}

/// Registers Rabenseifner and the node-aware hybrid under allreduce.
pub fn register(table: &mut BuilderTable) {
    table.register(
        CollectiveKind::Allreduce,
        AlgoId::Allreduce(AllreduceAlgo::Rabenseifner),
        Box::new(RabenseifnerBuilder),
    );
    table.register(
        CollectiveKind::Allreduce,
        AlgoId::Allreduce(AllreduceAlgo::NodeAwareRecursiveAndBmtree),
        Box::new(NodeAwareBuilder),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_block_halves_then_doubles() {
        let size = 8;
        let phases = build_core_phases(0, size, Thresholds {
            max_short_one: 0,
            max_short_max: 0,
            max_bcopy_one: 0,
            max_bcopy_max: 0,
            max_zcopy_one: 0,
            md_max_reg: 0,
        });
        let halving: Vec<_> = phases.iter().filter(|p| p.method == Method::ReduceScatterRecursive).collect();
        let doubling: Vec<_> = phases.iter().filter(|p| p.method == Method::AllgatherRecursive).collect();
        assert_eq!(halving.len(), 3);
        assert_eq!(doubling.len(), 3);
        assert!(halving.windows(2).all(|w| w[0].extra.block_count >= w[1].extra.block_count));
        assert!(doubling.windows(2).all(|w| w[0].extra.block_count <= w[1].extra.block_count));
    }
}
